//! Kernel logging
//!
//! Log records are captured in a fixed-size ring buffer and mirrored to the
//! serial console once one has been initialised. Formatting goes through
//! `core::fmt::Write` into a fixed stack buffer, so logging never allocates
//! and is usable from any context that may take the log lock.
//!
//! Subsystems tag their messages with a short bracketed prefix:
//!
//! ```text
//! [  123ms INFO ] [PIC] remapped IRQ 0-15 to vectors 32-47
//! ```

use core::fmt::{self, Write};
use spin::Mutex;

/// Maximum formatted length of a single record; longer messages truncate.
pub const MAX_MESSAGE_LEN: usize = 128;

/// Number of records retained in the ring.
const LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// One captured log record
#[derive(Clone, Copy)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: [u8; MAX_MESSAGE_LEN],
    pub len: usize,
}

impl LogEntry {
    pub fn text(&self) -> &[u8] {
        &self.message[..self.len]
    }
}

/// Fixed-capacity record ring; oldest entries are overwritten when full.
struct LogRing {
    entries: [Option<LogEntry>; LOG_CAPACITY],
    next: usize,
    stored: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            entries: [None; LOG_CAPACITY],
            next: 0,
            stored: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.next] = Some(entry);
        self.next = (self.next + 1) % LOG_CAPACITY;
        if self.stored < LOG_CAPACITY {
            self.stored += 1;
        }
    }

    fn len(&self) -> usize {
        self.stored
    }

    fn latest(&self) -> Option<&LogEntry> {
        if self.stored == 0 {
            return None;
        }
        let idx = (self.next + LOG_CAPACITY - 1) % LOG_CAPACITY;
        self.entries[idx].as_ref()
    }
}

static KERNEL_LOG: Mutex<LogRing> = Mutex::new(LogRing::new());

/// Bounded formatting adapter: overflow truncates instead of failing.
struct FixedWriter {
    buf: [u8; MAX_MESSAGE_LEN],
    len: usize,
}

impl FixedWriter {
    fn new() -> Self {
        Self {
            buf: [0; MAX_MESSAGE_LEN],
            len: 0,
        }
    }
}

impl Write for FixedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = MAX_MESSAGE_LEN - self.len;
        let take = core::cmp::min(room, s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Record a message at the given level.
///
/// Normally reached through the `kerror!`/`kwarn!`/`kinfo!`/`kdebug!`
/// macros rather than called directly.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    let mut writer = FixedWriter::new();
    let _ = writer.write_fmt(args);

    let timestamp_ms = crate::time::uptime_ms();
    let entry = LogEntry {
        timestamp_ms,
        level,
        message: writer.buf,
        len: writer.len,
    };

    KERNEL_LOG.lock().push(entry);

    // Mirror to the console; a no-op until the serial port is up.
    let mut header = FixedWriter::new();
    let _ = write!(header, "[{:>6}ms {:<5}] ", timestamp_ms, level.as_str());
    crate::arch::console_write(&header.buf[..header.len]);
    crate::arch::console_write(entry.text());
    crate::arch::console_write(b"\n");
}

/// Number of records currently retained.
pub fn retained() -> usize {
    KERNEL_LOG.lock().len()
}

/// Copy of the most recent record, if any.
pub fn latest() -> Option<LogEntry> {
    KERNEL_LOG.lock().latest().copied()
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::klog::log($crate::klog::LogLevel::Debug, format_args!($($arg)*))
    };
}
