//! # Input pipeline
//!
//! The path from the keyboard IRQ to a line-oriented consumer:
//!
//! ```text
//! IRQ 1 handler ──► scancode ring (lock-free SPSC, drop when full)
//!                        │  drained by the consumer, no lock
//!                        ▼
//!                 translator FSM ──► input byte ring
//!                 (modifier latches; both under the input spinlock,
//!                  the translator mutates shared state)
//!                        ▼
//!            has_char / read_char / read_line
//! ```
//!
//! The raw byte splits into `(code = byte & 0x7F, pressed = !(byte &
//! 0x80))`; the 0xE0 prefix is published verbatim as a one-shot
//! extended marker consumed by the next event. Scancodes are consumed
//! strictly in arrival order, and translated bytes enter the input
//! buffer in that same order.
//!
//! `read_line` is the core's only blocking API: it idles in `hlt`
//! between drains and resumes on any interrupt.

pub mod keymap;
pub mod ring;

use spin::Mutex;

use self::ring::SpscRing;

/// Scancode ring capacity (power of two)
pub const SCANCODE_RING_CAPACITY: usize = 256;

/// Translated-byte ring capacity (power of two)
pub const INPUT_BUFFER_CAPACITY: usize = 256;

/// Extended-prefix marker byte
pub const EXTENDED_PREFIX: u8 = 0xE0;

// Scancode set 1 make codes the FSM treats specially
const SC_ESC: u8 = 0x01;
const SC_BACKSPACE: u8 = 0x0E;
const SC_TAB: u8 = 0x0F;
const SC_ENTER: u8 = 0x1C;
const SC_LCTRL: u8 = 0x1D;
const SC_LSHIFT: u8 = 0x2A;
const SC_RSHIFT: u8 = 0x36;
const SC_LALT: u8 = 0x38;
const SC_CAPSLOCK: u8 = 0x3A;
const SC_NUMLOCK: u8 = 0x45;
const SC_SCROLLLOCK: u8 = 0x46;

/// One entry in the scancode ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u8,
    pub pressed: bool,
}

impl KeyEvent {
    /// Split a raw data-port byte. 0xE0 comes through verbatim as the
    /// extended marker.
    pub fn from_raw(byte: u8) -> Self {
        if byte == EXTENDED_PREFIX {
            return Self {
                code: EXTENDED_PREFIX,
                pressed: true,
            };
        }
        Self {
            code: byte & 0x7F,
            pressed: byte & 0x80 == 0,
        }
    }
}

/// Keyboard translation state: modifier latches, lock latches, and the
/// one-shot extended flag.
pub struct KeyboardFsm {
    shift: bool,
    ctrl: bool,
    alt: bool,
    capslock: bool,
    numlock: bool,
    scrolllock: bool,
    extended: bool,
}

impl KeyboardFsm {
    pub const fn new() -> Self {
        Self {
            shift: false,
            ctrl: false,
            alt: false,
            capslock: false,
            numlock: false,
            scrolllock: false,
            extended: false,
        }
    }

    pub fn shift(&self) -> bool {
        self.shift
    }

    pub fn ctrl(&self) -> bool {
        self.ctrl
    }

    pub fn alt(&self) -> bool {
        self.alt
    }

    pub fn capslock(&self) -> bool {
        self.capslock
    }

    pub fn numlock(&self) -> bool {
        self.numlock
    }

    pub fn scrolllock(&self) -> bool {
        self.scrolllock
    }

    /// Feed one event through the state machine; returns the translated
    /// byte for press events that produce one.
    pub fn translate(&mut self, event: KeyEvent) -> Option<u8> {
        if event.code == EXTENDED_PREFIX {
            self.extended = true;
            return None;
        }
        let extended = core::mem::take(&mut self.extended);

        if !event.pressed {
            match event.code {
                SC_LSHIFT | SC_RSHIFT => self.shift = false,
                SC_LCTRL => self.ctrl = false,
                SC_LALT => self.alt = false,
                _ => {}
            }
            return None;
        }

        match event.code {
            SC_LSHIFT | SC_RSHIFT => {
                self.shift = true;
                None
            }
            SC_LCTRL => {
                self.ctrl = true;
                None
            }
            SC_LALT => {
                self.alt = true;
                None
            }
            SC_CAPSLOCK => {
                self.capslock = !self.capslock;
                None
            }
            SC_NUMLOCK => {
                self.numlock = !self.numlock;
                None
            }
            SC_SCROLLLOCK => {
                self.scrolllock = !self.scrolllock;
                None
            }
            SC_ENTER => Some(b'\n'),
            SC_BACKSPACE => Some(0x08),
            SC_TAB => Some(b'\t'),
            SC_ESC => Some(0x1B),
            code if code < 128 => {
                if extended {
                    // Extended make codes (arrows, navigation) have no
                    // character here.
                    return None;
                }
                let ch = if self.shift {
                    keymap::SHIFTED[code as usize]
                } else {
                    keymap::NORMAL[code as usize]
                };
                if ch == 0 {
                    return None;
                }
                Some(self.apply_capslock(ch))
            }
            _ => None,
        }
    }

    /// Caps-lock inverts the case of letters: lowercase from the normal
    /// table goes up, uppercase from the shifted table comes down.
    fn apply_capslock(&self, ch: u8) -> u8 {
        if !self.capslock {
            return ch;
        }
        if ch.is_ascii_lowercase() {
            ch.to_ascii_uppercase()
        } else if ch.is_ascii_uppercase() {
            ch.to_ascii_lowercase()
        } else {
            ch
        }
    }
}

/// Fixed byte ring for translated characters; lives under the input
/// spinlock, drops when full.
struct ByteRing {
    buf: [u8; INPUT_BUFFER_CAPACITY],
    head: usize,
    tail: usize,
}

impl ByteRing {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUFFER_CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.tail.wrapping_sub(self.head) == INPUT_BUFFER_CAPACITY {
            return; // full: drop
        }
        self.buf[self.tail & (INPUT_BUFFER_CAPACITY - 1)] = byte;
        self.tail = self.tail.wrapping_add(1);
    }

    fn pop(&mut self) -> Option<u8> {
        if self.head == self.tail {
            return None;
        }
        let byte = self.buf[self.head & (INPUT_BUFFER_CAPACITY - 1)];
        self.head = self.head.wrapping_add(1);
        Some(byte)
    }

    fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head)
    }
}

/// Translator state and character buffer, one lock around both: the
/// translator mutates the latches on the way in.
struct InputState {
    fsm: KeyboardFsm,
    buffer: ByteRing,
    echo: Option<fn(u8)>,
}

/// The whole pipeline. One global instance serves the kernel; tests
/// build their own.
pub struct InputQueue {
    scancodes: SpscRing<KeyEvent, SCANCODE_RING_CAPACITY>,
    state: Mutex<InputState>,
}

impl InputQueue {
    pub const fn new() -> Self {
        Self {
            scancodes: SpscRing::new(),
            state: Mutex::new(InputState {
                fsm: KeyboardFsm::new(),
                buffer: ByteRing::new(),
                echo: None,
            }),
        }
    }

    /// Producer side, IRQ context: split and enqueue one raw byte.
    /// A full ring drops the datum silently; losing a keystroke beats
    /// deadlocking the interrupt path.
    pub fn push_raw_byte(&self, byte: u8) {
        let _ = self.scancodes.push(KeyEvent::from_raw(byte));
    }

    /// Consumer side: drain the scancode ring (no lock, single
    /// consumer) and run each event through the translator under the
    /// input lock.
    pub fn process_pending(&self) {
        while let Some(event) = self.scancodes.pop() {
            let mut state = self.state.lock();
            if let Some(ch) = state.fsm.translate(event) {
                state.buffer.push(ch);
            }
        }
    }

    /// Install the echo sink used by `read_line` (the console boundary).
    pub fn set_echo(&self, echo: fn(u8)) {
        self.state.lock().echo = Some(echo);
    }

    /// Drain pending scancodes, then report whether a translated byte
    /// is waiting.
    pub fn has_char(&self) -> bool {
        self.process_pending();
        self.state.lock().buffer.len() > 0
    }

    /// Drain pending scancodes and pop one translated byte.
    pub fn read_char(&self) -> Option<u8> {
        self.process_pending();
        self.state.lock().buffer.pop()
    }

    fn echo_byte(&self, byte: u8) {
        let echo = self.state.lock().echo;
        if let Some(echo) = echo {
            echo(byte);
        }
    }

    /// Read one line into `buf`, blocking in `hlt` between drains.
    ///
    /// Printable characters are echoed; backspace erases visually and
    /// from the buffer; `\n` or `\r` terminates. The buffer is always
    /// NUL-terminated and the returned count excludes the terminator.
    pub fn read_line(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let mut written = 0usize;
        loop {
            while let Some(ch) = self.read_char() {
                match ch {
                    b'\n' | b'\r' => {
                        self.echo_byte(b'\n');
                        buf[written.min(buf.len() - 1)] = 0;
                        return written;
                    }
                    0x08 => {
                        if written > 0 {
                            written -= 1;
                            self.echo_byte(0x08);
                            self.echo_byte(b' ');
                            self.echo_byte(0x08);
                        }
                    }
                    ch => {
                        if written + 1 < buf.len() {
                            buf[written] = ch;
                            written += 1;
                            if (0x20..0x7F).contains(&ch) || ch == b'\t' {
                                self.echo_byte(ch);
                            }
                        }
                    }
                }
            }
            #[cfg(target_arch = "x86_64")]
            crate::interrupts::wait();
        }
    }

    /// Scancodes waiting in the ring (diagnostic).
    pub fn pending_scancodes(&self) -> usize {
        self.scancodes.len()
    }
}

/// The kernel's input pipeline.
static INPUT: InputQueue = InputQueue::new();

/// Access the global pipeline (the keyboard driver's producer side).
pub fn queue() -> &'static InputQueue {
    &INPUT
}

/// IRQ-context producer: push one raw data-port byte.
pub fn push_scancode(byte: u8) {
    INPUT.push_raw_byte(byte);
}

/// Drain and translate anything pending.
pub fn process_pending() {
    INPUT.process_pending();
}

/// True when a translated byte is waiting.
pub fn has_char() -> bool {
    INPUT.has_char()
}

/// Pop one translated byte.
pub fn read_char() -> Option<u8> {
    INPUT.read_char()
}

/// Blocking line read; see [`InputQueue::read_line`].
pub fn read_line(buf: &mut [u8]) -> usize {
    INPUT.read_line(buf)
}

/// Install the console echo sink.
pub fn set_echo(echo: fn(u8)) {
    INPUT.set_echo(echo);
}
