//! # Legacy 8259A PIC cascade
//!
//! The PC carries two 8259A controllers wired master/slave: IRQ 0-7 on
//! the master, IRQ 8-15 on the slave, with the slave cascaded into master
//! line 2. The power-on mapping (vectors 0-15) collides with CPU
//! exceptions, so initialisation remaps the pair to vectors 32-47:
//!
//! ```text
//! Master (0x20/0x21)               Slave (0xA0/0xA1)
//! IRQ 0  Timer    -> vector 32     IRQ  8 RTC      -> vector 40
//! IRQ 1  Keyboard -> vector 33     IRQ 12 Mouse    -> vector 44
//! IRQ 2  Cascade  -> vector 34     IRQ 14 ATA 0    -> vector 46
//! ...                              IRQ 15 ATA 1    -> vector 47
//! ```
//!
//! Even on APIC systems the pair stays programmed: when no IO-APIC routes
//! external lines, IRQs still enter through the PIC and its EOI
//! discipline applies (see the interrupt core's EOI matrix).
//!
//! ## EOI discipline
//!
//! For IRQ >= 8 the slave raised the line *through* the master, so the
//! slave is acknowledged first and the master always last.

use spin::Mutex;
use x86_64::instructions::port::Port;

/// Master PIC command/data ports
const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;

/// Slave PIC command/data ports
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

/// Non-specific End of Interrupt command
const CMD_EOI: u8 = 0x20;

/// Read In-Service Register command
const CMD_READ_ISR: u8 = 0x0B;

/// ICW1: edge-triggered, cascade mode, ICW4 follows
const ICW1_INIT: u8 = 0x11;

/// ICW4: 8086/8088 mode
const ICW4_8086: u8 = 0x01;

/// Vector base for master IRQs (0-7)
pub const MASTER_VECTOR_BASE: u8 = 32;

/// Vector base for slave IRQs (8-15)
pub const SLAVE_VECTOR_BASE: u8 = MASTER_VECTOR_BASE + 8;

/// Convert a hardware IRQ number (0-15) to its remapped vector.
pub const fn irq_to_vector(irq: u8) -> u8 {
    if irq < 8 {
        MASTER_VECTOR_BASE + irq
    } else {
        SLAVE_VECTOR_BASE + (irq - 8)
    }
}

/// Convert a remapped vector back to an IRQ number, if it is one.
pub fn vector_to_irq(vector: u8) -> Option<u8> {
    if (MASTER_VECTOR_BASE..MASTER_VECTOR_BASE + 16).contains(&vector) {
        Some(vector - MASTER_VECTOR_BASE)
    } else {
        None
    }
}

/// The cascaded master/slave pair, driven as one unit.
pub struct CascadedPics {
    master_command: Port<u8>,
    master_data: Port<u8>,
    slave_command: Port<u8>,
    slave_data: Port<u8>,
}

impl CascadedPics {
    pub const fn new() -> Self {
        Self {
            master_command: Port::new(MASTER_COMMAND),
            master_data: Port::new(MASTER_DATA),
            slave_command: Port::new(SLAVE_COMMAND),
            slave_data: Port::new(SLAVE_DATA),
        }
    }

    /// Run the ICW1-ICW4 sequence, remapping IRQ 0-15 to vectors 32-47
    /// and leaving every line masked.
    ///
    /// # Safety
    ///
    /// Must run with interrupts disabled.
    pub unsafe fn initialize(&mut self) {
        // ICW1: begin initialisation on both chips
        self.master_command.write(ICW1_INIT);
        io_wait();
        self.slave_command.write(ICW1_INIT);
        io_wait();

        // ICW2: vector offsets
        self.master_data.write(MASTER_VECTOR_BASE);
        io_wait();
        self.slave_data.write(SLAVE_VECTOR_BASE);
        io_wait();

        // ICW3: slave on master line 2, cascade identity 2
        self.master_data.write(0x04);
        io_wait();
        self.slave_data.write(0x02);
        io_wait();

        // ICW4: 8086 mode
        self.master_data.write(ICW4_8086);
        io_wait();
        self.slave_data.write(ICW4_8086);
        io_wait();

        // Mask everything until drivers ask for their lines
        self.master_data.write(0xFF);
        self.slave_data.write(0xFF);
    }

    /// Unmask one IRQ line. Lines 8-15 also unmask the cascade line on
    /// the master, or the slave can never deliver.
    pub unsafe fn enable_irq(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask & !(1 << irq));
        } else {
            let line = irq - 8;
            let mask = self.slave_data.read();
            self.slave_data.write(mask & !(1 << line));

            let master_mask = self.master_data.read();
            self.master_data.write(master_mask & !(1 << 2));
        }
    }

    /// Mask one IRQ line.
    pub unsafe fn disable_irq(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask | (1 << irq));
        } else {
            let line = irq - 8;
            let mask = self.slave_data.read();
            self.slave_data.write(mask | (1 << line));
        }
    }

    /// Acknowledge the IRQ: slave first for lines 8-15, master always.
    pub unsafe fn send_eoi(&mut self, irq: u8) {
        if irq >= 8 {
            self.slave_command.write(CMD_EOI);
        }
        self.master_command.write(CMD_EOI);
    }

    /// Mask every line on both chips.
    pub unsafe fn mask_all(&mut self) {
        self.master_data.write(0xFF);
        self.slave_data.write(0xFF);
    }

    /// Check whether an IRQ 7 / IRQ 15 delivery was a glitch: a real
    /// interrupt leaves the line's bit set in the In-Service Register.
    pub unsafe fn is_spurious(&mut self, irq: u8) -> bool {
        match irq {
            7 => {
                self.master_command.write(CMD_READ_ISR);
                self.master_command.read() & 0x80 == 0
            }
            15 => {
                self.slave_command.write(CMD_READ_ISR);
                self.slave_command.read() & 0x80 == 0
            }
            _ => false,
        }
    }
}

/// Global PIC pair
static PICS: Mutex<CascadedPics> = Mutex::new(CascadedPics::new());

/// Remap the cascade to vectors 32-47 with every line masked.
///
/// # Safety
///
/// Must be called exactly once during boot, with interrupts disabled.
pub unsafe fn init() {
    PICS.lock().initialize();
    crate::kinfo!("[PIC] remapped IRQ 0-15 to vectors 32-47, all masked");
}

/// Unmask an IRQ line.
///
/// # Safety
///
/// A handler should be reachable for the line's vector before unmasking.
pub unsafe fn enable_irq(irq: u8) {
    PICS.lock().enable_irq(irq);
}

/// Mask an IRQ line.
pub unsafe fn disable_irq(irq: u8) {
    PICS.lock().disable_irq(irq);
}

/// Acknowledge an IRQ at the cascade.
///
/// # Safety
///
/// Must be called exactly once per delivered interrupt.
pub unsafe fn send_eoi(irq: u8) {
    PICS.lock().send_eoi(irq);
}

/// Mask everything on both chips.
pub unsafe fn mask_all() {
    PICS.lock().mask_all();
}

/// True when an IRQ 7 / IRQ 15 delivery has no In-Service bit.
pub unsafe fn is_spurious(irq: u8) -> bool {
    PICS.lock().is_spurious(irq)
}

/// Short delay between PIC commands; a write to the unused diagnostic
/// port 0x80 takes long enough on every chipset.
#[inline]
fn io_wait() {
    unsafe {
        Port::<u8>::new(0x80).write(0);
    }
}
