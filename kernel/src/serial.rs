//! COM1 serial console.
//!
//! Standard 16550 programming over port I/O; this is the default
//! `Console` implementation on bare metal and the sink behind the log
//! facade. The host build keeps the type (the register arithmetic is
//! testable) but its port accesses are inert.

use core::fmt;

use crate::{arch::x86::cpu, dev::Console, sync::SpinLock};

const COM1: u16 = 0x3F8;

const REG_DATA: u16 = 0;
const REG_INTR_ENABLE: u16 = 1;
const REG_DIVISOR_LO: u16 = 0;
const REG_DIVISOR_HI: u16 = 1;
const REG_FIFO_CTRL: u16 = 2;
const REG_LINE_CTRL: u16 = 3;
const REG_MODEM_CTRL: u16 = 4;
const REG_LINE_STATUS: u16 = 5;

const LSR_DATA_READY: u8 = 1 << 0;
const LSR_TX_EMPTY: u8 = 1 << 5;

/// A 16550 UART at a fixed port base.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        SerialPort { base }
    }

    /// 115200 baud, 8N1, FIFOs on.
    pub fn init(&self) {
        cpu::outb(self.base + REG_INTR_ENABLE, 0x00);
        cpu::outb(self.base + REG_LINE_CTRL, 0x80); // DLAB
        cpu::outb(self.base + REG_DIVISOR_LO, 0x01);
        cpu::outb(self.base + REG_DIVISOR_HI, 0x00);
        cpu::outb(self.base + REG_LINE_CTRL, 0x03);
        cpu::outb(self.base + REG_FIFO_CTRL, 0xC7);
        cpu::outb(self.base + REG_MODEM_CTRL, 0x0B);
    }

    pub fn write_byte(&self, b: u8) {
        while cpu::inb(self.base + REG_LINE_STATUS) & LSR_TX_EMPTY == 0 {
            core::hint::spin_loop();
            // The host stub always reads 0; do not spin there.
            #[cfg(not(all(target_arch = "x86", target_os = "none")))]
            break;
        }
        cpu::outb(self.base + REG_DATA, b);
    }

    pub fn read_byte(&self) -> Option<u8> {
        if cpu::inb(self.base + REG_LINE_STATUS) & LSR_DATA_READY != 0 {
            Some(cpu::inb(self.base + REG_DATA))
        } else {
            None
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

/// The boot console.
pub static COM1_PORT: SpinLock<SerialPort> = SpinLock::new(SerialPort::new(COM1));

struct SerialConsole;

impl Console for SerialConsole {
    fn putc(&self, c: u8) {
        COM1_PORT.lock().write_byte(c);
    }

    fn getc(&self) -> Option<u8> {
        COM1_PORT.lock().read_byte()
    }
}

static SERIAL_CONSOLE: SerialConsole = SerialConsole;

/// Program the UART and install it as the system console.
pub fn init() {
    COM1_PORT.lock().init();
    crate::dev::register_console(&SERIAL_CONSOLE);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = COM1_PORT.lock().write_fmt(args);
}
