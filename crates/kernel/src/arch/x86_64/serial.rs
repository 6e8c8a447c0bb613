// 16550A serial console on COM1.

use spin::Mutex;
use uart_16550::SerialPort;

use crate::klib::printk::Console;

const COM1: u16 = 0x3F8;

static SERIAL: Mutex<Option<SerialPort>> = Mutex::new(None);

struct SerialConsole;

impl Console for SerialConsole {
    fn write(&self, s: &str) {
        use core::fmt::Write;
        let mut port = SERIAL.lock();
        if let Some(ref mut port) = *port {
            let _ = port.write_str(s);
        }
    }
}

static SERIAL_CONSOLE: SerialConsole = SerialConsole;

/// Brings up COM1 and makes it the kernel console.
pub fn init() {
    let mut port = unsafe { SerialPort::new(COM1) };
    port.init();
    *SERIAL.lock() = Some(port);
    crate::klib::printk::set_console(&SERIAL_CONSOLE);
}
