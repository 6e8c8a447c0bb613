// Kernel logging. Formatted output goes to a boot ring buffer and, once a
// console has been installed, to the console sink as well.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::{Mutex, Once};

use super::ringbuf::RingBuf;

/// Log severity, numerically ordered so the filter is a single compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Emergency = 1,
    Critical = 2,
    Error = 3,
    Warn = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

/// Console output sink. The platform installs one during bring-up (serial
/// on PC); tests leave it empty and read the ring instead.
pub trait Console: Send + Sync {
    fn write(&self, s: &str);
}

static CONSOLE: Once<&'static dyn Console> = Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

const LOG_RING_SIZE: usize = 16384;
static LOG_RING: Mutex<RingBuf<LOG_RING_SIZE>> = Mutex::new(RingBuf::new());

struct RingWriter<'a> {
    ring: &'a mut RingBuf<LOG_RING_SIZE>,
}

impl fmt::Write for RingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.ring.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Installs the console sink. Later installs are ignored.
pub fn set_console(cons: &'static dyn Console) {
    CONSOLE.call_once(|| cons);
}

pub fn set_log_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Core log entry point used by the macros.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if level as u8 > MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    {
        let mut ring = LOG_RING.lock();
        let mut writer = RingWriter { ring: &mut ring };
        let _ = writer.write_fmt(args);
        let _ = writer.write_str("\n");
    }
    if let Some(cons) = CONSOLE.get() {
        struct ConsWriter<'a>(&'a dyn Console);
        impl fmt::Write for ConsWriter<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                self.0.write(s);
                Ok(())
            }
        }
        let mut writer = ConsWriter(*cons);
        let _ = writer.write_fmt(args);
        let _ = writer.write_str("\n");
    }
}

/// Snapshot of the boot log, oldest line first.
pub fn log_contents() -> alloc::vec::Vec<u8> {
    LOG_RING.lock().contents()
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::klib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_goes_to_ring() {
        log(LogLevel::Info, format_args!("hello {}", 42));
        let contents = log_contents();
        let text = core::str::from_utf8(&contents).unwrap();
        assert!(text.contains("hello 42"));
    }
}
