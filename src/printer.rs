//! Console printing.
//!
//! The `Printer` serializes writes to the UART behind a spinlock so that
//! concurrent `println!` calls from different harts interleave at line
//! granularity instead of byte granularity. The panic handler prints
//! through the same `Printer`, bypassing the lock if this hart already
//! holds it (see `Printer::force_unlock`), so a panic while mid-`println!`
//! still gets its message out.

use core::fmt;

use crate::hal::Uart;
use crate::lock::Spinlock;

pub struct Printer {
    uart: &'static dyn Uart,
}

impl Printer {
    pub const fn new(uart: &'static dyn Uart) -> Self {
        Self { uart }
    }
}

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            self.uart.putc(b);
        }
        Ok(())
    }
}

/// Global printer, installed once at boot by `crate::kernel::init`.
pub static PRINTER: Spinlock<Option<Printer>> = Spinlock::new("printer", None);

pub fn install(printer: Printer) {
    *PRINTER.lock() = Some(printer);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    if let Some(p) = PRINTER.lock().as_mut() {
        let _ = p.write_fmt(args);
    }
}

/// Prints to the console without holding any lock, for use from the panic
/// handler where the printer lock may already be held by this hart.
#[doc(hidden)]
pub fn _print_unlocked(args: fmt::Arguments<'_>) {
    use fmt::Write;
    // SAFETY: only called from the panic path, which never returns, so a
    // torn interleaving with a concurrently panicking hart is the worst
    // outcome and is preferable to deadlocking on our own lock.
    let printer = unsafe { &mut *PRINTER.get_mut_raw() };
    if let Some(p) = printer.as_mut() {
        let _ = p.write_fmt(args);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printer::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::println!("[info] {}", core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::println!("[warn] {}", core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::println!("[error] {}", core::format_args!($($arg)*))
    };
}
