//! Kernel console on COM1.
//!
//! Bare-metal builds drive the UART 16550 directly. Everywhere else the
//! console is the host's stdout, which is what tests and the hosted demo see.

use core::fmt::{self, Write};

use lazy_static::lazy_static;
use spin::Mutex;

#[cfg(target_os = "none")]
type Console = uart_16550::SerialPort;

#[cfg(not(target_os = "none"))]
type Console = HostConsole;

/// Line sink standing in for the UART on a hosted build.
#[cfg(not(target_os = "none"))]
pub struct HostConsole;

#[cfg(not(target_os = "none"))]
impl Write for HostConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::print!("{}", s);
        Ok(())
    }
}

#[cfg(target_os = "none")]
fn open_console() -> Console {
    // SAFETY: COM1 is only ever driven through SERIAL1
    let mut port = unsafe { uart_16550::SerialPort::new(crate::constants::SERIAL_PORT) };
    port.init();
    port
}

#[cfg(not(target_os = "none"))]
fn open_console() -> Console {
    HostConsole
}

lazy_static! {
    /// The console, opened on first use.
    pub static ref SERIAL1: Mutex<Console> = Mutex::new(open_console());
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // nowhere to report a failed console write
    let _ = SERIAL1.lock().write_fmt(args);
}

/// Writes formatted text to the kernel console.
///
/// ```
/// kestrel::serial_print!("pid {} ", 3);
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Like [`serial_print!`], with a trailing newline.
///
/// ```
/// kestrel::serial_println!("heap at {:#x}", 0x0040_0000);
/// ```
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
