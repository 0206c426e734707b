#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod arch;
pub mod config;
pub mod constants;
pub mod devices;
pub mod init;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod syscalls;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

/// [`serial_print!`] that only prints in debug builds.
#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::serial_print!($($arg)*);
        }
    }
}

/// [`serial_println!`] that only prints in debug builds.
#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::serial_println!($($arg)*);
        }
    }
}

/// Halts until the next interrupt, forever.
#[cfg(target_os = "none")]
pub fn idle_loop() -> ! {
    loop {
        // SAFETY: hlt only waits for an interrupt
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}
