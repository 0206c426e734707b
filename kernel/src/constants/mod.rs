//! System-wide constants and layout values that external collaborators rely on.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

pub mod memory;
pub mod processes;
pub mod syscalls;
