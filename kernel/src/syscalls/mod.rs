//! System call entry.
//!
//! The `int 0x80` gate passes the call number in eax and one argument in ebx;
//! the result goes back in eax.

pub mod syscall_handlers;

pub use syscall_handlers::dispatch;
