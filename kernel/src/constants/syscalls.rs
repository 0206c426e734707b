// Syscall numbers, passed in eax through the int 0x80 gate
pub const SYS_EXIT: u32 = 1;
pub const SYS_GETPID: u32 = 2;
pub const SYS_YIELD: u32 = 3;

/// Returned in eax for unknown syscall numbers.
pub const ENOSYS: i32 = -38;
