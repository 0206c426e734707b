/// Upper bound on simultaneously existing PCBs, including the kernel process.
pub const MAX_PROCESSES: usize = 64;
pub const MAX_CHILDREN: usize = 16;
pub const PROCESS_NAME_LEN: usize = 32;

pub const STACK_SIZE: usize = 4096; // 1 page per process stack

/// Initial EFLAGS of a new process: reserved bit 1 plus IF.
pub const INITIAL_EFLAGS: u32 = 0x202;

/// Ticks granted per dispatch. Stored for bookkeeping; the scheduler is cooperative.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Exit code recorded for processes terminated with `kill`.
pub const KILLED_EXIT_CODE: i32 = -1;
