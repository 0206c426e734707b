use alloc::boxed::Box;
use core::fmt;
use core::ptr::NonNull;

use arrayvec::{ArrayString, ArrayVec};

use crate::constants::processes::{DEFAULT_TIME_SLICE, MAX_CHILDREN, PROCESS_NAME_LEN};
use crate::memory::address::VirtAddr;
use crate::processes::registers::Context;

/// Process identifier. Handed out in increasing order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// The kernel pseudo-process that runs whenever nothing else does.
    pub const KERNEL: Pid = Pid(0);

    pub const fn new(pid: u32) -> Self {
        Pid(pid)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot reserved, not yet schedulable.
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Recorded per process; the round-robin scheduler does not look at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn time_slice(self) -> u32 {
        match self {
            Priority::Low => DEFAULT_TIME_SLICE / 2,
            Priority::Normal => DEFAULT_TIME_SLICE,
            Priority::High => DEFAULT_TIME_SLICE * 2,
        }
    }
}

/// Code a process runs on its first dispatch.
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// A process stack allocated from the kernel heap.
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    vaddr: VirtAddr,
    size: usize,
}

// A stack is owned by exactly one PCB and only freed through the heap lock.
unsafe impl Send for Stack {}

impl Stack {
    /// `base` is where the kernel accesses the block, `vaddr` its address in
    /// the heap range.
    pub fn new(base: NonNull<u8>, vaddr: VirtAddr, size: usize) -> Self {
        Stack { base, vaddr, size }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Highest 16-byte aligned address inside the stack.
    pub fn top(&self) -> u32 {
        (self.vaddr.as_u32() + self.size as u32) & !0xF
    }
}

pub struct Pcb {
    pub pid: Pid,
    pub name: ArrayString<PROCESS_NAME_LEN>,
    pub state: ProcessState,
    pub priority: Priority,
    pub context: Context,
    pub(crate) stack: Option<Stack>,
    pub(crate) entry: Option<Entry>,
    pub time_slice: u32,
    /// Ticks spent running.
    pub cpu_time: u64,
    /// Tick count at the last dispatch.
    pub(crate) dispatched_at: u64,
    pub exit_code: Option<i32>,
    pub parent: Option<Pid>,
    pub children: ArrayVec<Pid, MAX_CHILDREN>,
}

impl Pcb {
    pub fn new(pid: Pid, name: &str, priority: Priority, parent: Option<Pid>) -> Self {
        Pcb {
            pid,
            name: truncated_name(name),
            state: ProcessState::New,
            priority,
            context: Context::default(),
            stack: None,
            entry: None,
            time_slice: priority.time_slice(),
            cpu_time: 0,
            dispatched_at: 0,
            exit_code: None,
            parent,
            children: ArrayVec::new(),
        }
    }
}

impl fmt::Debug for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pcb")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("context", &self.context)
            .field("cpu_time", &self.cpu_time)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

/// Names longer than the inline buffer are cut at a character boundary.
fn truncated_name(name: &str) -> ArrayString<PROCESS_NAME_LEN> {
    let mut truncated = ArrayString::new();
    for c in name.chars() {
        if truncated.try_push(c).is_err() {
            break;
        }
    }
    truncated
}

/// Read-only snapshot of a PCB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: ArrayString<PROCESS_NAME_LEN>,
    pub state: ProcessState,
    pub priority: Priority,
    pub cpu_time: u64,
    pub exit_code: Option<i32>,
    pub parent: Option<Pid>,
    pub children: ArrayVec<Pid, MAX_CHILDREN>,
}

impl From<&Pcb> for ProcessInfo {
    fn from(pcb: &Pcb) -> Self {
        ProcessInfo {
            pid: pcb.pid,
            name: pcb.name,
            state: pcb.state,
            priority: pcb.priority,
            cpu_time: pcb.cpu_time,
            exit_code: pcb.exit_code,
            parent: pcb.parent,
            children: pcb.children.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// Every slot is in use.
    TableFull,
    /// No heap memory for the stack.
    OutOfMemory,
    NoSuchProcess(Pid),
    /// The kernel pseudo-process cannot exit, be killed or block.
    KernelProcess,
    AlreadyTerminated(Pid),
    NotBlocked(Pid),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::TableFull => write!(f, "Process table is full"),
            ProcessError::OutOfMemory => write!(f, "Out of memory for process stack"),
            ProcessError::NoSuchProcess(pid) => write!(f, "No process with pid {}", pid),
            ProcessError::KernelProcess => write!(f, "Operation not allowed on the kernel process"),
            ProcessError::AlreadyTerminated(pid) => write!(f, "Process {} already terminated", pid),
            ProcessError::NotBlocked(pid) => write!(f, "Process {} is not blocked", pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_names_are_truncated() {
        let pcb = Pcb::new(Pid::new(1), "a-process-name-well-over-thirty-two-bytes", Priority::Low, None);
        assert_eq!(pcb.name.len(), PROCESS_NAME_LEN);
        assert!(pcb.name.starts_with("a-process-name"));
    }

    #[test]
    fn test_multibyte_name_cut_on_char_boundary() {
        let name: alloc::string::String = core::iter::repeat('é').take(20).collect();
        let pcb = Pcb::new(Pid::new(1), &name, Priority::Normal, None);
        assert_eq!(pcb.name.chars().count(), 16);
    }

    #[test]
    fn test_stack_top_is_aligned() {
        let stack = Stack::new(NonNull::dangling(), VirtAddr::new(0x0040_0010), 4096);
        assert_eq!(stack.top(), 0x0040_1010);
        let odd = Stack::new(NonNull::dangling(), VirtAddr::new(0x0040_0018), 4096);
        assert_eq!(odd.top(), 0x0040_1010);
    }

    #[test]
    fn test_priority_time_slices() {
        assert!(Priority::High.time_slice() > Priority::Normal.time_slice());
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
