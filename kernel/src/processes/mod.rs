//! Process table and round-robin scheduler.
//!
//! [`ProcessManager`] is a plain state machine: it decides who runs next and
//! hands back the two contexts to switch between, but never switches itself
//! and never touches the heap. Callers free stacks and perform the switch
//! after dropping the lock around it.

pub mod process;
pub mod registers;

use arrayvec::ArrayVec;

use crate::constants::processes::{INITIAL_EFLAGS, KILLED_EXIT_CODE, MAX_PROCESSES};
use crate::memory::address::PhysAddr;
use crate::serial_println;
use process::{Entry, Pcb, Pid, Priority, ProcessError, ProcessInfo, ProcessState, Stack};
use registers::Context;

/// A slot held in the `New` state until it is admitted or abandoned.
#[must_use]
#[derive(Debug)]
pub struct Reservation {
    slot: usize,
    pid: Pid,
}

impl Reservation {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// Resources a terminated process no longer needs. The stack goes back to the
/// heap; the entry closure, if it never ran, is dropped.
#[must_use]
#[derive(Default)]
pub struct Remains {
    pub stack: Option<Stack>,
    pub entry: Option<Entry>,
}

/// The two contexts a switch goes between. They point into the process table
/// and stay valid until the slots are reclaimed.
#[derive(Debug, Clone, Copy)]
pub struct Switch {
    pub from: *mut Context,
    pub to: *const Context,
    pub from_pid: Pid,
    pub to_pid: Pid,
}

pub struct ProcessManager {
    table: [Option<Pcb>; MAX_PROCESSES],
    /// Slots in FIFO order. Each READY slot appears exactly once.
    ready: ArrayVec<usize, MAX_PROCESSES>,
    current: usize,
    next_pid: u32,
}

impl ProcessManager {
    /// A table holding only the running kernel process, PID 0.
    pub fn new(kernel_directory: PhysAddr) -> Self {
        let mut kernel = Pcb::new(Pid::KERNEL, "kernel", Priority::High, None);
        kernel.state = ProcessState::Running;
        kernel.context.cr3 = kernel_directory.as_u32();

        let mut table: [Option<Pcb>; MAX_PROCESSES] = core::array::from_fn(|_| None);
        table[0] = Some(kernel);

        ProcessManager {
            table,
            ready: ArrayVec::new(),
            current: 0,
            next_pid: 1,
        }
    }

    /// Claims the first free slot and a pid for a new process.
    pub fn reserve(&mut self, name: &str, priority: Priority) -> Result<Reservation, ProcessError> {
        let slot = (1..MAX_PROCESSES)
            .find(|&slot| self.table[slot].is_none())
            .ok_or(ProcessError::TableFull)?;

        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        self.table[slot] = Some(Pcb::new(pid, name, priority, Some(self.current_pid())));

        Ok(Reservation { slot, pid })
    }

    /// Makes a reserved process runnable at the tail of the ready queue.
    ///
    /// It starts at `entry_point` on `stack`, in the creator's address space.
    pub fn admit(&mut self, reservation: Reservation, stack: Stack, entry: Entry, entry_point: u32) {
        let cr3 = self.current_pcb().map_or(0, |pcb| pcb.context.cr3);
        let parent_slot = self.current;
        let Reservation { slot, pid } = reservation;

        let Some(pcb) = self.table[slot].as_mut() else {
            return;
        };
        debug_assert_eq!(pcb.state, ProcessState::New);
        // leave room for the return address the entry trampoline never uses
        pcb.context = Context::for_entry(entry_point, stack.top() - 4, INITIAL_EFLAGS, cr3);
        pcb.stack = Some(stack);
        pcb.entry = Some(entry);
        pcb.state = ProcessState::Ready;
        let name = pcb.name;
        self.ready.push(slot);

        if let Some(parent) = self.table[parent_slot].as_mut() {
            if parent.children.try_push(pid).is_err() {
                log::warn!("process {} has too many children to track {}", parent.pid, pid);
            }
        }
        log::debug!("created process {} ({})", pid, name);
    }

    /// Releases a reserved slot. Its pid is not handed out again.
    pub fn abandon(&mut self, reservation: Reservation) {
        self.table[reservation.slot] = None;
    }

    /// Round robin: the head of the ready queue runs next and the outgoing
    /// process, if it is still running, goes to the tail.
    ///
    /// Returns `None` when nothing else is ready.
    pub fn schedule(&mut self, now: u64) -> Option<Switch> {
        if self.ready.is_empty() {
            return None;
        }
        let next = self.ready.remove(0);
        let prev = self.current;

        if let Some(outgoing) = self.table[prev].as_mut() {
            outgoing.cpu_time += now.saturating_sub(outgoing.dispatched_at);
            if outgoing.state == ProcessState::Running {
                outgoing.state = ProcessState::Ready;
                self.ready.push(prev);
            }
        }

        let incoming = self.table[next].as_mut()?;
        incoming.state = ProcessState::Running;
        incoming.dispatched_at = now;
        let to_pid = incoming.pid;
        let to: *const Context = &incoming.context;
        self.current = next;

        let outgoing = self.table[prev].as_mut()?;
        log::trace!("switch {} -> {}", outgoing.pid, to_pid);
        Some(Switch {
            from: &mut outgoing.context,
            to,
            from_pid: outgoing.pid,
            to_pid,
        })
    }

    /// Terminates the running process with `code`.
    pub fn exit_current(&mut self, code: i32) -> Result<Remains, ProcessError> {
        if self.current == 0 {
            return Err(ProcessError::KernelProcess);
        }
        let slot = self.current;
        Ok(self.terminate(slot, code))
    }

    /// Terminates `pid` with exit code -1. The second value is true when the
    /// caller killed itself and has to switch away.
    pub fn kill(&mut self, pid: Pid) -> Result<(Remains, bool), ProcessError> {
        if pid == Pid::KERNEL {
            return Err(ProcessError::KernelProcess);
        }
        let slot = self.slot_of(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        if self.table[slot].as_ref().map(|pcb| pcb.state) == Some(ProcessState::Terminated) {
            return Err(ProcessError::AlreadyTerminated(pid));
        }

        let remains = self.terminate(slot, KILLED_EXIT_CODE);
        Ok((remains, slot == self.current))
    }

    /// Marks the running process blocked. It stays off the ready queue until
    /// `unblock`.
    pub fn block_current(&mut self) -> Result<(), ProcessError> {
        if self.current == 0 {
            return Err(ProcessError::KernelProcess);
        }
        let slot = self.current;
        if let Some(pcb) = self.table[slot].as_mut() {
            pcb.state = ProcessState::Blocked;
            log::trace!("process {} blocked", pcb.pid);
        }
        Ok(())
    }

    pub fn unblock(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let slot = self.slot_of(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        let pcb = self.table[slot]
            .as_mut()
            .ok_or(ProcessError::NoSuchProcess(pid))?;
        if pcb.state != ProcessState::Blocked {
            return Err(ProcessError::NotBlocked(pid));
        }
        pcb.state = ProcessState::Ready;
        self.ready.push(slot);
        Ok(())
    }

    /// Reclaims the slots of terminated processes other than the running one.
    pub fn cleanup(&mut self) -> usize {
        let mut reclaimed = 0;
        for slot in 1..MAX_PROCESSES {
            if slot == self.current {
                continue;
            }
            let (pid, parent) = match &self.table[slot] {
                Some(pcb) if pcb.state == ProcessState::Terminated => (pcb.pid, pcb.parent),
                _ => continue,
            };

            if let Some(parent_slot) = parent.and_then(|parent| self.slot_of(parent)) {
                if let Some(parent) = self.table[parent_slot].as_mut() {
                    parent.children.retain(|child| *child != pid);
                }
            }
            self.table[slot] = None;
            reclaimed += 1;
        }
        if reclaimed > 0 {
            log::debug!("reclaimed {} process slots", reclaimed);
        }
        reclaimed
    }

    /// Hands the running process its entry closure, once.
    pub fn take_current_entry(&mut self) -> Option<Entry> {
        let slot = self.current;
        self.table[slot].as_mut()?.entry.take()
    }

    pub fn current_pid(&self) -> Pid {
        self.current_pcb().map_or(Pid::KERNEL, |pcb| pcb.pid)
    }

    pub fn find(&self, pid: Pid) -> Option<ProcessInfo> {
        self.slot_of(pid)
            .and_then(|slot| self.table[slot].as_ref())
            .map(ProcessInfo::from)
    }

    pub fn list(&self) -> ArrayVec<ProcessInfo, MAX_PROCESSES> {
        self.table.iter().flatten().map(ProcessInfo::from).collect()
    }

    pub fn count_by_state(&self, state: ProcessState) -> usize {
        self.table
            .iter()
            .flatten()
            .filter(|pcb| pcb.state == state)
            .count()
    }

    /// Pids in the order they will be dispatched.
    pub fn ready_queue(&self) -> ArrayVec<Pid, MAX_PROCESSES> {
        self.ready
            .iter()
            .filter_map(|&slot| self.table[slot].as_ref())
            .map(|pcb| pcb.pid)
            .collect()
    }

    pub fn log_process_table(&self) {
        serial_println!("\nProcess Table Contents:");
        serial_println!("========================");
        for pcb in self.table.iter().flatten() {
            serial_println!(
                "PID {}: {} State: {:?}, Priority: {:?}, CPU: {}, SP: {:#x}, PC: {:#x}",
                pcb.pid,
                pcb.name,
                pcb.state,
                pcb.priority,
                pcb.cpu_time,
                pcb.context.esp,
                pcb.context.eip
            );
        }
        serial_println!("========================");
    }

    fn terminate(&mut self, slot: usize, code: i32) -> Remains {
        self.ready.retain(|queued| *queued != slot);
        let Some(pcb) = self.table[slot].as_mut() else {
            return Remains::default();
        };
        pcb.state = ProcessState::Terminated;
        pcb.exit_code = Some(code);
        log::debug!("process {} terminated with {}", pcb.pid, code);
        Remains {
            stack: pcb.stack.take(),
            entry: pcb.entry.take(),
        }
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.table
            .iter()
            .position(|pcb| pcb.as_ref().is_some_and(|pcb| pcb.pid == pid))
    }

    fn current_pcb(&self) -> Option<&Pcb> {
        self.table[self.current].as_ref()
    }
}
