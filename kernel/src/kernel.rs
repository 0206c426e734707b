//! The booted kernel.
//!
//! Each subsystem sits behind its own lock. Locks are always taken in the
//! order processes, heap, vmm, frames, and every operation runs with
//! interrupts masked. Context switches happen after the process lock is
//! dropped.

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::arch::Platform;
use crate::config::BootConfig;
use crate::constants::processes::{MAX_PROCESSES, STACK_SIZE};
use crate::memory::{
    address::{PhysAddr, VirtAddr},
    bitmap_frame_allocator::{BitmapFrameAllocator, FrameStats},
    heap::{Heap, HeapStats},
    paging::{MapError, PageDirectory, PageFlags, Vmm},
    KernelPages,
};
use crate::processes::{
    process::{Entry, Pid, Priority, ProcessError, ProcessInfo, ProcessState, Stack},
    ProcessManager, Remains,
};

pub struct Kernel<P: Platform> {
    platform: P,
    config: BootConfig,
    kernel_directory: PageDirectory,
    frames: Mutex<BitmapFrameAllocator>,
    vmm: Mutex<Vmm<P::Memory>>,
    heap: Mutex<Heap>,
    processes: Mutex<ProcessManager>,
    ticks: AtomicU64,
}

impl<P: Platform> Kernel<P> {
    /// Brings up frames, paging, the heap and the process table, in that
    /// order. Panics if any of them cannot be set up.
    pub fn boot(platform: P, config: BootConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("Invalid boot configuration: {}", e);
        }

        let mut frames = BitmapFrameAllocator::new(config.memory_top, config.reserved_top);

        let mut vmm = Vmm::new(platform.phys_memory());
        let directory = vmm
            .init(&mut frames)
            .unwrap_or_else(|e| panic!("Failed to build kernel page directory: {}", e));
        vmm.switch(&platform, directory);
        platform.enable_paging();
        log::info!("paging enabled");

        let heap_start = VirtAddr::new(config.heap_start);
        let window = platform
            .heap_window(heap_start, config.heap_max_size)
            .expect("No window for the kernel heap");
        let heap = {
            let mut pages = KernelPages {
                cpu: &platform,
                vmm: &mut vmm,
                frames: &mut frames,
                directory,
            };
            Heap::init(
                window,
                heap_start,
                config.heap_initial_size,
                config.heap_max_size,
                &mut pages,
            )
            .unwrap_or_else(|e| panic!("Failed to initialize heap: {}", e))
        };

        let processes = ProcessManager::new(directory.phys());
        log::info!("process table ready, kernel process is pid {}", Pid::KERNEL);

        Kernel {
            platform,
            config,
            kernel_directory: directory,
            frames: Mutex::new(frames),
            vmm: Mutex::new(vmm),
            heap: Mutex::new(heap),
            processes: Mutex::new(processes),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn kernel_directory(&self) -> PageDirectory {
        self.kernel_directory
    }

    // frames

    pub fn pfa_alloc(&self) -> Option<PhysAddr> {
        self.platform.without_interrupts(|| self.frames.lock().alloc())
    }

    pub fn pfa_free(&self, addr: PhysAddr) {
        self.platform.without_interrupts(|| self.frames.lock().free(addr))
    }

    pub fn pfa_stats(&self) -> FrameStats {
        self.platform.without_interrupts(|| self.frames.lock().stats())
    }

    // address spaces

    pub fn vmm_create_directory(&self) -> Option<PageDirectory> {
        self.platform.without_interrupts(|| {
            let mut vmm = self.vmm.lock();
            let mut frames = self.frames.lock();
            vmm.create_directory(&mut frames)
        })
    }

    pub fn vmm_switch(&self, directory: PageDirectory) {
        self.platform
            .without_interrupts(|| self.vmm.lock().switch(&self.platform, directory))
    }

    pub fn vmm_map(
        &self,
        directory: PageDirectory,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.platform.without_interrupts(|| {
            let mut vmm = self.vmm.lock();
            let mut frames = self.frames.lock();
            vmm.map(&mut frames, directory, vaddr, paddr, flags)
        })
    }

    pub fn vmm_unmap(&self, directory: PageDirectory, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.platform
            .without_interrupts(|| self.vmm.lock().unmap(&self.platform, directory, vaddr))
    }

    pub fn vmm_translate(&self, directory: PageDirectory, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.platform
            .without_interrupts(|| self.vmm.lock().translate(directory, vaddr))
    }

    pub fn vmm_is_present(&self, directory: PageDirectory, vaddr: VirtAddr) -> bool {
        self.platform
            .without_interrupts(|| self.vmm.lock().is_present(directory, vaddr))
    }

    pub fn vmm_current(&self) -> Option<PageDirectory> {
        self.platform.without_interrupts(|| self.vmm.lock().current())
    }

    // heap

    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.with_heap(|heap, pages| heap.alloc(pages, size))
    }

    /// Returns false for pointers that are not live heap allocations.
    pub fn kfree(&self, ptr: NonNull<u8>) -> bool {
        self.platform.without_interrupts(|| self.heap.lock().free(ptr))
    }

    pub fn krealloc(&self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        self.with_heap(|heap, pages| heap.realloc(pages, ptr, new_size))
    }

    pub fn kcalloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.with_heap(|heap, pages| heap.calloc(pages, count, size))
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.platform.without_interrupts(|| self.heap.lock().stats())
    }

    // processes

    /// Creates a process that runs `entry` the first time it is scheduled.
    pub fn process_create<F>(&self, name: &str, priority: Priority, entry: F) -> Result<Pid, ProcessError>
    where
        F: FnOnce() + Send + 'static,
    {
        let entry: Entry = Box::new(entry);
        self.platform.without_interrupts(|| {
            let mut processes = self.processes.lock();
            let reservation = processes.reserve(name, priority)?;

            let Some(stack) = self.allocate_stack() else {
                log::warn!("no memory for the stack of process {}", reservation.pid());
                processes.abandon(reservation);
                return Err(ProcessError::OutOfMemory);
            };

            let pid = reservation.pid();
            processes.admit(reservation, stack, entry, self.platform.process_entry_point());
            Ok(pid)
        })
    }

    /// Gives the CPU to the next ready process, if there is one.
    pub fn process_yield(&self) {
        self.platform.without_interrupts(|| self.reschedule())
    }

    /// Terminates the running process and switches away. Only returns on a
    /// platform that cannot actually switch, or with an error for PID 0.
    pub fn process_exit(&self, code: i32) -> Result<(), ProcessError> {
        self.platform.without_interrupts(|| {
            let remains = self.processes.lock().exit_current(code)?;
            // the stack being freed is still in use until the switch below;
            // nothing can allocate in between with interrupts masked
            self.release(remains);
            self.reschedule();
            Ok(())
        })
    }

    pub fn process_kill(&self, pid: Pid) -> Result<(), ProcessError> {
        self.platform.without_interrupts(|| {
            let (remains, was_current) = self.processes.lock().kill(pid)?;
            self.release(remains);
            if was_current {
                self.reschedule();
            }
            Ok(())
        })
    }

    /// Blocks the running process until someone calls `process_unblock`.
    pub fn process_block(&self) -> Result<(), ProcessError> {
        self.platform.without_interrupts(|| {
            self.processes.lock().block_current()?;
            self.reschedule();
            Ok(())
        })
    }

    pub fn process_unblock(&self, pid: Pid) -> Result<(), ProcessError> {
        self.platform
            .without_interrupts(|| self.processes.lock().unblock(pid))
    }

    pub fn process_cleanup(&self) -> usize {
        self.platform
            .without_interrupts(|| self.processes.lock().cleanup())
    }

    pub fn process_find(&self, pid: Pid) -> Option<ProcessInfo> {
        self.platform
            .without_interrupts(|| self.processes.lock().find(pid))
    }

    pub fn process_list(&self) -> ArrayVec<ProcessInfo, MAX_PROCESSES> {
        self.platform.without_interrupts(|| self.processes.lock().list())
    }

    pub fn process_count(&self, state: ProcessState) -> usize {
        self.platform
            .without_interrupts(|| self.processes.lock().count_by_state(state))
    }

    pub fn ready_queue(&self) -> ArrayVec<Pid, MAX_PROCESSES> {
        self.platform
            .without_interrupts(|| self.processes.lock().ready_queue())
    }

    pub fn current_pid(&self) -> Pid {
        self.platform
            .without_interrupts(|| self.processes.lock().current_pid())
    }

    /// The entry closure of the running process, handed out once.
    pub fn take_current_entry(&self) -> Option<Entry> {
        self.platform
            .without_interrupts(|| self.processes.lock().take_current_entry())
    }

    pub fn log_process_table(&self) {
        self.platform
            .without_interrupts(|| self.processes.lock().log_process_table())
    }

    // timer

    /// Counts a timer interrupt. Scheduling stays cooperative.
    pub fn timer_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Runs `f` on the heap with a page source that maps new heap pages into
    /// the kernel directory.
    fn with_heap<R>(
        &self,
        f: impl FnOnce(&mut Heap, &mut KernelPages<'_, P, P::Memory>) -> R,
    ) -> R {
        self.platform.without_interrupts(|| {
            let mut heap = self.heap.lock();
            let mut vmm = self.vmm.lock();
            let mut frames = self.frames.lock();
            let mut pages = KernelPages {
                cpu: &self.platform,
                vmm: &mut vmm,
                frames: &mut frames,
                directory: self.kernel_directory,
            };
            f(&mut heap, &mut pages)
        })
    }

    fn allocate_stack(&self) -> Option<Stack> {
        self.with_heap(|heap, pages| {
            let base = heap.alloc(pages, STACK_SIZE)?;
            let vaddr = heap.virt_addr_of(base)?;
            Some(Stack::new(base, vaddr, STACK_SIZE))
        })
    }

    fn release(&self, remains: Remains) {
        if let Some(stack) = remains.stack {
            self.heap.lock().free(stack.base());
        }
        drop(remains.entry);
    }

    /// Must run with interrupts masked and no lock held.
    fn reschedule(&self) {
        let switch = self.processes.lock().schedule(self.ticks());
        if let Some(switch) = switch {
            // SAFETY: both contexts live in the process table, which is never
            // moved, and neither slot can be reclaimed before the switch
            unsafe { self.platform.switch_context(switch.from, switch.to) };
        }
    }
}
