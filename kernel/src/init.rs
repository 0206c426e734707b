//! The global kernel instance and the free-function interface to it.
//!
//! Interrupt handlers, the syscall gate and the global allocator have no way
//! to be handed a `&Kernel`, so the booted kernel lives in a static. Code that
//! owns a [`Kernel`] directly (tests, mostly) does not need any of this.

use core::ptr::NonNull;

use arrayvec::ArrayVec;
use spin::Once;

use crate::arch::Machine;
use crate::config::BootConfig;
use crate::constants::processes::MAX_PROCESSES;
use crate::kernel::Kernel;
use crate::memory::{
    address::{PhysAddr, VirtAddr},
    bitmap_frame_allocator::FrameStats,
    heap::HeapStats,
    paging::{MapError, PageDirectory, PageFlags},
};
use crate::processes::process::{Pid, Priority, ProcessError, ProcessInfo, ProcessState};

static KERNEL: Once<Kernel<Machine>> = Once::new();

/// Boots the kernel on `machine`. Later calls return the kernel booted by the
/// first one and drop their arguments.
pub fn boot(machine: Machine, config: BootConfig) -> &'static Kernel<Machine> {
    crate::logging::init();
    KERNEL.call_once(|| Kernel::boot(machine, config))
}

pub fn kernel() -> &'static Kernel<Machine> {
    KERNEL.get().expect("kernel not booted")
}

pub fn try_kernel() -> Option<&'static Kernel<Machine>> {
    KERNEL.get()
}

pub fn pfa_alloc() -> Option<PhysAddr> {
    kernel().pfa_alloc()
}

pub fn pfa_free(addr: PhysAddr) {
    kernel().pfa_free(addr)
}

pub fn pfa_stats() -> FrameStats {
    kernel().pfa_stats()
}

pub fn vmm_create_directory() -> Option<PageDirectory> {
    kernel().vmm_create_directory()
}

pub fn vmm_switch(directory: PageDirectory) {
    kernel().vmm_switch(directory)
}

pub fn vmm_map(
    directory: PageDirectory,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: PageFlags,
) -> Result<(), MapError> {
    kernel().vmm_map(directory, vaddr, paddr, flags)
}

pub fn vmm_unmap(directory: PageDirectory, vaddr: VirtAddr) -> Option<PhysAddr> {
    kernel().vmm_unmap(directory, vaddr)
}

pub fn vmm_translate(directory: PageDirectory, vaddr: VirtAddr) -> Option<PhysAddr> {
    kernel().vmm_translate(directory, vaddr)
}

pub fn vmm_is_present(directory: PageDirectory, vaddr: VirtAddr) -> bool {
    kernel().vmm_is_present(directory, vaddr)
}

pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    kernel().kmalloc(size)
}

pub fn kfree(ptr: NonNull<u8>) -> bool {
    kernel().kfree(ptr)
}

pub fn krealloc(ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
    kernel().krealloc(ptr, new_size)
}

pub fn kcalloc(count: usize, size: usize) -> Option<NonNull<u8>> {
    kernel().kcalloc(count, size)
}

pub fn heap_stats() -> HeapStats {
    kernel().heap_stats()
}

pub fn process_create<F>(name: &str, priority: Priority, entry: F) -> Result<Pid, ProcessError>
where
    F: FnOnce() + Send + 'static,
{
    kernel().process_create(name, priority, entry)
}

pub fn process_exit(code: i32) -> Result<(), ProcessError> {
    kernel().process_exit(code)
}

pub fn process_kill(pid: Pid) -> Result<(), ProcessError> {
    kernel().process_kill(pid)
}

pub fn process_yield() {
    kernel().process_yield()
}

pub fn process_block() -> Result<(), ProcessError> {
    kernel().process_block()
}

pub fn process_unblock(pid: Pid) -> Result<(), ProcessError> {
    kernel().process_unblock(pid)
}

pub fn process_find(pid: Pid) -> Option<ProcessInfo> {
    kernel().process_find(pid)
}

pub fn process_list() -> ArrayVec<ProcessInfo, MAX_PROCESSES> {
    kernel().process_list()
}

pub fn process_count(state: ProcessState) -> usize {
    kernel().process_count(state)
}

pub fn process_cleanup() -> usize {
    kernel().process_cleanup()
}

pub fn current_pid() -> Pid {
    kernel().current_pid()
}

pub fn timer_tick() {
    kernel().timer_tick()
}

pub fn ticks() -> u64 {
    kernel().ticks()
}

/// Runs the entry closure of the current process, if it has not run yet, and
/// exits the process with code 0 when it returns. Returns false if there was
/// nothing to run.
pub fn run_current_process() -> bool {
    let kernel = kernel();
    let Some(entry) = kernel.take_current_entry() else {
        return false;
    };
    entry();
    if let Err(e) = kernel.process_exit(0) {
        log::warn!("process {} could not exit: {}", kernel.current_pid(), e);
    }
    true
}

#[cfg(target_os = "none")]
pub use self::bare_metal::*;

#[cfg(target_os = "none")]
mod bare_metal {
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::{self, NonNull};

    use super::{kernel, run_current_process, try_kernel};
    use crate::arch::Cpu;
    use crate::constants::memory::HEAP_ALIGN;

    /// First instruction of every new process.
    pub extern "C" fn process_trampoline() -> ! {
        run_current_process();
        // an exited process is never switched back to
        kernel().platform().halt()
    }

    /// Routes `alloc` onto the kernel heap once the kernel has booted.
    pub struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if layout.align() > HEAP_ALIGN {
                return ptr::null_mut();
            }
            try_kernel()
                .and_then(|kernel| kernel.kmalloc(layout.size()))
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            if let (Some(kernel), Some(ptr)) = (try_kernel(), NonNull::new(ptr)) {
                kernel.kfree(ptr);
            }
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            if layout.align() > HEAP_ALIGN {
                return ptr::null_mut();
            }
            try_kernel()
                .and_then(|kernel| kernel.krealloc(NonNull::new(ptr), new_size))
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;

    /// Target of the syscall gate: number from eax, argument from ebx, result
    /// back in eax.
    #[no_mangle]
    pub extern "C" fn syscall_dispatch(number: u32, arg: u32) -> i32 {
        crate::syscalls::dispatch(kernel(), number, arg)
    }

    #[no_mangle]
    pub extern "C" fn timer_interrupt() {
        if let Some(kernel) = try_kernel() {
            kernel.timer_tick();
        }
    }
}
