//! Architecture seam.
//!
//! Everything that has to touch the processor directly sits behind [`Cpu`] and
//! [`Platform`]: loading CR3, TLB flushes, interrupt masking, halting, and the
//! register-level context switch. The rest of the kernel is ordinary code that
//! can run on top of either implementation.

use core::ptr::NonNull;

use crate::memory::{
    address::{PhysAddr, VirtAddr},
    phys::PhysMemory,
};
use crate::processes::registers::Context;

#[cfg(not(target_os = "none"))]
pub mod hosted;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub mod x86;

/// The platform the kernel runs on in this build.
#[cfg(not(target_os = "none"))]
pub type Machine = hosted::Hosted;
#[cfg(all(target_os = "none", target_arch = "x86"))]
pub type Machine = x86::X86;

pub trait Cpu {
    /// Loads the page-table base register.
    fn load_page_directory(&self, directory: PhysAddr);

    /// Turns paging on. Only called once, after the first directory is loaded.
    fn enable_paging(&self);

    /// Flushes every non-global TLB entry.
    fn flush_tlb(&self);

    /// Saves the running register file into `from` and resumes `to`.
    ///
    /// Returns when something later switches back into `from`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live contexts that stay in place until the
    /// switch back, and `to` must describe a resumable context (a saved one or
    /// a fresh one with a valid stack and entry point). Interrupts must be
    /// masked.
    unsafe fn switch_context(&self, from: *mut Context, to: *const Context);

    /// Runs `f` with interrupts masked, restoring the previous state after.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R;

    fn halt(&self) -> !;
}

pub trait Platform: Cpu + Sync {
    type Memory: PhysMemory + Send;

    /// View of physical memory used for page directories and tables.
    fn phys_memory(&self) -> Self::Memory;

    /// Where the kernel can read and write the heap's virtual range
    /// `[start, start + max_size)` once it is mapped.
    fn heap_window(&self, start: VirtAddr, max_size: usize) -> Option<NonNull<u8>>;

    /// Instruction pointer a freshly created process starts at.
    fn process_entry_point(&self) -> u32;
}
