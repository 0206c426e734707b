//! A simulated machine for running the kernel inside an ordinary process.
//!
//! Physical RAM is a page-aligned buffer, the heap window is a second buffer,
//! and the privileged operations only record what was asked of them. Context
//! switches cannot actually transfer control here; they are logged so callers
//! can check which contexts were involved.

use alloc::{sync::Arc, vec::Vec};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use super::{Cpu, Platform};
use crate::config::BootConfig;
use crate::constants::memory::{FRAME_SIZE, KERNEL_LOAD_ADDRESS};
use crate::memory::{
    address::{FrameId, PhysAddr, VirtAddr},
    phys::PhysMemory,
};
use crate::processes::registers::Context;

#[repr(C, align(4096))]
struct FrameBuf([u8; FRAME_SIZE]);

/// Simulated physical memory, one page-aligned buffer per frame.
pub struct SimulatedRam {
    frames: Vec<UnsafeCell<FrameBuf>>,
}

// Frames are only touched through pointers handed out by `frame_ptr`, and the
// frame allocator guarantees a frame has a single owner.
unsafe impl Send for SimulatedRam {}
unsafe impl Sync for SimulatedRam {}

impl SimulatedRam {
    pub fn new(memory_top: u32) -> Self {
        let frames = (0..memory_top as usize / FRAME_SIZE)
            .map(|_| UnsafeCell::new(FrameBuf([0; FRAME_SIZE])))
            .collect();
        SimulatedRam { frames }
    }
}

unsafe impl PhysMemory for Arc<SimulatedRam> {
    fn frame_ptr(&self, frame: FrameId) -> Option<NonNull<u8>> {
        if frame.index() >= self.frames.len() {
            return None;
        }
        // as_ptr keeps provenance over the whole buffer
        let cell = unsafe { self.frames.as_ptr().add(frame.index()) };
        NonNull::new(UnsafeCell::raw_get(cell).cast::<u8>())
    }
}

pub struct Hosted {
    ram: Arc<SimulatedRam>,
    heap_window: Vec<UnsafeCell<u64>>,
    loaded_directory: AtomicU32,
    paging_enabled: AtomicBool,
    interrupts_enabled: AtomicBool,
    tlb_flushes: AtomicUsize,
    switches: Mutex<Vec<(usize, usize)>>,
}

// The heap window is handed to the heap once and only accessed through it.
unsafe impl Sync for Hosted {}

impl Hosted {
    pub fn new(config: &BootConfig) -> Self {
        let words = config.heap_max_size.div_ceil(core::mem::size_of::<u64>());
        Hosted {
            ram: Arc::new(SimulatedRam::new(config.memory_top)),
            heap_window: (0..words).map(|_| UnsafeCell::new(0)).collect(),
            loaded_directory: AtomicU32::new(0),
            paging_enabled: AtomicBool::new(false),
            interrupts_enabled: AtomicBool::new(true),
            tlb_flushes: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
        }
    }

    /// Last value written to the page-table base register.
    pub fn loaded_directory(&self) -> PhysAddr {
        PhysAddr::new(self.loaded_directory.load(Ordering::SeqCst))
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled.load(Ordering::SeqCst)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.load(Ordering::SeqCst)
    }

    /// Every `(from, to)` context pair passed to `switch_context`, oldest first.
    pub fn switches(&self) -> Vec<(usize, usize)> {
        self.switches.lock().clone()
    }
}

impl Cpu for Hosted {
    fn load_page_directory(&self, directory: PhysAddr) {
        self.loaded_directory.store(directory.as_u32(), Ordering::SeqCst);
    }

    fn enable_paging(&self) {
        self.paging_enabled.store(true, Ordering::SeqCst);
    }

    fn flush_tlb(&self) {
        self.tlb_flushes.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn switch_context(&self, from: *mut Context, to: *const Context) {
        self.switches.lock().push((from as usize, to as usize));
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let was_enabled = self.interrupts_enabled.swap(false, Ordering::SeqCst);
        let result = f();
        if was_enabled {
            self.interrupts_enabled.store(true, Ordering::SeqCst);
        }
        result
    }

    fn halt(&self) -> ! {
        panic!("hosted CPU halted");
    }
}

impl Platform for Hosted {
    type Memory = Arc<SimulatedRam>;

    fn phys_memory(&self) -> Arc<SimulatedRam> {
        Arc::clone(&self.ram)
    }

    fn heap_window(&self, _start: VirtAddr, max_size: usize) -> Option<NonNull<u8>> {
        if max_size > self.heap_window.len() * core::mem::size_of::<u64>() {
            return None;
        }
        NonNull::new(UnsafeCell::raw_get(self.heap_window.as_ptr()).cast::<u8>())
    }

    fn process_entry_point(&self) -> u32 {
        // nothing runs at the entry point here; kernel text is a plausible value
        KERNEL_LOAD_ADDRESS
    }
}
