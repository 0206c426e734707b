//! i686 protected mode.
//!
//! Physical memory is reached through the identity map of the first 4 MiB set
//! up by the VMM, and the heap window is its own virtual range.

use core::arch::{asm, global_asm};
use core::ptr::NonNull;

use raw_cpuid::CpuId;

use super::{Cpu, Platform};
use crate::constants::memory::IDENTITY_MAP_SIZE;
use crate::memory::{
    address::{FrameId, PhysAddr, VirtAddr},
    phys::PhysMemory,
};
use crate::processes::registers::Context;

const EFLAGS_IF: u32 = 1 << 9;
const CR0_PG: u32 = 1 << 31;

// Offsets follow `Context` (checked in registers.rs): ebx 4, esi 16, edi 20,
// ebp 24, esp 28, eip 32, eflags 36, cr3 40. eax, ecx and edx are caller-saved.
global_asm!(
    ".global kestrel_switch_context",
    "kestrel_switch_context:",
    "    mov eax, [esp + 4]",
    "    mov edx, [esp + 8]",
    "    mov [eax + 4], ebx",
    "    mov [eax + 16], esi",
    "    mov [eax + 20], edi",
    "    mov [eax + 24], ebp",
    "    mov [eax + 28], esp",
    "    mov ecx, offset .Lkestrel_resume",
    "    mov [eax + 32], ecx",
    "    pushfd",
    "    pop ecx",
    "    mov [eax + 36], ecx",
    "    mov ecx, cr3",
    "    mov [eax + 40], ecx",
    "    mov ecx, [edx + 40]",
    "    mov eax, cr3",
    "    cmp eax, ecx",
    "    je .Lkestrel_same_space",
    "    mov cr3, ecx",
    ".Lkestrel_same_space:",
    "    mov ebx, [edx + 4]",
    "    mov esi, [edx + 16]",
    "    mov edi, [edx + 20]",
    "    mov ebp, [edx + 24]",
    "    mov esp, [edx + 28]",
    "    push dword ptr [edx + 36]",
    "    popfd",
    "    jmp dword ptr [edx + 32]",
    ".Lkestrel_resume:",
    "    ret",
);

extern "C" {
    fn kestrel_switch_context(from: *mut Context, to: *const Context);
}

pub struct X86 {
    entry_point: extern "C" fn() -> !,
}

impl X86 {
    /// `entry_point` is where every new process starts executing.
    pub const fn new(entry_point: extern "C" fn() -> !) -> Self {
        X86 { entry_point }
    }

    pub fn log_cpu_features(&self) {
        let cpuid = CpuId::new();
        if let Some(vendor) = cpuid.get_vendor_info() {
            log::info!("CPU vendor: {}", vendor.as_str());
        }
        if let Some(features) = cpuid.get_feature_info() {
            log::info!(
                "CPU features: pse={} pge={} apic={}",
                features.has_pse(),
                features.has_pge(),
                features.has_apic()
            );
        }
    }
}

impl Cpu for X86 {
    fn load_page_directory(&self, directory: PhysAddr) {
        unsafe {
            asm!("mov cr3, {}", in(reg) directory.as_u32(), options(nostack, preserves_flags));
        }
    }

    fn enable_paging(&self) {
        unsafe {
            asm!(
                "mov {tmp}, cr0",
                "or {tmp}, {pg}",
                "mov cr0, {tmp}",
                tmp = out(reg) _,
                pg = const CR0_PG,
                options(nostack),
            );
        }
    }

    fn flush_tlb(&self) {
        // reloading cr3 drops every non-global entry
        unsafe {
            asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags),
            );
        }
    }

    unsafe fn switch_context(&self, from: *mut Context, to: *const Context) {
        kestrel_switch_context(from, to);
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", "cli", out(reg) eflags);
        }

        let result = f();

        if eflags & EFLAGS_IF != 0 {
            unsafe {
                asm!("sti", options(nomem, nostack));
            }
        }
        result
    }

    fn halt(&self) -> ! {
        loop {
            unsafe {
                asm!("hlt", options(nomem, nostack, preserves_flags));
            }
        }
    }
}

/// Frames inside the boot identity map, read through their physical address.
pub struct IdentityMapped;

unsafe impl PhysMemory for IdentityMapped {
    fn frame_ptr(&self, frame: FrameId) -> Option<NonNull<u8>> {
        let start = frame.start_address().as_u32();
        if start >= IDENTITY_MAP_SIZE {
            return None;
        }
        // frame 0 maps to null and is refused, it is never handed out anyway
        NonNull::new(start as usize as *mut u8)
    }
}

impl Platform for X86 {
    type Memory = IdentityMapped;

    fn phys_memory(&self) -> IdentityMapped {
        IdentityMapped
    }

    fn heap_window(&self, start: VirtAddr, _max_size: usize) -> Option<NonNull<u8>> {
        NonNull::new(start.as_u32() as usize as *mut u8)
    }

    fn process_entry_point(&self) -> u32 {
        self.entry_point as usize as u32
    }
}
