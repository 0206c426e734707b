//! Address and frame handles.
//!
//! Physical and virtual addresses are distinct types so a physical address can
//! never be dereferenced by accident; frames are referred to by index.

use core::fmt;

use crate::constants::memory::{ENTRIES_PER_TABLE, FRAME_SIZE, PAGE_SIZE};

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        PhysAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE as u32 - 1)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        VirtAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Top 10 bits: index into the page directory.
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Middle 10 bits: index into the page table.
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) as usize) & (ENTRIES_PER_TABLE - 1)
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE as u32 - 1)
    }

    pub const fn align_down(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    /// Returns `None` on 32-bit overflow.
    pub fn checked_add(self, bytes: usize) -> Option<VirtAddr> {
        let bytes = u32::try_from(bytes).ok()?;
        self.0.checked_add(bytes).map(VirtAddr)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:#010x}", self.0)
    }
}

/// Index of a 4 KiB physical frame: frame `i` starts at `i * 4096`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameId(u32);

impl FrameId {
    pub const fn from_index(index: u32) -> Self {
        FrameId(index)
    }

    pub const fn containing(addr: PhysAddr) -> Self {
        FrameId(addr.as_u32() / FRAME_SIZE as u32)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn start_address(self) -> PhysAddr {
        PhysAddr(self.0 * FRAME_SIZE as u32)
    }
}
