//! Two-level x86 paging.
//!
//! A virtual address splits 10/10/12 into directory index, table index and
//! page offset. Page tables are allocated from the frame allocator the first
//! time something is mapped into their 4 MiB region and are never freed.

use core::fmt;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::arch::Cpu;
use crate::constants::memory::{ENTRIES_PER_TABLE, IDENTITY_MAP_SIZE, PAGE_SIZE};
use crate::memory::{
    address::{FrameId, PhysAddr, VirtAddr},
    bitmap_frame_allocator::BitmapFrameAllocator,
    phys::PhysMemory,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    const FRAME_MASK: u32 = 0xFFFF_F000;

    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: FrameId, flags: PageFlags) -> Self {
        PageTableEntry(frame.start_address().as_u32() | flags.bits())
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// Only meaningful when the entry is present.
    pub fn frame(self) -> FrameId {
        FrameId::containing(PhysAddr::new(self.0 & Self::FRAME_MASK))
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &format_args!("{:#010x}", self.0 & Self::FRAME_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page directory or page table; both are 1024 entries in one frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// Handle to a page directory frame; its physical address is what CR3 holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory(FrameId);

impl PageDirectory {
    pub fn phys(self) -> PhysAddr {
        self.0.start_address()
    }

    pub fn frame(self) -> FrameId {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame was left for a page directory or table.
    OutOfFrames,
    /// The table frame cannot be reached through the physical memory view.
    Unreachable(PhysAddr),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfFrames => write!(f, "Out of frames for page tables"),
            MapError::Unreachable(addr) => write!(f, "Page table at {} is not reachable", addr),
        }
    }
}

pub struct Vmm<M: PhysMemory> {
    memory: M,
    kernel: Option<PageDirectory>,
    current: Option<PageDirectory>,
}

impl<M: PhysMemory> Vmm<M> {
    pub fn new(memory: M) -> Self {
        Vmm {
            memory,
            kernel: None,
            current: None,
        }
    }

    /// Builds the kernel directory with the low 4 MiB identity mapped and
    /// records it as current. Loading it into CR3 is left to `switch`.
    pub fn init(&mut self, frames: &mut BitmapFrameAllocator) -> Result<PageDirectory, MapError> {
        let directory = PageDirectory(self.allocate_table(frames)?);

        for page in 0..IDENTITY_MAP_SIZE / PAGE_SIZE as u32 {
            let addr = page * PAGE_SIZE as u32;
            self.map(
                frames,
                directory,
                VirtAddr::new(addr),
                PhysAddr::new(addr),
                PageFlags::PRESENT | PageFlags::WRITABLE,
            )?;
        }

        self.kernel = Some(directory);
        self.current = Some(directory);
        log::info!(
            "kernel page directory at {}, {:#x} bytes identity mapped",
            directory.phys(),
            IDENTITY_MAP_SIZE
        );
        Ok(directory)
    }

    /// A fresh directory sharing the kernel's page tables.
    pub fn create_directory(&mut self, frames: &mut BitmapFrameAllocator) -> Option<PageDirectory> {
        let frame = match self.allocate_table(frames) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("create_directory: {}", e);
                return None;
            }
        };

        if let Some(kernel) = self.kernel {
            for index in 0..ENTRIES_PER_TABLE {
                let Some(entry) = self.entry(kernel.frame(), index) else {
                    break;
                };
                if entry.is_present() {
                    self.table_mut(frame)?[index] = entry;
                }
            }
        }
        Some(PageDirectory(frame))
    }

    /// Maps the page containing `vaddr` to the frame containing `paddr`.
    ///
    /// The leaf is always marked present. If a page table has to be created and
    /// that fails, nothing is mapped.
    pub fn map(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        directory: PageDirectory,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let dir_index = vaddr.directory_index();
        let dir_entry = self
            .entry(directory.frame(), dir_index)
            .ok_or(MapError::Unreachable(directory.phys()))?;

        let mut table_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if flags.contains(PageFlags::USER) {
            table_flags |= PageFlags::USER;
        }

        let table = if dir_entry.is_present() {
            let table = dir_entry.frame();
            if !dir_entry.flags().contains(table_flags) {
                self.set_entry(
                    directory.frame(),
                    dir_index,
                    PageTableEntry::new(table, dir_entry.flags() | table_flags),
                )?;
            }
            table
        } else {
            let table = self.allocate_table(frames)?;
            self.set_entry(
                directory.frame(),
                dir_index,
                PageTableEntry::new(table, table_flags),
            )?;
            table
        };

        self.set_entry(
            table,
            vaddr.table_index(),
            PageTableEntry::new(FrameId::containing(paddr), flags | PageFlags::PRESENT),
        )
    }

    /// Removes the mapping for `vaddr` and returns the frame it pointed to.
    /// The frame itself is not freed. Unmapping a missing page does nothing.
    pub fn unmap(
        &mut self,
        cpu: &impl Cpu,
        directory: PageDirectory,
        vaddr: VirtAddr,
    ) -> Option<PhysAddr> {
        let table = self.present_entry(directory.frame(), vaddr.directory_index())?;
        let leaf = self.present_entry(table.frame(), vaddr.table_index())?;

        self.table_mut(table.frame())?[vaddr.table_index()] = PageTableEntry::empty();
        cpu.flush_tlb();
        Some(leaf.frame().start_address())
    }

    pub fn translate(&self, directory: PageDirectory, vaddr: VirtAddr) -> Option<PhysAddr> {
        let table = self.present_entry(directory.frame(), vaddr.directory_index())?;
        let leaf = self.present_entry(table.frame(), vaddr.table_index())?;
        Some(PhysAddr::new(
            leaf.frame().start_address().as_u32() + vaddr.page_offset(),
        ))
    }

    pub fn is_present(&self, directory: PageDirectory, vaddr: VirtAddr) -> bool {
        self.translate(directory, vaddr).is_some()
    }

    pub fn switch(&mut self, cpu: &impl Cpu, directory: PageDirectory) {
        self.current = Some(directory);
        cpu.load_page_directory(directory.phys());
    }

    pub fn current(&self) -> Option<PageDirectory> {
        self.current
    }

    pub fn kernel_directory(&self) -> Option<PageDirectory> {
        self.kernel
    }

    /// Allocates a frame for a directory or table and zeroes it.
    fn allocate_table(&mut self, frames: &mut BitmapFrameAllocator) -> Result<FrameId, MapError> {
        let addr = frames.alloc().ok_or(MapError::OutOfFrames)?;
        let frame = FrameId::containing(addr);
        match self.table_mut(frame) {
            Some(table) => {
                table.zero();
                Ok(frame)
            }
            None => {
                frames.free(addr);
                Err(MapError::Unreachable(addr))
            }
        }
    }

    fn table(&self, frame: FrameId) -> Option<&PageTable> {
        let ptr = self.memory.frame_ptr(frame)?;
        // SAFETY: PhysMemory hands out aligned, exclusively owned 4 KiB frames
        Some(unsafe { ptr.cast::<PageTable>().as_ref() })
    }

    fn table_mut(&mut self, frame: FrameId) -> Option<&mut PageTable> {
        let ptr = self.memory.frame_ptr(frame)?;
        // SAFETY: as in `table`, and `&mut self` keeps this the only reference
        Some(unsafe { ptr.cast::<PageTable>().as_mut() })
    }

    fn entry(&self, frame: FrameId, index: usize) -> Option<PageTableEntry> {
        self.table(frame).map(|table| table[index])
    }

    fn present_entry(&self, frame: FrameId, index: usize) -> Option<PageTableEntry> {
        self.entry(frame, index).filter(|entry| entry.is_present())
    }

    fn set_entry(
        &mut self,
        frame: FrameId,
        index: usize,
        entry: PageTableEntry,
    ) -> Result<(), MapError> {
        let table = self
            .table_mut(frame)
            .ok_or(MapError::Unreachable(frame.start_address()))?;
        table[index] = entry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::{Hosted, SimulatedRam};
    use crate::config::BootConfig;
    use alloc::sync::Arc;

    struct Fixture {
        hosted: Hosted,
        frames: BitmapFrameAllocator,
        vmm: Vmm<Arc<SimulatedRam>>,
        kernel: PageDirectory,
    }

    fn setup() -> Fixture {
        use crate::arch::Platform;

        let config = BootConfig::for_tests();
        let hosted = Hosted::new(&config);
        let mut frames = BitmapFrameAllocator::new(config.memory_top, config.reserved_top);
        let mut vmm = Vmm::new(hosted.phys_memory());
        let kernel = vmm.init(&mut frames).unwrap();
        Fixture {
            hosted,
            frames,
            vmm,
            kernel,
        }
    }

    #[test]
    fn test_init_identity_maps_low_memory() {
        let f = setup();

        assert_eq!(
            f.vmm.translate(f.kernel, VirtAddr::new(0x0010_1234)),
            Some(PhysAddr::new(0x0010_1234))
        );
        assert!(f.vmm.is_present(f.kernel, VirtAddr::new(IDENTITY_MAP_SIZE - 1)));
        assert!(!f.vmm.is_present(f.kernel, VirtAddr::new(IDENTITY_MAP_SIZE)));
        assert_eq!(f.vmm.current(), Some(f.kernel));
        // one directory and one table
        assert_eq!(f.frames.stats().used, 512 + 2);
    }

    #[test]
    fn test_map_then_translate_keeps_offset() {
        let mut f = setup();
        let frame = f.frames.alloc().unwrap();

        f.vmm
            .map(
                &mut f.frames,
                f.kernel,
                VirtAddr::new(0x0080_0000),
                frame,
                PageFlags::WRITABLE,
            )
            .unwrap();

        assert_eq!(
            f.vmm.translate(f.kernel, VirtAddr::new(0x0080_0ABC)),
            Some(PhysAddr::new(frame.as_u32() + 0xABC))
        );
    }

    #[test]
    fn test_tables_are_allocated_lazily_per_region() {
        let mut f = setup();
        let used = f.frames.stats().used;

        let region = 0x0100_0000;
        for page in 0..3 {
            let vaddr = VirtAddr::new(region + page * PAGE_SIZE as u32);
            f.vmm
                .map(
                    &mut f.frames,
                    f.kernel,
                    vaddr,
                    PhysAddr::new(0x0030_0000),
                    PageFlags::WRITABLE,
                )
                .unwrap();
        }

        assert_eq!(f.frames.stats().used, used + 1);
    }

    #[test]
    fn test_unmap_returns_frame_and_flushes_once() {
        let mut f = setup();
        let vaddr = VirtAddr::new(0x0080_0000);
        let frame = f.frames.alloc().unwrap();
        f.vmm
            .map(&mut f.frames, f.kernel, vaddr, frame, PageFlags::WRITABLE)
            .unwrap();
        let used = f.frames.stats().used;

        assert_eq!(f.vmm.unmap(&f.hosted, f.kernel, vaddr), Some(frame));
        assert!(!f.vmm.is_present(f.kernel, vaddr));
        assert_eq!(f.vmm.translate(f.kernel, vaddr), None);
        assert_eq!(f.hosted.tlb_flushes(), 1);

        // second unmap is a no-op and flushes nothing
        assert_eq!(f.vmm.unmap(&f.hosted, f.kernel, vaddr), None);
        assert_eq!(f.hosted.tlb_flushes(), 1);
        // the frame still belongs to the caller
        assert_eq!(f.frames.stats().used, used);
    }

    #[test]
    fn test_unmap_without_table_is_a_no_op() {
        let mut f = setup();
        assert_eq!(
            f.vmm.unmap(&f.hosted, f.kernel, VirtAddr::new(0xC000_0000)),
            None
        );
        assert_eq!(f.hosted.tlb_flushes(), 0);
    }

    #[test]
    fn test_map_fails_cleanly_when_no_frame_for_table() {
        let mut f = setup();
        while f.frames.alloc().is_some() {}

        let vaddr = VirtAddr::new(0x0080_0000);
        let result = f.vmm.map(
            &mut f.frames,
            f.kernel,
            vaddr,
            PhysAddr::new(0x0030_0000),
            PageFlags::WRITABLE,
        );

        assert_eq!(result, Err(MapError::OutOfFrames));
        assert!(!f.vmm.is_present(f.kernel, vaddr));
    }

    #[test]
    fn test_user_mapping_marks_directory_entry_user() {
        let mut f = setup();
        let vaddr = VirtAddr::new(0x0000_5000);

        f.vmm
            .map(
                &mut f.frames,
                f.kernel,
                vaddr,
                PhysAddr::new(0x0000_5000),
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();

        let dir_entry = f
            .vmm
            .entry(f.kernel.frame(), vaddr.directory_index())
            .unwrap();
        assert!(dir_entry.flags().contains(PageFlags::USER));
    }

    #[test]
    fn test_created_directory_shares_kernel_mappings() {
        let mut f = setup();
        let dir = f.vmm.create_directory(&mut f.frames).unwrap();
        assert_ne!(dir, f.kernel);

        assert!(f.vmm.is_present(dir, VirtAddr::new(0x0010_0000)));

        // a table created for the new directory is not visible from the kernel's
        let vaddr = VirtAddr::new(0x0200_0000);
        f.vmm
            .map(
                &mut f.frames,
                dir,
                vaddr,
                PhysAddr::new(0x0030_0000),
                PageFlags::WRITABLE,
            )
            .unwrap();
        assert!(f.vmm.is_present(dir, vaddr));
        assert!(!f.vmm.is_present(f.kernel, vaddr));
    }

    #[test]
    fn test_create_directory_without_frames_returns_none() {
        let mut f = setup();
        while f.frames.alloc().is_some() {}
        assert_eq!(f.vmm.create_directory(&mut f.frames), None);
    }

    #[test]
    fn test_switch_loads_directory() {
        let mut f = setup();
        let dir = f.vmm.create_directory(&mut f.frames).unwrap();

        f.vmm.switch(&f.hosted, dir);

        assert_eq!(f.vmm.current(), Some(dir));
        assert_eq!(f.hosted.loaded_directory(), dir.phys());
        assert_eq!(f.vmm.kernel_directory(), Some(f.kernel));
    }
}
