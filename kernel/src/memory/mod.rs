pub mod address;
pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;
pub mod phys;

use crate::arch::Cpu;
use address::VirtAddr;
use bitmap_frame_allocator::BitmapFrameAllocator;
use heap::PageSource;
use paging::{MapError, PageDirectory, PageFlags, Vmm};
use phys::PhysMemory;

/// Backs heap pages with fresh frames mapped writable into `directory`.
pub struct KernelPages<'a, C: Cpu, M: PhysMemory> {
    pub cpu: &'a C,
    pub vmm: &'a mut Vmm<M>,
    pub frames: &'a mut BitmapFrameAllocator,
    pub directory: PageDirectory,
}

impl<C: Cpu, M: PhysMemory> PageSource for KernelPages<'_, C, M> {
    fn back_page(&mut self, vaddr: VirtAddr) -> Result<(), MapError> {
        let frame = self.frames.alloc().ok_or(MapError::OutOfFrames)?;
        if let Err(e) = self
            .vmm
            .map(self.frames, self.directory, vaddr, frame, PageFlags::WRITABLE)
        {
            self.frames.free(frame);
            return Err(e);
        }
        Ok(())
    }

    fn release_page(&mut self, vaddr: VirtAddr) {
        if let Some(frame) = self.vmm.unmap(self.cpu, self.directory, vaddr) {
            self.frames.free(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{hosted::Hosted, Platform};
    use crate::config::BootConfig;

    #[test]
    fn test_kernel_pages_back_and_release() {
        let config = BootConfig::for_tests();
        let hosted = Hosted::new(&config);
        let mut frames = BitmapFrameAllocator::new(config.memory_top, config.reserved_top);
        let mut vmm = Vmm::new(hosted.phys_memory());
        let directory = vmm.init(&mut frames).unwrap();
        let used = frames.stats().used;
        let vaddr = VirtAddr::new(config.heap_start);

        let mut pages = KernelPages {
            cpu: &hosted,
            vmm: &mut vmm,
            frames: &mut frames,
            directory,
        };
        pages.back_page(vaddr).unwrap();
        assert!(pages.vmm.is_present(directory, vaddr));
        pages.release_page(vaddr);
        assert!(!pages.vmm.is_present(directory, vaddr));

        // the page table stays behind, the data frame is returned
        assert_eq!(frames.stats().used, used + 1);
    }

    #[test]
    fn test_kernel_pages_out_of_frames() {
        let config = BootConfig::for_tests();
        let hosted = Hosted::new(&config);
        let mut frames = BitmapFrameAllocator::new(config.memory_top, config.reserved_top);
        let mut vmm = Vmm::new(hosted.phys_memory());
        let directory = vmm.init(&mut frames).unwrap();
        while frames.alloc().is_some() {}

        let mut pages = KernelPages {
            cpu: &hosted,
            vmm: &mut vmm,
            frames: &mut frames,
            directory,
        };

        assert_eq!(
            pages.back_page(VirtAddr::new(config.heap_start)),
            Err(MapError::OutOfFrames)
        );
    }
}
