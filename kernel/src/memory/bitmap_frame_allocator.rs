//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame, 1 = allocated. The bitmap is inline (sized for
//! `MAX_PHYSICAL_MEMORY`) because it has to work before the heap exists.

use crate::constants::memory::{
    BITMAP_ENTRIES, BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_FRAMES,
};
use crate::memory::address::{FrameId, PhysAddr};

/// Frame counts reported by [`BitmapFrameAllocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    // Frames below this index hold low memory and the kernel image; they are
    // never freed.
    reserved_frames: usize,
    // Lowest index that might be free. Never trusted without a bit test.
    first_free_hint: usize,
    bitmap: [u32; BITMAP_ENTRIES],
}

impl BitmapFrameAllocator {
    /// An allocator that tracks no memory; every `alloc` fails.
    pub const fn empty() -> Self {
        Self {
            total_frames: 0,
            free_frames: 0,
            reserved_frames: 0,
            first_free_hint: 0,
            bitmap: [FULL_BITMAP_ENTRY; BITMAP_ENTRIES],
        }
    }

    /// Tracks `[0, memory_top)` and pre-allocates `[0, reserved_top)`.
    pub fn new(memory_top: u32, reserved_top: u32) -> Self {
        let mut allocator = Self::empty();
        allocator.init(memory_top, reserved_top);
        allocator
    }

    pub fn init(&mut self, memory_top: u32, reserved_top: u32) {
        let mut total_frames = memory_top as usize / FRAME_SIZE;
        if total_frames > MAX_FRAMES {
            log::warn!(
                "physical memory top {:#x} exceeds the {} frames the bitmap can track",
                memory_top,
                MAX_FRAMES
            );
            total_frames = MAX_FRAMES;
        }

        // bits past the last frame stay set so they are never handed out
        self.bitmap = [FULL_BITMAP_ENTRY; BITMAP_ENTRIES];
        self.total_frames = total_frames;
        self.free_frames = 0;
        for frame_index in 0..total_frames {
            self.clear_bit(frame_index);
        }

        let reserved_frames = (reserved_top as usize).div_ceil(FRAME_SIZE).min(total_frames);
        for frame_index in 0..reserved_frames {
            self.set_bit(frame_index);
        }
        self.reserved_frames = reserved_frames;
        self.first_free_hint = reserved_frames;

        log::info!(
            "frame allocator: {} frames, {} reserved below {:#x}",
            total_frames,
            reserved_frames,
            reserved_top
        );
    }

    /// Hands out the first free frame at or after the hint, wrapping once.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        if self.free_frames == 0 {
            return None;
        }

        let found = self
            .find_clear_bit(self.first_free_hint, self.total_frames)
            .or_else(|| self.find_clear_bit(0, self.first_free_hint))?;

        self.set_bit(found);
        if found == self.first_free_hint {
            self.first_free_hint += 1;
        }

        Some(FrameId::from_index(found as u32).start_address())
    }

    /// Returns a frame. Reserved, out-of-range and already-free frames are
    /// ignored.
    pub fn free(&mut self, addr: PhysAddr) {
        let frame_index = FrameId::containing(addr).index();
        if frame_index < self.reserved_frames {
            log::warn!("ignoring free of reserved frame {}", addr);
            return;
        }
        if frame_index >= self.total_frames || !self.is_bit_set(frame_index) {
            log::trace!("ignoring free of unallocated frame {}", addr);
            return;
        }

        self.clear_bit(frame_index);
        if frame_index < self.first_free_hint {
            self.first_free_hint = frame_index;
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total_frames,
            free: self.free_frames,
            used: self.total_frames - self.free_frames,
        }
    }

    /// Check if frame is used. Frames outside tracked memory count as used.
    pub fn is_frame_used(&self, frame: FrameId) -> bool {
        frame.index() >= self.total_frames || self.is_bit_set(frame.index())
    }

    /// First clear bit in `[start, end)`, skipping full words.
    fn find_clear_bit(&self, start: usize, end: usize) -> Option<usize> {
        let mut frame_index = start;
        while frame_index < end {
            let word_index = frame_index / BITMAP_ENTRY_SIZE;
            if frame_index % BITMAP_ENTRY_SIZE == 0 && self.bitmap[word_index] == FULL_BITMAP_ENTRY
            {
                frame_index += BITMAP_ENTRY_SIZE;
                continue;
            }
            if !self.is_bit_set(frame_index) {
                return Some(frame_index);
            }
            frame_index += 1;
        }
        None
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask == 0 {
            self.bitmap[word_index] |= mask;
            self.free_frames -= 1;
        }
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask != 0 {
            self.bitmap[word_index] &= !mask;
            self.free_frames += 1;
        }
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        (self.bitmap[word_index] & mask) != 0
    }

    #[cfg(test)]
    fn count_clear_bits(&self) -> usize {
        (0..self.total_frames)
            .filter(|&frame_index| !self.is_bit_set(frame_index))
            .count()
    }
}
