//! The kernel heap.
//!
//! A first-fit free-list allocator over a dedicated virtual range starting at
//! `HEAP_START`. Every block, free or allocated, starts with a 16 byte
//! [`BlockHeader`]; walking `offset + HEADER_SIZE + size` from offset 0 visits
//! every block in address order. The free list links only free blocks through
//! heap-relative offsets and is kept sorted by address, so merging each block
//! with its list successor catches every pair of adjacent free blocks.
//!
//! The heap only grows. Pages are obtained through a [`PageSource`].

use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::constants::memory::{HEAP_ALIGN, PAGE_SIZE};
use crate::memory::{
    address::{align_up, VirtAddr},
    paging::MapError,
};

/// Supplies backing memory for heap pages.
pub trait PageSource {
    /// Backs the page at `vaddr` with a fresh frame.
    fn back_page(&mut self, vaddr: VirtAddr) -> Result<(), MapError>;

    /// Undoes `back_page` for a page the heap could not use after all.
    fn release_page(&mut self, vaddr: VirtAddr);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct BlockHeader {
    size: u32,
    is_free: u32,
    next: u32,
    prev: u32,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
/// A split must leave at least this much payload in the remainder.
const MIN_SPLIT_REMAINDER: usize = 16;
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub blocks: usize,
    pub free_blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Start, initial size and maximum size do not describe a usable range.
    InvalidRange,
    /// A page of the initial arena could not be backed.
    Backing { vaddr: VirtAddr, error: MapError },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::InvalidRange => write!(f, "Invalid heap range"),
            HeapError::Backing { vaddr, error } => {
                write!(f, "Could not back heap page {}: {}", vaddr, error)
            }
        }
    }
}

pub struct Heap {
    /// Where the kernel accesses `start`.
    base: NonNull<u8>,
    start: VirtAddr,
    /// `heap_end - heap_start`.
    size: usize,
    max_size: usize,
    free_head: u32,
}

// The heap exclusively owns its window; it is always used under a lock.
unsafe impl Send for Heap {}

impl Heap {
    /// Backs `initial_size` bytes at `start` and makes them one free block.
    ///
    /// `window` is where the range `[start, start + max_size)` can be read and
    /// written once backed.
    pub fn init(
        window: NonNull<u8>,
        start: VirtAddr,
        initial_size: usize,
        max_size: usize,
        pages: &mut impl PageSource,
    ) -> Result<Heap, HeapError> {
        let valid = start.page_offset() == 0
            && initial_size % PAGE_SIZE == 0
            && max_size % PAGE_SIZE == 0
            && initial_size >= PAGE_SIZE
            && initial_size <= max_size
            && max_size < NIL as usize
            && start.checked_add(max_size).is_some();
        if !valid {
            return Err(HeapError::InvalidRange);
        }

        let mut heap = Heap {
            base: window,
            start,
            size: 0,
            max_size,
            free_head: NIL,
        };
        heap.back_range(pages, 0, initial_size)
            .map_err(|(vaddr, error)| HeapError::Backing { vaddr, error })?;

        heap.size = initial_size;
        heap.write_header(0, BlockHeader {
            size: (initial_size - HEADER_SIZE) as u32,
            is_free: 1,
            next: NIL,
            prev: NIL,
        });
        heap.free_head = 0;

        log::info!(
            "heap: {:#x} bytes at {}, growable to {:#x}",
            initial_size,
            start,
            max_size
        );
        Ok(heap)
    }

    /// First-fit allocation, growing the heap once on a miss.
    pub fn alloc(&mut self, pages: &mut impl PageSource, size: usize) -> Option<NonNull<u8>> {
        // max_size is page aligned, so rounding up cannot cross this bound
        if size == 0 || size > self.max_size - HEADER_SIZE {
            return None;
        }
        let size = align_up(size, HEAP_ALIGN);

        let offset = match self.find_fit(size) {
            Some(offset) => offset,
            None => {
                if !self.expand(pages, size) {
                    log::warn!("heap: allocation of {} bytes failed", size);
                    return None;
                }
                self.find_fit(size)?
            }
        };

        self.unlink(offset);
        let mut block = self.read_header(offset);
        if block.size as usize > size + HEADER_SIZE + MIN_SPLIT_REMAINDER {
            let remainder = offset + (HEADER_SIZE + size) as u32;
            self.write_header(remainder, BlockHeader {
                size: block.size - (HEADER_SIZE + size) as u32,
                is_free: 1,
                next: NIL,
                prev: NIL,
            });
            self.insert_free(remainder);
            block.size = size as u32;
        }
        block.is_free = 0;
        block.next = NIL;
        block.prev = NIL;
        self.write_header(offset, block);

        Some(self.payload(offset))
    }

    /// Returns a block to the free list. Pointers that are not the start of
    /// an allocated block are ignored and reported as `false`.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        let Some(offset) = self.block_of(ptr) else {
            log::warn!("heap: ignoring free of {:p}, not a heap block", ptr);
            return false;
        };
        if self.read_header(offset).is_free != 0 {
            log::trace!("heap: ignoring double free of {:p}", ptr);
            return false;
        }

        self.insert_free(offset);
        self.coalesce();
        true
    }

    /// Resizes an allocation, moving it if it has to grow. On failure the old
    /// block is left untouched. A size of zero frees the block.
    pub fn realloc(
        &mut self,
        pages: &mut impl PageSource,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.alloc(pages, new_size);
        };
        if new_size == 0 {
            self.free(ptr);
            return None;
        }
        let offset = self.block_of(ptr)?;
        let block = self.read_header(offset);
        if block.is_free != 0 {
            return None;
        }
        if block.size as usize >= new_size {
            return Some(ptr);
        }

        let new_ptr = self.alloc(pages, new_size)?;
        // SAFETY: both blocks are live, distinct and at least this large
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), block.size as usize);
        }
        self.free(ptr);
        Some(new_ptr)
    }

    /// Zero-filled allocation of `count * size` bytes.
    pub fn calloc(
        &mut self,
        pages: &mut impl PageSource,
        count: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.alloc(pages, bytes)?;
        // SAFETY: the block has at least `bytes` of payload
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Walks every block in address order.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            total: self.size,
            used: 0,
            free: 0,
            blocks: 0,
            free_blocks: 0,
        };
        for (_, block) in self.blocks() {
            stats.blocks += 1;
            if block.is_free != 0 {
                stats.free += block.size as usize;
                stats.free_blocks += 1;
            }
        }
        stats.used = stats.total - stats.free;
        stats
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Virtual address of a pointer into the heap window.
    pub fn virt_addr_of(&self, ptr: NonNull<u8>) -> Option<VirtAddr> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base.as_ptr() as usize)?;
        if offset >= self.size {
            return None;
        }
        self.start.checked_add(offset)
    }

    /// Grows the heap by at least `min_size` plus a header, in whole pages.
    fn expand(&mut self, pages: &mut impl PageSource, min_size: usize) -> bool {
        let room = self.max_size - self.size;
        if room < PAGE_SIZE {
            log::warn!("heap: at maximum size {:#x}", self.max_size);
            return false;
        }
        let step = align_up(min_size + HEADER_SIZE, PAGE_SIZE).min(room);

        if let Err((vaddr, error)) = self.back_range(pages, self.size, step) {
            log::warn!("heap: could not grow at {}: {}", vaddr, error);
            return false;
        }

        let old_end = self.size as u32;
        self.size += step;
        self.write_header(old_end, BlockHeader {
            size: (step - HEADER_SIZE) as u32,
            is_free: 1,
            next: NIL,
            prev: NIL,
        });
        self.insert_free(old_end);
        self.coalesce();

        log::debug!("heap: grew by {:#x} to {:#x}", step, self.size);
        true
    }

    /// Backs `[from, from + len)` page by page, releasing everything already
    /// backed if one page fails.
    fn back_range(
        &mut self,
        pages: &mut impl PageSource,
        from: usize,
        len: usize,
    ) -> Result<(), (VirtAddr, MapError)> {
        for done in (0..len).step_by(PAGE_SIZE) {
            let vaddr = VirtAddr::new(self.start.as_u32() + (from + done) as u32);
            if let Err(error) = pages.back_page(vaddr) {
                for undo in (0..done).step_by(PAGE_SIZE) {
                    pages.release_page(VirtAddr::new(self.start.as_u32() + (from + undo) as u32));
                }
                return Err((vaddr, error));
            }
        }
        Ok(())
    }

    fn find_fit(&self, size: usize) -> Option<u32> {
        let mut current = self.free_head;
        while current != NIL {
            let block = self.read_header(current);
            if block.size as usize >= size {
                return Some(current);
            }
            current = block.next;
        }
        None
    }

    /// Links a block into the free list at its address-ordered position.
    fn insert_free(&mut self, offset: u32) {
        let mut prev = NIL;
        let mut next = self.free_head;
        while next != NIL && next < offset {
            prev = next;
            next = self.read_header(next).next;
        }

        let mut block = self.read_header(offset);
        block.is_free = 1;
        block.prev = prev;
        block.next = next;
        self.write_header(offset, block);

        if prev == NIL {
            self.free_head = offset;
        } else {
            self.update_header(prev, |h| h.next = offset);
        }
        if next != NIL {
            self.update_header(next, |h| h.prev = offset);
        }
    }

    fn unlink(&mut self, offset: u32) {
        let block = self.read_header(offset);
        if block.prev == NIL {
            self.free_head = block.next;
        } else {
            self.update_header(block.prev, |h| h.next = block.next);
        }
        if block.next != NIL {
            self.update_header(block.next, |h| h.prev = block.prev);
        }
    }

    /// Merges every free block with its list successor while they touch.
    fn coalesce(&mut self) {
        let mut current = self.free_head;
        while current != NIL {
            let mut block = self.read_header(current);
            let end = current + HEADER_SIZE as u32 + block.size;
            if block.next != NIL && block.next == end {
                let absorbed = self.read_header(block.next);
                block.size += HEADER_SIZE as u32 + absorbed.size;
                block.next = absorbed.next;
                self.write_header(current, block);
                if absorbed.next != NIL {
                    self.update_header(absorbed.next, |h| h.prev = current);
                }
                // the grown block may now touch its new successor
                continue;
            }
            current = block.next;
        }
    }

    /// Header offset for a payload pointer, if it starts a block.
    fn block_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        let payload = (ptr.as_ptr() as usize).checked_sub(self.base.as_ptr() as usize)?;
        if payload < HEADER_SIZE || payload >= self.size {
            return None;
        }
        let offset = (payload - HEADER_SIZE) as u32;
        self.blocks()
            .map(|(block_offset, _)| block_offset)
            .take_while(|&block_offset| block_offset <= offset)
            .any(|block_offset| block_offset == offset)
            .then_some(offset)
    }

    fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            offset: 0,
        }
    }

    fn payload(&self, offset: u32) -> NonNull<u8> {
        // SAFETY: offset + HEADER_SIZE stays inside the window
        unsafe { self.base.add(offset as usize + HEADER_SIZE) }
    }

    fn read_header(&self, offset: u32) -> BlockHeader {
        debug_assert!(offset as usize + HEADER_SIZE <= self.size);
        // SAFETY: headers sit at 8 byte aligned offsets inside the backed range
        unsafe { self.base.add(offset as usize).cast::<BlockHeader>().read() }
    }

    fn write_header(&mut self, offset: u32, header: BlockHeader) {
        debug_assert!(offset as usize + HEADER_SIZE <= self.size);
        // SAFETY: see read_header
        unsafe { self.base.add(offset as usize).cast::<BlockHeader>().write(header) }
    }

    fn update_header(&mut self, offset: u32, f: impl FnOnce(&mut BlockHeader)) {
        let mut header = self.read_header(offset);
        f(&mut header);
        self.write_header(offset, header);
    }

    /// Panics if the block chain and the free list disagree.
    #[cfg(test)]
    fn check_invariants(&self) {
        use alloc::vec::Vec;

        let mut walked = 0;
        let mut physical_free = Vec::new();
        let mut previous_free = false;
        for (offset, block) in self.blocks() {
            walked += HEADER_SIZE + block.size as usize;
            let free = block.is_free != 0;
            assert!(!(free && previous_free), "adjacent free blocks at {:#x}", offset);
            if free {
                physical_free.push(offset);
            }
            previous_free = free;
        }
        assert_eq!(walked, self.size);

        let mut listed = Vec::new();
        let mut prev = NIL;
        let mut current = self.free_head;
        while current != NIL {
            let block = self.read_header(current);
            assert_eq!(block.prev, prev);
            listed.push(current);
            prev = current;
            current = block.next;
        }
        assert_eq!(listed, physical_free);
    }
}

/// Iterator over `(offset, header)` of every block in address order.
struct Blocks<'a> {
    heap: &'a Heap,
    offset: usize,
}

impl Iterator for Blocks<'_> {
    type Item = (u32, BlockHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + HEADER_SIZE > self.heap.size {
            return None;
        }
        let offset = self.offset as u32;
        let block = self.heap.read_header(offset);
        self.offset += HEADER_SIZE + block.size as usize;
        Some((offset, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    const KIB: usize = 1024;
    const START: VirtAddr = VirtAddr::new(0x0040_0000);

    /// Hands out pages until `limit` are backed.
    struct TestPages {
        limit: usize,
        backed: Vec<VirtAddr>,
        released: Vec<VirtAddr>,
    }

    impl PageSource for TestPages {
        fn back_page(&mut self, vaddr: VirtAddr) -> Result<(), MapError> {
            if self.backed.len() >= self.limit {
                return Err(MapError::OutOfFrames);
            }
            self.backed.push(vaddr);
            Ok(())
        }

        fn release_page(&mut self, vaddr: VirtAddr) {
            self.backed.retain(|&backed| backed != vaddr);
            self.released.push(vaddr);
        }
    }

    struct TestHeap {
        heap: Heap,
        pages: TestPages,
        _window: Vec<u64>,
    }

    impl TestHeap {
        fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
            self.heap.alloc(&mut self.pages, size)
        }
    }

    fn heap_with_page_limit(initial: usize, max: usize, limit: usize) -> TestHeap {
        let mut window = vec![0u64; max / size_of::<u64>()];
        let base = NonNull::new(window.as_mut_ptr().cast::<u8>()).unwrap();
        let mut pages = TestPages {
            limit,
            backed: Vec::new(),
            released: Vec::new(),
        };
        let heap = Heap::init(base, START, initial, max, &mut pages).unwrap();
        TestHeap {
            heap,
            pages,
            _window: window,
        }
    }

    fn heap(initial: usize, max: usize) -> TestHeap {
        heap_with_page_limit(initial, max, usize::MAX)
    }

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn test_init_creates_one_free_block() {
        let t = heap(64 * KIB, 256 * KIB);
        let stats = t.heap.stats();

        assert_eq!(stats.total, 64 * KIB);
        assert_eq!(stats.free, 64 * KIB - HEADER_SIZE);
        assert_eq!(stats.used, HEADER_SIZE);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(t.pages.backed.len(), 16);
        t.heap.check_invariants();
    }

    #[test]
    fn test_init_rejects_bad_ranges() {
        let mut window = vec![0u64; 1024];
        let base = NonNull::new(window.as_mut_ptr().cast::<u8>()).unwrap();
        let mut pages = TestPages {
            limit: usize::MAX,
            backed: Vec::new(),
            released: Vec::new(),
        };

        assert_eq!(
            Heap::init(base, START, 8 * KIB, 4 * KIB, &mut pages).err(),
            Some(HeapError::InvalidRange)
        );
        assert_eq!(
            Heap::init(base, VirtAddr::new(0x0040_0010), 4 * KIB, 8 * KIB, &mut pages).err(),
            Some(HeapError::InvalidRange)
        );
        assert!(pages.backed.is_empty());
    }

    #[test]
    fn test_init_failure_releases_backed_pages() {
        let mut window = vec![0u64; 16 * KIB / 8];
        let base = NonNull::new(window.as_mut_ptr().cast::<u8>()).unwrap();
        let mut pages = TestPages {
            limit: 2,
            backed: Vec::new(),
            released: Vec::new(),
        };

        let result = Heap::init(base, START, 16 * KIB, 16 * KIB, &mut pages);

        assert_eq!(
            result.err(),
            Some(HeapError::Backing {
                vaddr: VirtAddr::new(0x0040_2000),
                error: MapError::OutOfFrames,
            })
        );
        assert!(pages.backed.is_empty());
        assert_eq!(pages.released.len(), 2);
    }

    #[test]
    fn test_zero_size_alloc_returns_none() {
        let mut t = heap(64 * KIB, 64 * KIB);
        assert_eq!(t.alloc(0), None);
        assert_eq!(t.heap.stats().free_blocks, 1);
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let mut t = heap(64 * KIB, 64 * KIB);

        let a = t.alloc(3).unwrap();
        let b = t.alloc(13).unwrap();
        let c = t.alloc(100).unwrap();

        for ptr in [a, b, c] {
            assert_eq!(addr(ptr) % HEAP_ALIGN, 0);
        }
        // sizes round up to 8, 16 and 104
        assert_eq!(addr(b) - addr(a), HEADER_SIZE + 8);
        assert_eq!(addr(c) - addr(b), HEADER_SIZE + 16);
        t.heap.check_invariants();
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let mut t = heap(4 * KIB, 4 * KIB);
        let whole = 4 * KIB - HEADER_SIZE;

        // the remainder would be exactly header + 16, which is not enough
        t.alloc(whole - HEADER_SIZE - MIN_SPLIT_REMAINDER).unwrap();

        let stats = t.heap.stats();
        assert_eq!(stats.free, 0);
        assert_eq!(stats.blocks, 1);
    }

    #[test]
    fn test_free_coalesces_in_any_order() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut t = heap(64 * KIB, 64 * KIB);
            let blocks = [t.alloc(64).unwrap(), t.alloc(64).unwrap(), t.alloc(64).unwrap()];

            for index in order {
                assert!(t.heap.free(blocks[index]));
                t.heap.check_invariants();
            }

            let stats = t.heap.stats();
            assert_eq!(stats.free_blocks, 1, "order {:?}", order);
            assert_eq!(stats.free, 64 * KIB - HEADER_SIZE);
        }
    }

    #[test]
    fn test_double_free_is_ignored() {
        let mut t = heap(64 * KIB, 64 * KIB);
        let a = t.alloc(32).unwrap();
        let _b = t.alloc(32).unwrap();

        assert!(t.heap.free(a));
        let after_first = t.heap.stats();
        assert!(!t.heap.free(a));

        assert_eq!(t.heap.stats(), after_first);
        t.heap.check_invariants();
    }

    #[test]
    fn test_free_of_foreign_or_interior_pointer_is_ignored() {
        let mut t = heap(64 * KIB, 64 * KIB);
        let a = t.alloc(64).unwrap();
        let before = t.heap.stats();

        let mut outside = 0u64;
        assert!(!t.heap.free(NonNull::from(&mut outside).cast()));
        assert!(!t.heap.free(unsafe { a.add(8) }));

        assert_eq!(t.heap.stats(), before);
    }

    #[test]
    fn test_freed_block_is_reused_first_fit() {
        let mut t = heap(64 * KIB, 64 * KIB);
        let a = t.alloc(128).unwrap();
        let _b = t.alloc(128).unwrap();

        t.heap.free(a);

        assert_eq!(t.alloc(64), Some(a));
    }

    #[test]
    fn test_exact_fit_then_one_byte_expands_by_a_page() {
        let initial = 64 * KIB;
        let mut t = heap(initial, 256 * KIB);

        t.alloc(initial - HEADER_SIZE).unwrap();
        assert_eq!(t.heap.stats().free, 0);
        assert_eq!(t.heap.stats().total, initial);

        t.alloc(1).unwrap();
        assert_eq!(t.heap.stats().total, initial + PAGE_SIZE);
        t.heap.check_invariants();
    }

    #[test]
    fn test_large_allocation_grows_heap() {
        let initial = 1024 * KIB;
        let mut t = heap(initial, 4096 * KIB);

        let ptr = t.alloc(1024 * KIB - 1).unwrap();

        let stats = t.heap.stats();
        assert!(stats.total >= initial + PAGE_SIZE);
        assert!(addr(ptr) >= addr(t.heap.base));
        t.heap.check_invariants();
    }

    #[test]
    fn test_growth_merges_with_free_tail() {
        let mut t = heap(8 * KIB, 64 * KIB);
        let _head = t.alloc(1024).unwrap();

        // the free tail is too small, the new pages are appended to it
        t.alloc(8 * KIB).unwrap();

        let stats = t.heap.stats();
        assert_eq!(stats.blocks, 3);
        t.heap.check_invariants();
    }

    #[test]
    fn test_alloc_fails_at_max_size() {
        let mut t = heap(8 * KIB, 8 * KIB);
        let before = t.heap.stats();

        assert_eq!(t.alloc(16 * KIB), None);
        assert_eq!(t.heap.stats(), before);
    }

    #[test]
    fn test_request_larger_than_any_block_does_not_grow() {
        let mut t = heap(8 * KIB, 12 * KIB);
        let backed = t.pages.backed.len();

        assert_eq!(t.alloc(12 * KIB - HEADER_SIZE + 1), None);
        assert_eq!(t.pages.backed.len(), backed);
        assert_eq!(t.heap.stats().total, 8 * KIB);

        assert!(t.alloc(12 * KIB - HEADER_SIZE).is_some());
        assert_eq!(t.heap.stats().total, 12 * KIB);
        t.heap.check_invariants();
    }

    #[test]
    fn test_growth_is_clamped_to_max_size() {
        let mut t = heap(8 * KIB, 12 * KIB);

        // wants 12 KiB more, only 4 KiB is left, which merged with the tail is enough
        assert!(t.alloc(10 * KIB).is_some());
        assert_eq!(t.heap.stats().total, 12 * KIB);
        t.heap.check_invariants();

        assert_eq!(t.alloc(4 * KIB), None);
    }

    #[test]
    fn test_failed_growth_is_rolled_back() {
        let mut t = heap_with_page_limit(8 * KIB, 64 * KIB, 4);
        let before = t.heap.stats();

        assert_eq!(t.alloc(16 * KIB), None);

        assert_eq!(t.heap.stats(), before);
        assert_eq!(t.pages.backed.len(), 2);
        assert_eq!(t.pages.released.len(), 2);
        t.heap.check_invariants();
    }

    #[test]
    fn test_realloc_grows_and_keeps_contents() {
        let mut t = heap(64 * KIB, 64 * KIB);
        let a = t.alloc(16).unwrap();
        let _fence = t.alloc(16).unwrap();
        unsafe {
            for i in 0..16 {
                a.as_ptr().add(i).write(i as u8);
            }
        }

        let b = t.heap.realloc(&mut t.pages, Some(a), 256).unwrap();

        assert_ne!(a, b);
        for i in 0..16 {
            assert_eq!(unsafe { b.as_ptr().add(i).read() }, i as u8);
        }
        t.heap.check_invariants();
    }

    #[test]
    fn test_realloc_in_place_and_null() {
        let mut t = heap(64 * KIB, 64 * KIB);
        let a = t.alloc(64).unwrap();

        assert_eq!(t.heap.realloc(&mut t.pages, Some(a), 60), Some(a));
        assert!(t.heap.realloc(&mut t.pages, None, 32).is_some());
    }

    #[test]
    fn test_realloc_failure_keeps_old_block() {
        let mut t = heap(8 * KIB, 8 * KIB);
        let a = t.alloc(64).unwrap();
        unsafe { a.as_ptr().write(0xAB) };

        assert_eq!(t.heap.realloc(&mut t.pages, Some(a), 64 * KIB), None);

        assert_eq!(unsafe { a.as_ptr().read() }, 0xAB);
        assert!(t.heap.free(a));
    }

    #[test]
    fn test_realloc_to_zero_frees() {
        let mut t = heap(8 * KIB, 8 * KIB);
        let a = t.alloc(64).unwrap();

        assert_eq!(t.heap.realloc(&mut t.pages, Some(a), 0), None);
        assert_eq!(t.heap.stats().free_blocks, 1);
    }

    #[test]
    fn test_calloc_zeroes_reused_memory() {
        let mut t = heap(8 * KIB, 8 * KIB);
        let a = t.alloc(128).unwrap();
        unsafe { a.as_ptr().write_bytes(0xFF, 128) };
        t.heap.free(a);

        let b = t.heap.calloc(&mut t.pages, 16, 8).unwrap();

        assert_eq!(a, b);
        assert!((0..128).all(|i| unsafe { b.as_ptr().add(i).read() } == 0));
    }

    #[test]
    fn test_calloc_overflow_returns_none() {
        let mut t = heap(8 * KIB, 8 * KIB);
        assert_eq!(t.heap.calloc(&mut t.pages, usize::MAX, 2), None);
    }

    #[test]
    fn test_virt_addr_of_maps_into_heap_range() {
        let mut t = heap(8 * KIB, 8 * KIB);
        let a = t.alloc(8).unwrap();

        assert_eq!(
            t.heap.virt_addr_of(a),
            Some(VirtAddr::new(START.as_u32() + HEADER_SIZE as u32))
        );
    }

    #[test]
    fn test_random_alloc_free_keeps_blocks_disjoint() {
        let mut rng = SmallRng::seed_from_u64(0x4ea9);
        let mut t = heap(16 * KIB, 128 * KIB);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..=600);
                if let Some(ptr) = t.alloc(size) {
                    let start = addr(ptr);
                    for &(other, other_size) in &live {
                        assert!(start + size <= other || other + other_size <= start);
                    }
                    live.push((start, size));
                }
            } else {
                let (start, _) = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(t.heap.free(NonNull::new(start as *mut u8).unwrap()));
            }

            let stats = t.heap.stats();
            assert_eq!(stats.used + stats.free, stats.total);
            t.heap.check_invariants();
        }

        for (start, _) in live.drain(..) {
            t.heap.free(NonNull::new(start as *mut u8).unwrap());
        }
        assert_eq!(t.heap.stats().free_blocks, 1);
    }
}
