pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Entries in a page directory and in a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Physical load address of the kernel image.
pub const KERNEL_LOAD_ADDRESS: u32 = 0x0010_0000;
/// Everything below this is pre-marked allocated: legacy low memory plus the
/// kernel image, reserved through 1 MiB past its load address.
pub const KERNEL_RESERVED_TOP: u32 = KERNEL_LOAD_ADDRESS + 0x0010_0000;

/// Size of the identity-mapped region set up before paging is enabled.
pub const IDENTITY_MAP_SIZE: u32 = 4 * 1024 * 1024;

pub const HEAP_START: u32 = 0x0040_0000;
pub const HEAP_INITIAL_SIZE: usize = 1024 * 1024; // 1 MiB
pub const HEAP_MAX_SIZE: usize = 8 * 1024 * 1024; // 8 MiB
/// Every heap allocation is aligned to this many bytes.
pub const HEAP_ALIGN: usize = 8;

// The bitmap is inline so it can exist before the heap does.
pub const MAX_PHYSICAL_MEMORY: usize = 128 * 1024 * 1024;
pub const MAX_FRAMES: usize = MAX_PHYSICAL_MEMORY / FRAME_SIZE;
pub const BITMAP_ENTRY_SIZE: usize = 32;
pub const BITMAP_ENTRIES: usize = MAX_FRAMES / BITMAP_ENTRY_SIZE;
pub const FULL_BITMAP_ENTRY: u32 = 0xFFFF_FFFF;
