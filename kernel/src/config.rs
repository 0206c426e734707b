//! Boot-time memory layout.

use core::fmt;

use crate::constants::memory::{
    HEAP_INITIAL_SIZE, HEAP_MAX_SIZE, HEAP_START, IDENTITY_MAP_SIZE, KERNEL_RESERVED_TOP,
    PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    /// End of usable physical memory.
    pub memory_top: u32,
    /// Frames below this are never handed out.
    pub reserved_top: u32,
    pub heap_start: u32,
    pub heap_initial_size: usize,
    pub heap_max_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Memory ends before the reserved region does.
    MemoryBelowReserved { memory_top: u32, reserved_top: u32 },
    /// The heap would overlap the identity-mapped low memory.
    HeapOverlapsIdentityMap,
    HeapNotPageAligned,
    /// Initial size is zero or larger than the maximum.
    BadHeapSize,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MemoryBelowReserved {
                memory_top,
                reserved_top,
            } => write!(
                f,
                "Memory top {:#x} is below the reserved top {:#x}",
                memory_top, reserved_top
            ),
            ConfigError::HeapOverlapsIdentityMap => {
                write!(f, "Heap overlaps the identity-mapped region")
            }
            ConfigError::HeapNotPageAligned => write!(f, "Heap range is not page aligned"),
            ConfigError::BadHeapSize => write!(f, "Heap initial size must be in 1..=max size"),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            memory_top: 32 * 1024 * 1024,
            reserved_top: KERNEL_RESERVED_TOP,
            heap_start: HEAP_START,
            heap_initial_size: HEAP_INITIAL_SIZE,
            heap_max_size: HEAP_MAX_SIZE,
        }
    }
}

impl BootConfig {
    /// Layout for a machine reporting `mem_upper_kib` KiB above 1 MiB, as the
    /// multiboot `mem_upper` field does.
    pub fn from_multiboot(mem_upper_kib: u32) -> Self {
        let memory_top = mem_upper_kib
            .saturating_mul(1024)
            .saturating_add(1024 * 1024);
        BootConfig {
            memory_top,
            ..BootConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_top < self.reserved_top {
            return Err(ConfigError::MemoryBelowReserved {
                memory_top: self.memory_top,
                reserved_top: self.reserved_top,
            });
        }
        if self.heap_start < IDENTITY_MAP_SIZE {
            return Err(ConfigError::HeapOverlapsIdentityMap);
        }
        if self.heap_start as usize % PAGE_SIZE != 0
            || self.heap_initial_size % PAGE_SIZE != 0
            || self.heap_max_size % PAGE_SIZE != 0
        {
            return Err(ConfigError::HeapNotPageAligned);
        }
        if self.heap_initial_size == 0 || self.heap_initial_size > self.heap_max_size {
            return Err(ConfigError::BadHeapSize);
        }
        Ok(())
    }

    /// Smaller machine so tests running in parallel stay light.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        BootConfig {
            memory_top: 16 * 1024 * 1024,
            heap_max_size: 4 * 1024 * 1024,
            ..BootConfig::default()
        }
    }
}
