//! Access to the contents of physical frames.
//!
//! Page tables live in physical frames handed out by the frame allocator. The
//! paging code never turns a physical address into a pointer itself; it asks a
//! [`PhysMemory`] for a view of the frame, which may refuse.

use core::ptr::NonNull;

use crate::memory::address::FrameId;

/// A bounds-checked view of physical memory.
///
/// # Safety
///
/// A returned pointer must be 4096-byte aligned, valid for reads and writes of
/// 4096 bytes, and not aliased by anything other than the caller for as long as
/// the frame stays allocated to it.
pub unsafe trait PhysMemory {
    /// Returns the first byte of `frame`, or `None` if the frame is not
    /// reachable through this view.
    fn frame_ptr(&self, frame: FrameId) -> Option<NonNull<u8>>;
}
