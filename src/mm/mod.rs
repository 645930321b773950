//! Physical memory.
//!
//! The physical memory available to user processes is a fixed arena of
//! page-sized frames, created once when the virtual memory manager starts.
//! Each frame is identified by its index in the arena, the [`FrameId`]. The
//! frame pool hands out identifiers; this module only stores the bytes.
//!
//! Every frame's content sits behind its own [`SpinLock`]. The lock makes each
//! individual access to a frame memory-safe, but it does not reserve the
//! frame: a frame being populated or written back is kept away from other
//! users by *pinning* it in the frame pool. This lets the pager read a page
//! from a file into a frame without holding the pool-wide lock.
//!
//! [`SpinLock`]: crate::sync::SpinLock

pub mod page_table;

use crate::{addressing::PAGE_SIZE, sync::SpinLock};
use alloc::{boxed::Box, vec::Vec};

/// Index of a physical frame in the [`PhysicalMemory`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Returns the index of the frame.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

/// A page-sized, page-aligned chunk of memory.
///
/// A [`Page`] is the content of one frame. It always holds exactly
/// [`PAGE_SIZE`] bytes.
#[repr(C, align(4096))]
pub struct Page {
    inner: [u8; PAGE_SIZE],
}

impl Page {
    /// Allocates a new zero-filled page on the heap.
    pub fn new() -> Box<Self> {
        Box::new(Page {
            inner: [0; PAGE_SIZE],
        })
    }

    /// Get a reference to the underlying slice of the page (read-only).
    pub fn inner(&self) -> &[u8] {
        &self.inner
    }

    /// Get a mutable reference to the underlying slice of the page.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    /// Fill the whole page with zero.
    pub fn zero(&mut self) {
        self.inner.fill(0);
    }
}

/// The arena of physical frames.
pub struct PhysicalMemory {
    frames: Box<[SpinLock<Box<Page>>]>,
}

impl PhysicalMemory {
    /// Allocates `count` zero-filled frames.
    pub fn new(count: usize) -> Self {
        Self {
            frames: (0..count)
                .map(|_| SpinLock::new(Page::new()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    /// Number of frames in the arena.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` if the arena holds no frame.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Runs `f` with exclusive access to the content of frame `id`.
    ///
    /// # Panics
    /// Panics if `id` is out of the arena.
    pub fn with_frame<R>(&self, id: FrameId, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut guard = self.frames[id.into_usize()].lock();
        let r = f(&mut **guard);
        guard.unlock();
        r
    }
}
