//! Swap storage.
//!
//! The swap device is divided into page-sized slots. A dirty page that is
//! evicted is written to a free slot, and read back from it on the next
//! fault. Slots live only as long as the kernel runs; a process's slots are
//! released when the page is read back or when the process exits.
use crate::{KernelError, addressing::PAGE_SIZE};
use alloc::{vec, vec::Vec};

/// Index of a slot on the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

/// A fixed-size-slot backing store for evicted pages.
///
/// All operations are serialized by the frame pool lock, so implementations
/// need no internal locking.
pub trait SwapStore: Send {
    /// Number of slots on the device.
    fn capacity(&self) -> usize;

    /// Number of slots currently allocated.
    fn in_use(&self) -> usize;

    /// Reserves a free slot, or returns `None` if the device is full.
    fn allocate_slot(&mut self) -> Option<SlotId>;

    /// Writes one page to `slot`. `page` is exactly [`PAGE_SIZE`] bytes.
    fn write_slot(&mut self, slot: SlotId, page: &[u8]) -> Result<(), KernelError>;

    /// Reads one page from `slot`. `page` is exactly [`PAGE_SIZE`] bytes.
    fn read_slot(&mut self, slot: SlotId, page: &mut [u8]) -> Result<(), KernelError>;

    /// Returns `slot` to the free state.
    fn free_slot(&mut self, slot: SlotId);
}

/// A swap device held in memory.
///
/// Slot usage is tracked with a bitmap, one bit per slot: 1 means the slot is
/// free, 0 means it is used.
pub struct MemorySwap {
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
    storage: Vec<u8>,
}

impl MemorySwap {
    /// Creates a swap device with `slots` free slots.
    pub fn new(slots: usize) -> Self {
        let mut bitmap = vec![!0u64; slots.div_ceil(64)];
        if slots % 64 != 0 {
            // Slots past the end are never free.
            if let Some(last) = bitmap.last_mut() {
                *last = (1u64 << (slots % 64)) - 1;
            }
        }
        Self {
            bitmap,
            slots,
            used: 0,
            storage: vec![0; slots * PAGE_SIZE],
        }
    }

    fn set_used(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] &= !(1 << ofs);
    }

    fn set_unused(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_eq!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] |= 1 << ofs;
    }

    fn is_used(&self, slot: SlotId) -> bool {
        slot.0 < self.slots && self.bitmap[slot.0 / 64] & (1 << (slot.0 % 64)) == 0
    }

    fn range(slot: SlotId) -> core::ops::Range<usize> {
        slot.0 * PAGE_SIZE..(slot.0 + 1) * PAGE_SIZE
    }
}

impl SwapStore for MemorySwap {
    fn capacity(&self) -> usize {
        self.slots
    }

    fn in_use(&self) -> usize {
        self.used
    }

    fn allocate_slot(&mut self) -> Option<SlotId> {
        // search first qword that contains one.
        let pos = self.bitmap.iter().position(|qword| *qword != 0)?;
        let index = pos * 64 + self.bitmap[pos].trailing_zeros() as usize;
        self.set_used(index);
        self.used += 1;
        Some(SlotId(index))
    }

    fn write_slot(&mut self, slot: SlotId, page: &[u8]) -> Result<(), KernelError> {
        if !self.is_used(slot) || page.len() != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        self.storage[Self::range(slot)].copy_from_slice(page);
        Ok(())
    }

    fn read_slot(&mut self, slot: SlotId, page: &mut [u8]) -> Result<(), KernelError> {
        if !self.is_used(slot) || page.len() != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        page.copy_from_slice(&self.storage[Self::range(slot)]);
        Ok(())
    }

    fn free_slot(&mut self, slot: SlotId) {
        if self.is_used(slot) {
            self.set_unused(slot.0);
            self.used -= 1;
        }
    }
}
