//! Clock (second-chance) eviction policy.
//!
//! The clock approximates least-recently-used replacement with the accessed
//! bit that the CPU sets in a page table entry whenever the page is used. The
//! frames form a circle, and a hand sweeps over them:
//!
//! ```text
//!            hand
//!             |
//!             v
//!   +---+---+---+---+---+---+
//!   | A | a | P | a | . | D |    A/a: accessed bit set / clear
//!   +---+---+---+---+---+---+    P: pinned, .: free, D: dirty
//! ```
//!
//! A frame whose accessed bit is set gets a second chance: the bit is cleared
//! and the hand moves on. A frame whose bit is clear has not been used since
//! the last sweep and is a candidate. Clean candidates are preferred, since
//! evicting them needs no write to swap; a dirty candidate is only taken
//! after one more revolution failed to find a clean one.
use crate::{
    mm::{FrameId, page_table::Mmu},
    vm::frame::Frame,
};

/// The state of the clock: the position of its hand.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    /// Creates a clock whose hand points at the first frame.
    pub fn new() -> Self {
        Self { hand: 0 }
    }

    #[cfg(test)]
    fn hand(&self) -> usize {
        self.hand
    }

    /// Chooses a victim among `frames`.
    ///
    /// Free and pinned frames are skipped. The accessed bits of the frames
    /// the hand passes over are cleared through `mmu`. The scan covers at
    /// most two revolutions, enough to find a victim whenever an unpinned
    /// owned frame exists. The hand is left right after the victim.
    ///
    /// # Returns
    /// - `Some(FrameId)`: the victim.
    /// - `None`: every frame is free or pinned.
    pub fn select(&mut self, frames: &[Frame], mmu: &dyn Mmu) -> Option<FrameId> {
        let n = frames.len();
        if n == 0 {
            return None;
        }
        self.hand %= n;

        let mut fallback: Option<usize> = None;
        let mut budget = 2 * n;
        let mut step = 0;
        while step < budget {
            let idx = self.hand;
            self.hand = (self.hand + 1) % n;
            step += 1;

            let frame = &frames[idx];
            let Some(owner) = frame.owner().filter(|_| !frame.is_pinned()) else {
                continue;
            };
            if mmu.is_accessed(owner.pid, owner.vpn) {
                mmu.clear_accessed(owner.pid, owner.vpn);
                continue;
            }
            if !mmu.is_dirty(owner.pid, owner.vpn) {
                return Some(FrameId(idx));
            }
            if fallback.is_none() {
                fallback = Some(idx);
                budget = budget.min(step + n);
            }
        }

        let idx = fallback?;
        self.hand = (idx + 1) % n;
        Some(FrameId(idx))
    }
}
