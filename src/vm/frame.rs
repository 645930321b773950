//! Frame pool.
//!
//! The frame pool is the fixed table of physical frames that user pages are
//! loaded into. Each frame is either free, or owned by exactly one virtual
//! page of one process. A frame is handed out *pinned*: the new owner is
//! about to fill it, and the eviction policy must not pick it until the owner
//! unpins it.
//!
//! When no frame is free, [`FramePool::allocate`] takes one away from its
//! current owner. The [`Clock`] picks the victim, and an [`Evictor`] supplied
//! by the caller preserves the victim's content and detaches it from its
//! page before the frame changes hands.
//!
//! The pool itself holds no lock. It lives inside the pool-wide lock of the
//! [`VmManager`] together with the swap store.
//!
//! [`VmManager`]: crate::VmManager
use crate::{
    Pid,
    addressing::Vpn,
    mm::{FrameId, page_table::Mmu},
    vm::{clock::Clock, fault::FaultError},
};
use alloc::vec::Vec;

/// The virtual page a frame is loaded for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    /// Process that owns the frame.
    pub pid: Pid,
    /// Virtual page the frame backs.
    pub vpn: Vpn,
}

/// Bookkeeping of one physical frame.
///
/// The accessed and dirty bits are not stored here; they live in the page
/// table entry of the owner's mapping and are queried through the [`Mmu`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Frame {
    owner: Option<Owner>,
    pinned: bool,
}

impl Frame {
    /// The page this frame is loaded for, or `None` if the frame is free.
    pub fn owner(&self) -> Option<Owner> {
        self.owner
    }

    /// Returns `true` if the frame may not be evicted.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Returns `true` if the frame is owned and not pinned, i.e. if the
    /// eviction policy may choose it.
    pub fn is_evictable(&self) -> bool {
        self.owner.is_some() && !self.pinned
    }
}

/// Preserves the content of a victim frame and detaches it from its page.
///
/// The frame pool calls [`Evictor::evict`] with the victim already pinned.
/// On success the victim's page must be unmapped and its supplemental page
/// table entry must describe where the content can be found again. On
/// failure the victim must be left exactly as it was: mapped and resident.
pub trait Evictor {
    /// Writes back `frame`, currently loaded for `owner`, if needed, and
    /// detaches it from `owner`.
    fn evict(&mut self, frame: FrameId, owner: Owner) -> Result<(), FaultError>;
}

/// The table of physical frames.
pub struct FramePool {
    frames: Vec<Frame>,
    free: Vec<FrameId>,
    clock: Clock,
}

impl FramePool {
    /// Creates a pool of `capacity` free frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: alloc::vec![Frame::default(); capacity],
            // Pop from the back hands out the lowest frame first.
            free: (0..capacity).rev().map(FrameId).collect(),
            clock: Clock::new(),
        }
    }

    /// Returns a frame owned by `owner` and pinned.
    ///
    /// A free frame is used if there is one. Otherwise the clock chooses a
    /// victim among the unpinned owned frames, the victim is pinned, and
    /// `evictor` writes it back and detaches it from its page before the
    /// frame is re-owned.
    ///
    /// # Returns
    /// - `Err(FaultError::ResourceExhaustion)` if every frame is pinned, or
    ///   if the swap store has no room for the victim.
    /// - `Err(FaultError::IoFailure)` if writing the victim back failed. The
    ///   victim stays resident with its pin released.
    pub fn allocate(
        &mut self,
        owner: Owner,
        mmu: &dyn Mmu,
        evictor: &mut dyn Evictor,
    ) -> Result<FrameId, FaultError> {
        if let Some(id) = self.free.pop() {
            self.frames[id.into_usize()] = Frame {
                owner: Some(owner),
                pinned: true,
            };
            return Ok(id);
        }

        let victim = self
            .clock
            .select(&self.frames, mmu)
            .ok_or(FaultError::ResourceExhaustion)?;
        let slot = &mut self.frames[victim.into_usize()];
        let victim_owner = slot.owner.ok_or(FaultError::ResourceExhaustion)?;
        slot.pinned = true;
        log::debug!(
            "Evict: {:?} from {:?}:{:?} for {:?}:{:?}",
            victim,
            victim_owner.pid,
            victim_owner.vpn,
            owner.pid,
            owner.vpn
        );
        match evictor.evict(victim, victim_owner) {
            Ok(()) => {
                self.frames[victim.into_usize()] = Frame {
                    owner: Some(owner),
                    pinned: true,
                };
                Ok(victim)
            }
            Err(e) => {
                log::warn!("Evict: write-back of {:?} failed: {}", victim, e);
                self.frames[victim.into_usize()].pinned = false;
                Err(e)
            }
        }
    }

    /// Pins frame `id` so that it is never chosen for eviction.
    pub fn pin(&mut self, id: FrameId) {
        if let Some(frame) = self.frames.get_mut(id.into_usize()) {
            frame.pinned = true;
        }
    }

    /// Unpins frame `id`.
    pub fn unpin(&mut self, id: FrameId) {
        if let Some(frame) = self.frames.get_mut(id.into_usize()) {
            frame.pinned = false;
        }
    }

    /// Returns frame `id` to the free list, clearing its owner and its pin.
    ///
    /// Releasing a free frame has no effect.
    pub fn release(&mut self, id: FrameId) {
        if let Some(frame) = self.frames.get_mut(id.into_usize()) {
            if frame.owner.take().is_some() {
                self.free.push(id);
            }
            frame.pinned = false;
        }
    }

    /// The page frame `id` is loaded for.
    pub fn owner_of(&self, id: FrameId) -> Option<Owner> {
        self.frames.get(id.into_usize()).and_then(Frame::owner)
    }

    /// Returns `true` if frame `id` is pinned.
    pub fn is_pinned(&self, id: FrameId) -> bool {
        self.frames
            .get(id.into_usize())
            .is_some_and(Frame::is_pinned)
    }

    /// Number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of frames owned by process `pid`.
    pub fn owned_by(&self, pid: Pid) -> usize {
        self.iter()
            .filter(|(_, frame)| frame.owner.is_some_and(|o| o.pid == pid))
            .count()
    }

    /// Iterates over every frame of the pool.
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &Frame)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(idx, frame)| (FrameId(idx), frame))
    }
}
