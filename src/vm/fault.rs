//! Page fault handling.
//!
//! A page fault is the CPU's way to tell the kernel that a user program
//! touched a page that is not in memory, or touched it in a way the page
//! table does not permit. The trap dispatcher decodes the fault into a
//! [`PageFaultReason`] and hands it to [`VmManager::handle_page_fault`].
//!
//! Handling a fault goes through the following states:
//! ```text
//! Validating --> Resolving --> Populating --> Installed
//!      |             |              |
//!      +-------------+--------------+-------> Rejected
//! ```
//! - **Validating**: the address must lie in the user address space, above
//!   the null page, and the process must be known.
//! - **Resolving**: the supplemental page table is consulted. A resident page
//!   means the fault is spurious (another thread already loaded the page). An
//!   unregistered page may still be a stack access; otherwise the access is
//!   invalid.
//! - **Populating**: a frame is allocated from the frame pool, possibly by
//!   evicting another page, and filled from the page's [`Backing`]. Files are
//!   read without holding the pool lock; the frame is pinned, so it cannot be
//!   taken away meanwhile.
//! - **Installed**: the page is mapped into the page table, marked resident,
//!   and the frame is unpinned.
//!
//! A rejected fault never leaves a partially installed page behind. The
//! caller is expected to terminate the faulting process with
//! [`FaultError::EXIT_STATUS`].
use crate::{
    KernelError, Pid,
    addressing::{PAGE_SIZE, Va, Vpn},
    mm::{
        FrameId,
        page_table::{Mmu, Permission},
    },
    vm::{
        Pool, VmManager,
        backing::Backing,
        frame::Owner,
        spt::SupplementalPageTable,
        swap::SwapStore,
    },
};

bitflags::bitflags! {
    /// Error code pushed by the CPU on a page fault.
    pub struct PFErrorCode: u64 {
        /// The fault was caused by a page-protection violation; when clear,
        /// the page was not present.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access was made in user mode.
        const USER = 1 << 2;
    }
}

/// The decoded cause of a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,
    /// The fault was caused by a write.
    pub is_write_access: bool,
    /// The page was present, i.e. the fault is a protection violation.
    pub is_present: bool,
    /// The fault happened while running user code.
    pub is_user: bool,
}

impl PageFaultReason {
    /// Decodes the error code `ec` and the faulting address `cr2` into a
    /// [`PageFaultReason`].
    pub fn new(ec: PFErrorCode, cr2: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
        }
    }

    /// Returns `true` if the fault asks for a page that is not in memory.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }
}

/// Progress of a fault through its handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    /// Checking the address and the process.
    Validating,
    /// Looking up the supplemental page table.
    Resolving,
    /// Filling a frame with the page content.
    Populating,
    /// The page is mapped.
    Installed,
    /// The fault cannot be served.
    Rejected,
}

/// Reasons a fault cannot be served.
///
/// Every variant means that the faulting process must be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    /// The address is null, in the kernel, or not part of the process.
    #[error("invalid memory access")]
    InvalidAddress,
    /// Reading the page content or writing back a victim failed.
    #[error("I/O error while paging")]
    IoFailure,
    /// No frame can be freed, or the swap device is full.
    ///
    /// This is a condition of the whole kernel, not of the faulting process.
    #[error("out of memory")]
    ResourceExhaustion,
}

impl FaultError {
    /// Exit status reported for a process killed by a fault.
    pub const EXIT_STATUS: i32 = -1;

    /// Returns `true` if the kernel ran out of frames or swap.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, FaultError::ResourceExhaustion)
    }
}

impl From<FaultError> for KernelError {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::InvalidAddress => KernelError::BadAddress,
            FaultError::IoFailure => KernelError::IOError,
            FaultError::ResourceExhaustion => KernelError::NoMemory,
        }
    }
}

/// Outcome of one attempt at serving a fault.
enum Step {
    Done,
    /// The page changed while it was being populated; start over.
    Retry,
}

impl<M: Mmu, S: SwapStore> VmManager<M, S> {
    /// Entry point of the trap dispatcher.
    ///
    /// Decodes `ec` and the faulting address `cr2`, then serves the fault
    /// with [`VmManager::handle_fault`]. When the fault comes from user mode,
    /// `rsp`, the user stack pointer saved in the trap frame, is recorded
    /// first so that stack growth is judged against it.
    ///
    /// A fault on a present page is a protection violation. A write to a
    /// read-only page is rejected right away; anything else means the page
    /// changed under the faulting access, which is then served as usual.
    pub fn handle_page_fault(
        &self,
        pid: Pid,
        ec: PFErrorCode,
        cr2: Va,
        rsp: Va,
    ) -> Result<(), FaultError> {
        let reason = PageFaultReason::new(ec, cr2);
        if reason.is_user {
            self.set_stack_pointer(pid, rsp)
                .map_err(|_| FaultError::InvalidAddress)?;
        }
        if !reason.is_demand_paging_fault()
            && reason.is_write_access
            && self
                .lookup(pid, reason.fault_addr.vpn())
                .is_some_and(|entry| !entry.writable)
        {
            log::warn!(
                "PageFault: {:?} wrote to read-only {:?}",
                pid,
                reason.fault_addr
            );
            return Err(FaultError::InvalidAddress);
        }
        self.handle_fault(
            pid,
            reason.fault_addr,
            reason.is_write_access,
            reason.is_user,
        )
    }

    /// Serves a page fault of process `pid` at `va`.
    ///
    /// On success the page holding `va` is resident and mapped with the
    /// permission recorded in the supplemental page table, and the faulting
    /// access can be restarted.
    ///
    /// # Returns
    /// - `Err(FaultError::InvalidAddress)`: `va` is not a valid address of the
    ///   process, or `is_write` is set and the page is read-only.
    /// - `Err(FaultError::IoFailure)`: the page content could not be read.
    /// - `Err(FaultError::ResourceExhaustion)`: no frame could be freed.
    pub fn handle_fault(
        &self,
        pid: Pid,
        va: Va,
        is_write: bool,
        is_user: bool,
    ) -> Result<(), FaultError> {
        log::trace!(
            "PageFault: {:?} at {:?} (write: {}, user: {})",
            pid,
            va,
            is_write,
            is_user
        );
        let mut state = FaultState::Validating;
        let result = loop {
            match self.fault_once(pid, va, is_write, &mut state) {
                Ok(Step::Done) => break Ok(()),
                Ok(Step::Retry) => {
                    log::debug!("PageFault: {:?} of {:?} changed, retrying", va, pid);
                }
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = result {
            log::warn!(
                "PageFault: {:?} at {:?}: {:?} -> {:?}: {}",
                pid,
                va,
                state,
                FaultState::Rejected,
                e
            );
        }
        result
    }

    fn fault_once(
        &self,
        pid: Pid,
        va: Va,
        is_write: bool,
        state: &mut FaultState,
    ) -> Result<Step, FaultError> {
        *state = FaultState::Validating;
        let addr = va.into_usize();
        if addr < PAGE_SIZE || addr >= self.config.user_top {
            return Err(FaultError::InvalidAddress);
        }
        let spt = self.spt(pid).ok_or(FaultError::InvalidAddress)?;
        let vpn = va.vpn();

        *state = FaultState::Resolving;
        let mut table = spt.lock();
        let resolved = Self::resolve(&mut table, vpn, is_write);
        table.unlock();
        let Some(backing) = resolved? else {
            *state = FaultState::Installed;
            return Ok(Step::Done);
        };

        *state = FaultState::Populating;
        let owner = Owner { pid, vpn };
        let mut pool = self.pool.lock();
        let frame = match self.allocate(&mut pool, owner) {
            Ok(frame) => frame,
            Err(e) => {
                pool.unlock();
                return Err(e);
            }
        };

        if !backing.is_rederivable() {
            // The swap store lives under the pool lock: read and install
            // without letting go of it.
            let mut table = spt.lock();
            let step = self.swap_in(&mut pool, &mut table, owner, frame);
            table.unlock();
            pool.unlock();
            if matches!(step, Ok(Step::Done)) {
                *state = FaultState::Installed;
            }
            return step;
        }
        pool.unlock();

        if let Err(e) = self.memory.with_frame(frame, |page| backing.populate(page)) {
            log::warn!("PageFault: cannot populate {:?} of {:?}: {:?}", vpn, pid, e);
            let mut pool = self.pool.lock();
            pool.frames.release(frame);
            pool.unlock();
            return Err(FaultError::IoFailure);
        }

        let mut pool = self.pool.lock();
        let mut table = spt.lock();
        let step = match table.lookup(vpn).map(|e| (e.is_resident(), e.backing.is_rederivable())) {
            None => {
                pool.frames.release(frame);
                Err(FaultError::InvalidAddress)
            }
            Some((true, _)) => {
                pool.frames.release(frame);
                Ok(Step::Done)
            }
            // Loaded, modified and evicted by another thread meanwhile: the
            // content we read is stale.
            Some((false, false)) => {
                pool.frames.release(frame);
                Ok(Step::Retry)
            }
            Some((false, true)) => self
                .install(&mut pool, &mut table, owner, frame)
                .map(|_| Step::Done),
        };
        table.unlock();
        pool.unlock();
        if matches!(step, Ok(Step::Done)) {
            *state = FaultState::Installed;
        }
        step
    }

    /// Decides what a fault on `vpn` needs.
    ///
    /// # Returns
    /// - `Ok(None)`: the page is already resident.
    /// - `Ok(Some(backing))`: the page must be populated from `backing`.
    fn resolve(
        table: &mut SupplementalPageTable,
        vpn: Vpn,
        is_write: bool,
    ) -> Result<Option<Backing>, FaultError> {
        if table.lookup(vpn).is_none() {
            if !table.try_extend_stack(vpn) {
                return Err(FaultError::InvalidAddress);
            }
            log::debug!("PageFault: stack grows down to {:?}", vpn);
        }
        let entry = table.lookup(vpn).ok_or(FaultError::InvalidAddress)?;
        if is_write && !entry.writable {
            return Err(FaultError::InvalidAddress);
        }
        if entry.is_resident() {
            Ok(None)
        } else {
            Ok(Some(entry.backing.clone()))
        }
    }

    /// Reads a swapped-out page into `frame` and installs it.
    ///
    /// Both the pool and the page table of the owner are locked, so the
    /// entry is re-read here: another thread may have brought the page back
    /// since it was resolved.
    fn swap_in(
        &self,
        pool: &mut Pool<S>,
        table: &mut SupplementalPageTable,
        owner: Owner,
        frame: FrameId,
    ) -> Result<Step, FaultError> {
        let slot = match table.lookup(owner.vpn) {
            None => {
                pool.frames.release(frame);
                return Err(FaultError::InvalidAddress);
            }
            Some(entry) if entry.is_resident() => {
                pool.frames.release(frame);
                return Ok(Step::Done);
            }
            Some(entry) => match entry.backing {
                Backing::SwapBacked { slot } => slot,
                _ => {
                    pool.frames.release(frame);
                    return Ok(Step::Retry);
                }
            },
        };
        let swap = &mut pool.swap;
        if let Err(e) = self
            .memory
            .with_frame(frame, |page| swap.read_slot(slot, page.inner_mut()))
        {
            log::warn!("PageFault: cannot read {:?}: {:?}", slot, e);
            pool.frames.release(frame);
            return Err(FaultError::IoFailure);
        }
        self.install(pool, table, owner, frame)?;
        Ok(Step::Done)
    }

    /// Maps `frame` at the page of `owner` and marks the page resident.
    ///
    /// The swap slot the page was read from, if any, is released, and the
    /// frame is unpinned. On failure the frame is released.
    fn install(
        &self,
        pool: &mut Pool<S>,
        table: &mut SupplementalPageTable,
        owner: Owner,
        frame: FrameId,
    ) -> Result<(), FaultError> {
        let Owner { pid, vpn } = owner;
        let Some((writable, slot)) = table.lookup(vpn).map(|entry| {
            let slot = match entry.backing {
                Backing::SwapBacked { slot } => Some(slot),
                _ => None,
            };
            (entry.writable, slot)
        }) else {
            pool.frames.release(frame);
            return Err(FaultError::InvalidAddress);
        };
        if let Err(e) = self.mmu.map(pid, vpn, frame, Permission::user(writable)) {
            log::warn!("PageFault: cannot map {:?} of {:?}: {:?}", vpn, pid, e);
            pool.frames.release(frame);
            return Err(FaultError::InvalidAddress);
        }
        if table.mark_resident(vpn, frame).is_err() {
            let _ = self.mmu.unmap(pid, vpn);
            pool.frames.release(frame);
            return Err(FaultError::InvalidAddress);
        }
        if let Some(slot) = slot {
            pool.swap.free_slot(slot);
        }
        pool.frames.unpin(frame);
        log::trace!("PageFault: {:?}:{:?} -> {:?}", pid, vpn, frame);
        Ok(())
    }
}
