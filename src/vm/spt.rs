//! Supplemental page table.
//!
//! The hardware page table only knows the pages that are currently in
//! memory. The supplemental page table of a process knows every page the
//! process may legally touch, resident or not, and for each one how its
//! content is produced: the [`Backing`] descriptor.
//!
//! The table also owns the stack growth policy. The user stack is not
//! registered page by page; a fault on an unregistered page just below the
//! stack creates a zero-filled page on the fly, as long as the stack stays
//! within its maximum size and the access is not far below the stack
//! pointer.
use crate::{
    KernelError,
    addressing::{PAGE_SHIFT, PAGE_SIZE, Va, Vpn},
    mm::FrameId,
    vm::backing::Backing,
};
use alloc::collections::{
    BTreeMap,
    btree_map::{self, Entry},
};

/// The description of one virtual page of a process.
#[derive(Clone, Debug)]
pub struct SptEntry {
    /// Where the content of the page comes from.
    pub backing: Backing,
    /// Frame holding the page, present iff the page is resident.
    pub frame: Option<FrameId>,
    /// The page is pinned by the kernel and must stay resident.
    pub pinned: bool,
    /// User writes to the page are permitted.
    pub writable: bool,
}

impl SptEntry {
    /// Returns `true` if the page is loaded in a frame.
    #[inline]
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }
}

/// Bounds of the region the stack may grow into.
#[derive(Clone, Copy, Debug)]
pub struct StackPolicy {
    /// Top of the stack (exclusive).
    pub top: Va,
    /// Maximum number of stack pages.
    pub max_pages: usize,
    /// Accesses up to this many bytes below the stack pointer are stack
    /// accesses.
    pub slack: usize,
}

/// Per-process map from virtual page number to [`SptEntry`].
pub struct SupplementalPageTable {
    entries: BTreeMap<Vpn, SptEntry>,
    stack: StackPolicy,
    rsp: Option<Va>,
}

impl SupplementalPageTable {
    /// Creates an empty table that grows the stack according to `stack`.
    pub fn new(stack: StackPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            stack,
            rsp: None,
        }
    }

    /// Registers a non-resident page.
    ///
    /// # Returns
    /// - `Err(KernelError::FileExist)` if `vpn` is already registered.
    pub fn register_lazy(
        &mut self,
        vpn: Vpn,
        backing: Backing,
        writable: bool,
    ) -> Result<(), KernelError> {
        match self.entries.entry(vpn) {
            Entry::Occupied(_) => Err(KernelError::FileExist),
            Entry::Vacant(v) => {
                v.insert(SptEntry {
                    backing,
                    frame: None,
                    pinned: false,
                    writable,
                });
                Ok(())
            }
        }
    }

    /// Returns the entry of `vpn`.
    pub fn lookup(&self, vpn: Vpn) -> Option<&SptEntry> {
        self.entries.get(&vpn)
    }

    /// Records that `vpn` is now loaded in `frame`.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSuchEntry)` if `vpn` is not registered.
    pub fn mark_resident(&mut self, vpn: Vpn, frame: FrameId) -> Result<(), KernelError> {
        let entry = self
            .entries
            .get_mut(&vpn)
            .ok_or(KernelError::NoSuchEntry)?;
        entry.frame = Some(frame);
        Ok(())
    }

    /// Records that `vpn` was evicted, and that its content is now produced
    /// by `backing`.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSuchEntry)` if `vpn` is not registered.
    pub fn mark_evicted(&mut self, vpn: Vpn, backing: Backing) -> Result<(), KernelError> {
        let entry = self
            .entries
            .get_mut(&vpn)
            .ok_or(KernelError::NoSuchEntry)?;
        entry.frame = None;
        entry.pinned = false;
        entry.backing = backing;
        Ok(())
    }

    /// Sets the pin flag of `vpn`.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSuchEntry)` if `vpn` is not registered.
    pub fn set_pinned(&mut self, vpn: Vpn, pinned: bool) -> Result<(), KernelError> {
        let entry = self
            .entries
            .get_mut(&vpn)
            .ok_or(KernelError::NoSuchEntry)?;
        entry.pinned = pinned;
        Ok(())
    }

    /// Removes the entry of `vpn`.
    pub fn remove(&mut self, vpn: Vpn) -> Option<SptEntry> {
        self.entries.remove(&vpn)
    }

    /// Records the user stack pointer at the time of the last trap.
    pub fn set_stack_pointer(&mut self, rsp: Va) {
        self.rsp = Some(rsp);
    }

    /// Lowest page the stack may grow down to.
    pub fn stack_limit(&self) -> Vpn {
        (self.stack.top - self.stack.max_pages * PAGE_SIZE).vpn()
    }

    /// Returns `true` if an access to `vpn` would grow the stack.
    ///
    /// The stack grows if `vpn` is not registered, lies within the maximum
    /// stack region right below the stack top, and is not below the page
    /// holding `rsp - slack` when a stack pointer was recorded.
    pub fn can_extend_stack(&self, vpn: Vpn) -> bool {
        if self.entries.contains_key(&vpn)
            || vpn < self.stack_limit()
            || vpn >= self.stack.top.vpn()
        {
            return false;
        }
        match self.rsp {
            Some(rsp) => {
                vpn.into_usize() >= rsp.into_usize().saturating_sub(self.stack.slack) >> PAGE_SHIFT
            }
            None => true,
        }
    }

    /// Grows the stack to cover `vpn` with a writable zero-filled page, if
    /// [`Self::can_extend_stack`] allows it.
    ///
    /// # Returns
    /// `true` if a new entry was registered.
    pub fn try_extend_stack(&mut self, vpn: Vpn) -> bool {
        self.can_extend_stack(vpn) && self.register_lazy(vpn, Backing::Zero, true).is_ok()
    }

    /// Number of registered pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no page is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, returning them in address order.
    pub fn drain(&mut self) -> btree_map::IntoIter<Vpn, SptEntry> {
        core::mem::take(&mut self.entries).into_iter()
    }
}
