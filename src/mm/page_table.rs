//! Entries of Page Table and their permissions.
//!
//! The pager never walks the hardware page table itself. It relies on the
//! small set of primitives captured by the [`Mmu`] trait: install a mapping
//! from a virtual page to a frame, remove it, and query or clear the
//! *accessed* and *dirty* bits that the CPU sets in the page table entry when
//! a user program touches the page.
//!
//! [`SoftMmu`] implements the trait with a software page table, one [`Pte`]
//! per mapped page. Besides serving hosted builds, it emulates what the CPU
//! does on a user access through [`Mmu::touch`]: it checks presence and
//! permission, and sets the accessed and dirty bits.
use crate::{
    Pid,
    addressing::{PAGE_SHIFT, Vpn},
    mm::FrameId,
    sync::SpinLock,
};
use alloc::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
        /// Execute-disable; instruction fetches are not allowed from the 4-KByte page controlled by this entry
        const XD = 1 << 63;
    }
}

/// Page Table Entry (PTE).
///
/// The entry holds the frame number in bits 12..52 and the [`PteFlags`] in
/// the remaining bits, as on x86_64.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(frame) = self.frame() {
            write!(f, "Pte({:?}, {:?})", frame, self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    const FRAME_MASK: usize = 0x000f_ffff_ffff_f000;

    /// Builds a present entry for `frame` with the given flags.
    #[inline]
    pub const fn new(frame: FrameId, flags: PteFlags) -> Self {
        Self(((frame.0 << PAGE_SHIFT) & Self::FRAME_MASK) | flags.bits() | PteFlags::P.bits())
    }

    /// Get the frame pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(FrameId)` if the entry is present.
    /// - `None` if the "P" flag is not set.
    #[inline]
    pub const fn frame(&self) -> Option<FrameId> {
        if self.flags().contains(PteFlags::P) {
            Some(FrameId((self.0 & Self::FRAME_MASK) >> PAGE_SHIFT))
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Set the flags for this entry, keeping the frame.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.0 = (self.0 & Self::FRAME_MASK) | flags.bits();
        self
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when working with page table
/// mappings.
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or is not present.
    NotExist,

    /// Duplicated mapping.
    ///
    /// This error is returned when an attempt is made to create a duplicate
    /// mapping for an address that already has an existing mapping.
    Duplicated,

    /// Invalid permission.
    ///
    /// This error is returned when an attempt is made to create a mapping with
    /// an invalid permission.
    InvalidPermission,
}

bitflags::bitflags! {
    /// Possible memory permissions for a page.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;

        /// Page is writable.
        const WRITE = 1 << 1;

        /// Page is executable.
        const EXECUTABLE = 1 << 2;

        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// Permission of a user page, writable or not.
    pub fn user(writable: bool) -> Self {
        if writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }

    /// Translate the permission into the flags of a leaf entry.
    pub fn into_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::P;
        if self.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if self.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        if !self.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        flags
    }
}

/// The hardware page table primitives the pager relies on.
///
/// Mappings are addressed by the owning process and the virtual page number,
/// so that the eviction policy can inspect the mapping of a frame that
/// belongs to any process. Implementations must flush the TLB entry of a page
/// whose mapping they remove or whose accessed bit they clear.
pub trait Mmu: Send + Sync {
    /// Maps `vpn` of process `pid` to `frame` with permission `perm`.
    ///
    /// # Returns
    /// - `Err(PageTableMappingError::Duplicated)` if the page is already
    ///   mapped.
    /// - `Err(PageTableMappingError::InvalidPermission)` if `perm` is not
    ///   readable.
    fn map(
        &self,
        pid: Pid,
        vpn: Vpn,
        frame: FrameId,
        perm: Permission,
    ) -> Result<(), PageTableMappingError>;

    /// Removes the mapping of `vpn` and returns the frame it pointed to.
    fn unmap(&self, pid: Pid, vpn: Vpn) -> Result<FrameId, PageTableMappingError>;

    /// Returns the entry that maps `vpn`.
    fn walk(&self, pid: Pid, vpn: Vpn) -> Result<Pte, PageTableMappingError>;

    /// Clears the accessed bit of the mapping of `vpn`, if any.
    fn clear_accessed(&self, pid: Pid, vpn: Vpn);

    /// Performs the check the CPU does when a user program accesses `vpn`.
    ///
    /// If the page is present and the access is permitted, the accessed bit
    /// (and the dirty bit for a write) is set and the backing frame is
    /// returned. Otherwise the access would raise a page fault, and `None` is
    /// returned.
    fn touch(&self, pid: Pid, vpn: Vpn, is_write: bool) -> Option<FrameId>;

    /// Returns `true` if the mapping of `vpn` has its accessed bit set.
    fn is_accessed(&self, pid: Pid, vpn: Vpn) -> bool {
        self.walk(pid, vpn)
            .map(|pte| pte.flags().contains(PteFlags::A))
            .unwrap_or(false)
    }

    /// Returns `true` if the mapping of `vpn` has its dirty bit set.
    fn is_dirty(&self, pid: Pid, vpn: Vpn) -> bool {
        self.walk(pid, vpn)
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false)
    }
}

/// A software page table implementing [`Mmu`].
#[derive(Default)]
pub struct SoftMmu {
    entries: SpinLock<BTreeMap<(Pid, Vpn), Pte>>,
}

impl SoftMmu {
    /// Creates an empty page table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages mapped for `pid`.
    pub fn mapped_pages(&self, pid: Pid) -> usize {
        let guard = self.entries.lock();
        let cnt = guard.keys().filter(|(p, _)| *p == pid).count();
        guard.unlock();
        cnt
    }
}

impl Mmu for SoftMmu {
    fn map(
        &self,
        pid: Pid,
        vpn: Vpn,
        frame: FrameId,
        perm: Permission,
    ) -> Result<(), PageTableMappingError> {
        if !perm.contains(Permission::READ) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let mut guard = self.entries.lock();
        let result = if guard.contains_key(&(pid, vpn)) {
            Err(PageTableMappingError::Duplicated)
        } else {
            guard.insert((pid, vpn), Pte::new(frame, perm.into_pte_flags()));
            Ok(())
        };
        guard.unlock();
        result
    }

    fn unmap(&self, pid: Pid, vpn: Vpn) -> Result<FrameId, PageTableMappingError> {
        let mut guard = self.entries.lock();
        let pte = guard.remove(&(pid, vpn));
        guard.unlock();
        pte.and_then(|pte| pte.frame())
            .ok_or(PageTableMappingError::NotExist)
    }

    fn walk(&self, pid: Pid, vpn: Vpn) -> Result<Pte, PageTableMappingError> {
        let guard = self.entries.lock();
        let pte = guard.get(&(pid, vpn)).copied();
        guard.unlock();
        pte.ok_or(PageTableMappingError::NotExist)
    }

    fn clear_accessed(&self, pid: Pid, vpn: Vpn) {
        let mut guard = self.entries.lock();
        if let Some(pte) = guard.get_mut(&(pid, vpn)) {
            let flags = pte.flags() - PteFlags::A;
            pte.set_flags(flags);
        }
        guard.unlock();
    }

    fn touch(&self, pid: Pid, vpn: Vpn, is_write: bool) -> Option<FrameId> {
        let mut guard = self.entries.lock();
        let frame = match guard.get_mut(&(pid, vpn)) {
            Some(pte) if is_write && !pte.flags().contains(PteFlags::RW) => None,
            Some(pte) => {
                let mut flags = pte.flags() | PteFlags::A;
                if is_write {
                    flags |= PteFlags::D;
                }
                pte.set_flags(flags);
                pte.frame()
            }
            None => None,
        };
        guard.unlock();
        frame
    }
}
