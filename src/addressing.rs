//! Virtual Memory Addressing Schemes.
//!
//! This module provides the two address types the virtual memory manager
//! works with: [`Va`] for a user virtual address, and [`Vpn`] for the virtual
//! page number that contains it. Physical memory is never addressed directly;
//! frames are referred to by their [`FrameId`] in the frame pool.
//!
//! A virtual address splits into a page number and an offset within the
//! page:
//! ```text
//! 63                                            12 11            0
//! +-----------------------------------------------+--------------+
//! |                 Virtual Page Number           |  Page Offset |
//! +-----------------------------------------------+--------------+
//! ```
//!
//! Both types support the arithmetic needed by the pager (adding a byte
//! count, taking a difference) so that address calculations read naturally.
//!
//! [`FrameId`]: crate::mm::FrameId

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB. Both
/// virtual pages and physical frames have this size, and a swap slot holds
/// exactly one page.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
///
/// This value corresponds to the log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Represents a virtual address.
///
/// The address is guaranteed to be canonical on x86_64: bits 48..64 are a
/// sign extension of bit 47.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is within the valid virtual memory range.
    /// - `None`: If the address is not canonical.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns the virtual page number that contains this address.
    #[inline]
    pub const fn vpn(self) -> Vpn {
        Vpn(self.0 >> PAGE_SHIFT)
    }
}

/// A virtual page number.
///
/// The page number is the virtual address shifted right by [`PAGE_SHIFT`].
/// It is the key of every per-process page bookkeeping structure.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Vpn(pub usize);

impl Vpn {
    /// Returns the first address of this page.
    #[inline]
    pub const fn into_va(self) -> Va {
        Va(self.0 << PAGE_SHIFT)
    }

    /// Returns the raw page number.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Self;

    fn add(self, other: usize) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::ops::AddAssign<usize> for Va {
    fn add_assign(&mut self, other: usize) {
        self.0 += other
    }
}

impl core::ops::Sub<usize> for Va {
    type Output = Self;

    fn sub(self, other: usize) -> Self::Output {
        Self(self.0 - other)
    }
}

impl core::ops::Sub<Self> for Va {
    type Output = usize;

    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl core::ops::Add<usize> for Vpn {
    type Output = Self;

    fn add(self, other: usize) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::ops::Sub<usize> for Vpn {
    type Output = Self;

    fn sub(self, other: usize) -> Self::Output {
        Self(self.0 - other)
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Vpn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Vpn(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Vpn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Vpn(0x{:x})", self.0)
    }
}
