//! # KeOS Virtual Memory: Demand Paging with Swapping
//!
//! This crate is the virtual memory manager of KeOS. It decides which virtual
//! pages of a process are backed by which physical frames, loads page content
//! lazily on the first access, and evicts frames to swap when physical memory
//! runs out.
//!
//! ## Demand paging
//!
//! When a process starts, the loader does not copy the executable into
//! memory. It only records, for every page of every loadable segment, *how*
//! the content of the page can be produced: read it from the executable,
//! or fill it with zeroes. This record is the [`SupplementalPageTable`] of
//! the process. The first access to a page raises a page fault, and the
//! fault handler, [`VmManager::handle_fault`], consults the record, grabs a
//! physical frame, fills it, and installs the mapping in the hardware page
//! table. The user program then resumes as if the page had always been there.
//!
//! The same mechanism grows the user stack: a fault just below the stack is
//! answered with a fresh zero-filled page, as long as the stack stays within
//! its configured maximum size.
//!
//! ## Eviction and swapping
//!
//! Physical frames are a fixed, global resource shared by all processes, the
//! [`FramePool`]. When no frame is free, the pool asks the [`Clock`] eviction
//! policy for a victim. The clock approximates least-recently-used with the
//! accessed bits of the page table: a recently accessed page gets a second
//! chance, a page that was not accessed since the last sweep is evicted. A
//! page whose content can be produced again (an unmodified file or zero page)
//! is simply dropped; any other page is written to a swap slot first, and the
//! next fault reads it back.
//!
//! ## Concurrency
//!
//! The frame pool and the swap store share one lock. Each process's
//! supplemental page table has its own lock. A frame that is being filled or
//! written back is *pinned*, so that eviction never picks a frame whose I/O is
//! in flight; this allows file reads to proceed without holding the pool
//! lock. The locks are always taken in the order pool, then page table.
//!
//! ## Collaborators
//!
//! The manager is constructed explicitly with its collaborators and passed to
//! the trap handler and the process teardown path:
//! - the hardware page table, through the [`Mmu`] trait,
//! - the swap device, through the [`SwapStore`] trait,
//! - executables, through the [`RegularFile`] handle.
//!
//! [`SupplementalPageTable`]: vm::spt::SupplementalPageTable
//! [`FramePool`]: vm::frame::FramePool
//! [`Clock`]: vm::clock::Clock
//! [`Mmu`]: mm::page_table::Mmu
//! [`SwapStore`]: vm::swap::SwapStore
//! [`RegularFile`]: fs::RegularFile
//! [`VmManager::handle_fault`]: vm::VmManager::handle_fault

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod addressing;
pub mod config;
pub mod fs;
pub mod mm;
pub mod sync;
pub mod vm;

pub use config::{VmConfig, VmConfigBuilder};
pub use vm::{VmManager, fault::FaultError};

/// Identifier of a process.
///
/// Every per-process structure of the virtual memory manager is keyed by the
/// process identifier; no structure holds a pointer to a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

/// Represents various errors that can occur in the kernel.
///
/// Each variant carries the errno value it is reported as when it crosses the
/// system call boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(isize)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry = -2,
    /// IO Error. (EIO)
    IOError = -5,
    /// Out of memory. (ENOMEM)
    NoMemory = -12,
    /// Permission denied. (EACCES)
    InvalidAccess = -13,
    /// Bad address. (EFAULT)
    BadAddress = -14,
    /// File exists. (EEXIST)
    FileExist = -17,
    /// Invalid arguement. (EINVAL)
    InvalidArgument = -22,
    /// No space left on device. (ENOSPC)
    NoSpace = -28,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        isize::from(self) as usize
    }
}
