//! Synchronization primitives.
//!
//! The pager uses a single primitive, the [`SpinLock`], for every shared
//! structure: the frame pool, each process's supplemental page table, the
//! process registry and each frame's content.
pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
