//! SMP-supported spinlock.
//!
//! To acquire a lock on a multi-processor, a processor 1) polls a variable
//! that represents whether the lock is held, 2) sets the variable when it
//! takes the lock, and 3) unsets the variable when it `unlock`s.
//!
//! The step 1 and 2 must be executed ATOMICALLY with the atomic
//! read-modify-write instructions of the CPU.
//!
//! Unlike [`std::sync::Mutex`], the guard of this lock does not release the
//! lock when it goes out of scope. Every guard must be released with
//! [`SpinLockGuard::unlock`]; dropping a held guard panics and reports where
//! the lock was taken. This keeps the critical sections of the pager visible
//! in the code, which matters because the pager takes several locks in a fixed
//! order.
//!
//! [`std::sync::Mutex`]: https://doc.rust-lang.org/std/sync/struct.Mutex.html

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data
///
/// This spinlock will block threads waiting for the lock to become available.
/// The spinlock can be created via a [`new`] constructor. Each spinlock has a
/// type parameter which represents the data that it is protecting. The data can
/// only be accessed through the guards returned from [`lock`] and
/// [`try_lock`], which guarantees that the data is only ever accessed when the
/// spinlock is locked.
///
/// [`new`]: Self::new
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            locked: AtomicBool::new(false),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, blocking the current thread until it is able to do
    /// so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. When
    /// the returned guard goes out of scope without [`SpinLockGuard::unlock`],
    /// panic occurs.
    ///
    /// Locking a spinlock in the thread which already holds it deadlocks.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }

        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// # Errors
    ///
    /// If the spinlock could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    /// Creates a `SpinLock<T>`, with the `Default` value for T.
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a spinlock. When this structure
/// is dropped (falls out of scope) without unlock, panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    // Guards are released on the thread that took them.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    ///
    /// As the guard does **not** automatically release the lock on drop,
    /// the caller must explicitly invoke this method to mark the lock as
    /// available again.
    pub fn unlock(self) {
        self.lock.locked.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(0);
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        let guard = lock.try_lock().unwrap();
        guard.unlock();
    }

    #[test]
    fn counts_across_threads() {
        const N: usize = 8;
        let data = Arc::new(SpinLock::new(0usize));
        let handles = (0..N)
            .map(|_| {
                let data = Arc::clone(&data);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = data.lock();
                        *guard += 1;
                        guard.unlock();
                    }
                })
            })
            .collect::<alloc::vec::Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        let guard = data.lock();
        assert_eq!(*guard, N * 1000);
        guard.unlock();
    }
}
