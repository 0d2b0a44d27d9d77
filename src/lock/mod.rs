//! Lock module.
//!
//! Contains the generic `Lock<R, T>`/`Guard<'_, R, T>` pair and the three
//! concrete raw-lock strategies built on top of it: `Spinlock` (busy-wait),
//! `Sleeplock` (long-term, sleeps on contention), and `Sleepablelock` (a
//! spinlock whose guard can additionally `sleep()`/`wakeup()` on a
//! `WaitChannel`). Every higher subsystem picks whichever of the three
//! matches how long it expects to hold the lock, per `spec.md` §5.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// A lock strategy: how to acquire/release/check-held. `Lock<R, T>` is
/// generic over this so `Spinlock<T>`, `Sleeplock<T>`, and
/// `Sleepablelock<T>` all share one guard/borrow implementation.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    fn holding(&self) -> bool;
}

/// A lock owning a `RawLock` and the data it protects.
pub struct Lock<R, T> {
    pub(crate) lock: R,
    pub(crate) data: UnsafeCell<T>,
}

unsafe impl<R: Send, T: Send> Sync for Lock<R, T> {}

pub struct Guard<'s, R: RawLock, T> {
    pub(crate) lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Lock<R, T> {
    /// Returns a raw pointer to the protected data, bypassing the lock.
    ///
    /// # Safety
    ///
    /// The caller must ensure no data race results; this exists for the
    /// panic handler and other single-hart-invariant escape hatches.
    pub unsafe fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Builds a `Guard` for a lock already known to be held, without
    /// acquiring it. Used only by the scheduler's context-switch baton
    /// pass: `sched` hands off a held lock across a `swtch` into the
    /// scheduler loop, which later hands it back across a `swtch` into
    /// whichever process resumes next (see `proc::procs::scheduler`).
    ///
    /// # Safety
    ///
    /// The lock must actually be held by the calling hart already, with
    /// no other live `Guard` for it outstanding.
    pub unsafe fn assume_held(&self) -> Guard<'_, R, T> {
        Guard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Unlocks the lock without going through a `Guard`.
    ///
    /// # Safety
    ///
    /// Must only be used to pair with a previously `mem::forget`-ten
    /// `Guard` obtained from this same lock.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard's existence proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard's existence proves the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    /// Releases the inner lock without running `Drop`, so the calling
    /// process can block on a `WaitChannel` without holding it.
    ///
    /// # Safety
    ///
    /// Must be paired with a matching `raw_acquire` on the same `Guard`
    /// before it is used or dropped again.
    pub unsafe fn raw_release(&self) {
        self.lock.lock.release();
    }

    /// Reacquires the inner lock after a `raw_release`.
    ///
    /// # Safety
    ///
    /// Must only follow a prior `raw_release` on the same `Guard`.
    pub unsafe fn raw_acquire(&self) {
        self.lock.lock.acquire();
    }

    /// The underlying `Lock`, for code (namely `WaitChannel`) that needs
    /// to reach the raw lock/data without going through `Deref`.
    pub fn owning_lock(&self) -> &'s Lock<R, T> {
        self.lock
    }
}
