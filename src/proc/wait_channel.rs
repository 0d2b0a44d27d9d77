//! Sleep/wakeup channels.
//!
//! A `WaitChannel`'s identity is its address: `sleep` records `self as
//! usize` on the current process and parks it; `wakeup` scans the
//! process table for sleepers whose recorded channel matches `self`.
//! This is the same "sleep on an address" design xv6 uses, just made
//! type-safe by requiring callers to go through a `WaitChannel` value
//! instead of a bare pointer.

use crate::lock::{Guard, RawLock};

use super::procs::wakeup_channel;
use super::park;

pub struct WaitChannel {
    _private: (),
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Atomically releases `guard`'s lock, blocks the current process on
    /// this channel (alertable: `kill` can cut this wait short), and
    /// reacquires the lock before returning.
    pub fn sleep<R: RawLock, T>(&self, guard: &mut Guard<'_, R, T>) {
        // SAFETY: paired with `raw_acquire` below; the process is parked
        // (and thus cannot re-enter this code) while the lock is held by
        // no one.
        unsafe { guard.raw_release() };
        park(self.addr(), false);
        unsafe { guard.raw_acquire() };
    }

    /// Like `sleep`, but not alertable: a pending `kill` does not wake
    /// this process early. Used where the caller is mid-way through an
    /// operation that must not be abandoned (log commit, inode
    /// teardown) -- see `spec.md` §5's `unalertable_wait_sem`.
    pub fn unalertable_sleep<R: RawLock, T>(&self, guard: &mut Guard<'_, R, T>) {
        // SAFETY: see `sleep`.
        unsafe { guard.raw_release() };
        park(self.addr(), true);
        unsafe { guard.raw_acquire() };
    }

    /// Wakes every process sleeping (alertably or not) on this channel.
    pub fn wakeup(&self) {
        wakeup_channel(self.addr(), false);
    }

    /// Wakes only alertable sleepers on this channel; used by `kill`
    /// after setting the target's `killed` flag (`spec.md`'s `alert`).
    pub fn alert(&self) {
        wakeup_channel(self.addr(), true);
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
