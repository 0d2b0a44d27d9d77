//! Sleepable locks: a spinlock whose guard can additionally sleep on a
//! `WaitChannel` and be woken by another holder. Used wherever a
//! spinlock-protected flag needs a blocking wait (the log's `committing`
//! flag, `Sleeplock`'s internal holder field, pipe buffers).

use super::{Lock, RawLock, RawSpinlock};
use crate::proc::WaitChannel;

pub struct RawSleepablelock {
    lock: RawSpinlock,
    waitchannel: WaitChannel,
}

pub type Sleepablelock<T> = Lock<RawSleepablelock, T>;
pub type SleepablelockGuard<'s, T> = super::Guard<'s, RawSleepablelock, T>;

impl RawSleepablelock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepablelock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepablelock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically releases the lock and sleeps on its `WaitChannel`;
    /// reacquires the lock before returning. Alertable: a concurrent
    /// `kill` can wake this waiter early (see `WaitChannel::sleep`).
    pub fn sleep(&mut self) {
        let owning = self.owning_lock();
        owning.lock.waitchannel.sleep(self);
    }

    /// Like `sleep`, but not alertable: a concurrent `kill` does not wake
    /// this waiter early. For callers mid-way through an operation that
    /// must not be abandoned, e.g. waiting out someone else's log commit.
    pub fn sleep_unalertable(&mut self) {
        let owning = self.owning_lock();
        owning.lock.waitchannel.unalertable_sleep(self);
    }

    pub fn wakeup(&self) {
        self.lock.lock.waitchannel.wakeup();
    }
}
