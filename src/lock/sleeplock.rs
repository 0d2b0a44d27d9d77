//! Long-term sleeping locks, used for per-block and per-inode content
//! locks where the holder may block on I/O while holding the lock (which
//! a spinlock must never do).

use super::{Lock, RawLock, Sleepablelock};

/// A long-term lock for process-visible resources (cached blocks,
/// inodes). Contention sleeps the waiter instead of spinning.
pub struct RawSleeplock {
    /// pid of the holder, or `-1` if unlocked. Protected by an inner
    /// `Sleepablelock` so contenders can sleep on it directly.
    locked: Sleepablelock<i32>,
    name: &'static str,
}

pub type Sleeplock<T> = Lock<RawSleeplock, T>;
pub type SleeplockGuard<'s, T> = super::Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: Sleepablelock::new("sleeplock", -1),
            name,
        }
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            guard.sleep();
        }
        *guard = crate::proc::current_pid_or(-1);
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        *guard = -1;
        guard.wakeup();
    }

    fn holding(&self) -> bool {
        *self.locked.lock() == crate::proc::current_pid_or(-1)
    }
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleeplock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}
