//! Spin locks.

use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Lock, RawLock};
use crate::proc::Cpu;

/// Mutual exclusion lock that busy-waits.
pub struct RawSpinlock {
    name: &'static str,
    /// Pointer of the `Cpu` holding the lock, or null if unheld. Used both
    /// for the compare-exchange itself and for `holding()`/debugging.
    locked: AtomicPtr<Cpu>,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl RawLock for RawSpinlock {
    /// Disables interrupts on this hart (to avoid deadlocking with an IRQ
    /// handler that wants the same lock) before spinning on the exchange.
    fn acquire(&self) {
        // SAFETY: paired with `pop_off` in `release`.
        unsafe { push_off() };
        assert!(!self.holding(), "acquire: already holding {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                crate::proc::current_cpu(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        assert!(self.holding(), "release: not holding {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        // SAFETY: paired with `push_off` in `acquire`.
        unsafe { pop_off() };
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == crate::proc::current_cpu()
    }
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}

/// `push_off`/`pop_off` nest like `intr_off`/`intr_on`, but matched: it
/// takes two `pop_off`s to undo two `push_off`s. If interrupts were
/// already off before the first `push_off`, `pop_off` leaves them off.
///
/// # Safety
///
/// Must be called in `push_off`/`pop_off` pairs on the same hart.
pub unsafe fn push_off() {
    let was_enabled = crate::arch::intr_get();
    // SAFETY: restored by the matching `pop_off`.
    unsafe { crate::arch::intr_off() };

    let cpu = crate::proc::current_cpu();
    // SAFETY: `cpu` is this hart's own `Cpu`; no other hart touches it.
    unsafe {
        if (*cpu).noff == 0 {
            (*cpu).interrupt_enabled = was_enabled;
        }
        (*cpu).noff += 1;
    }
}

/// # Safety
///
/// Must be paired with a preceding `push_off` on the same hart.
pub unsafe fn pop_off() {
    let cpu = crate::proc::current_cpu();
    assert!(!crate::arch::intr_get(), "pop_off: interruptible");
    // SAFETY: see `push_off`.
    unsafe {
        assert!((*cpu).noff >= 1, "pop_off: unbalanced");
        (*cpu).noff -= 1;
        if (*cpu).noff == 0 && (*cpu).interrupt_enabled {
            crate::arch::intr_on();
        }
    }
}
