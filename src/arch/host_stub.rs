//! Host-side stand-in for `arch::aarch64`, used only when this crate is
//! built for the test-runner's native target (`cfg(test)` host builds).
//! Never linked into the `no_std` kernel image, which always builds for
//! `aarch64`.

use core::cell::Cell;

std::thread_local! {
    static IRQ_ENABLED: Cell<bool> = Cell::new(true);
}

pub fn intr_get() -> bool {
    IRQ_ENABLED.with(|c| c.get())
}

/// # Safety
///
/// See `arch::aarch64::intr_off`.
pub unsafe fn intr_off() {
    IRQ_ENABLED.with(|c| c.set(false));
}

/// # Safety
///
/// See `arch::aarch64::intr_on`.
pub unsafe fn intr_on() {
    IRQ_ENABLED.with(|c| c.set(true));
}

pub fn hart_id() -> usize {
    0
}
