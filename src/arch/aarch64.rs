//! AArch64 interrupt-mask and hart-id primitives.
//!
//! Thin wrappers over `cortex-a`'s `DAIF`/`MPIDR_EL1` accessors. Kept
//! deliberately tiny: everything above this file only ever calls
//! `intr_get`/`intr_off`/`intr_on`/`hart_id`, never touches `DAIF` or
//! `MPIDR_EL1` itself.

use cortex_a::registers::{DAIF, MPIDR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

/// Returns whether IRQs are currently unmasked on this hart.
pub fn intr_get() -> bool {
    DAIF.read(DAIF::I) == 0
}

/// Masks IRQs on this hart.
///
/// # Safety
///
/// Must be paired with a later `intr_on` that restores the prior state;
/// see `lock::spinlock::push_off`/`pop_off`.
pub unsafe fn intr_off() {
    DAIF.modify(DAIF::I::Masked);
}

/// Unmasks IRQs on this hart.
///
/// # Safety
///
/// Must only undo a previous `intr_off` on the same hart.
pub unsafe fn intr_on() {
    DAIF.modify(DAIF::I::Unmasked);
}

/// Returns this hart's affinity-0 MPIDR field, used as its CPU index.
pub fn hart_id() -> usize {
    (MPIDR_EL1.get() & 0xff) as usize
}
