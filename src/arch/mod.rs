//! Architecture seam. This crate targets a single AArch64-class machine;
//! the functions below are the only place that reaches for `cortex-a`
//! register accessors, so the rest of the kernel stays portable in spirit
//! even though only one backend is built.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(target_arch = "aarch64"))]
mod host_stub;
#[cfg(not(target_arch = "aarch64"))]
pub use host_stub::*;
