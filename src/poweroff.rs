//! Terminal halt, used by the panic handler and by the fatal policy for
//! the init process exiting (`spec.md` §6: "exit of this root user
//! process is fatal policy").

#[cfg(target_arch = "aarch64")]
pub fn halt() -> ! {
    loop {
        cortex_a::asm::wfe();
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Parks this hart until the next interrupt, once, for the scheduler's
/// idle loop (no runnable process found this pass).
#[cfg(target_arch = "aarch64")]
pub fn wait_for_interrupt() {
    cortex_a::asm::wfe();
}

#[cfg(not(target_arch = "aarch64"))]
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}
