//! Panic handling.
//!
//! Every invariant `spec.md` §7 marks "fatal" reaches this through a
//! plain `panic!`/`assert!`. We print the location and message through
//! the printer (bypassing its lock, since the panicking hart may already
//! hold it mid-`println!`) and then halt, matching the "on-disk
//! corruption / log overflow / impossible state -> fatal" policy.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::printer::_print_unlocked;

static PANICKED: AtomicBool = AtomicBool::new(false);

pub fn panicked() -> bool {
    PANICKED.load(Ordering::Acquire)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    PANICKED.store(true, Ordering::Release);
    _print_unlocked(core::format_args!("kernel panic: {}\n", info));
    crate::poweroff::halt()
}
