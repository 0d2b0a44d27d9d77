//! `open`/`openat` flag bits, grounded on xv6/rv6's `fcntl.rs`, extended
//! with the `O_TRUNC` bit `openat`'s scenarios don't exercise but whose
//! absence would otherwise be a silent gap against the Linux-style ABI
//! `openat`/`newfstatat`/`unlinkat` imply.

bitflags::bitflags! {
    pub struct OpenFlags: i32 {
        const WRONLY = 0x1;
        const RDWR   = 0x2;
        const CREAT  = 0o100;
        const TRUNC  = 0o1000;
    }
}

/// Sentinel `dirfd` meaning "resolve relative to the caller's cwd",
/// matching Linux's `AT_FDCWD`. This kernel does not support `*at`
/// syscalls relative to an arbitrary open directory fd.
pub const AT_FDCWD: i32 = -100;
