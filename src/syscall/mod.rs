//! Syscall dispatch: the one place the kernel decodes a user-supplied
//! number and argument registers. Grounded on the teacher's
//! `syscall/mod.rs` `Kernel::syscall` match, with argument decoding via
//! an [`Args`] wrapper over the already-captured [`TrapFrame`] instead
//! of per-call `argint`/`argaddr` methods on the current process.

mod sysfile;
mod sysproc;

use crate::addr::VirtAddr;
use crate::proc::Proc;
use crate::trap::{TrapContext, TrapFrame};
use crate::vm::UserMemory;

const SYS_OPENAT: usize = 1;
const SYS_CLOSE: usize = 2;
const SYS_READ: usize = 3;
const SYS_WRITE: usize = 4;
const SYS_WRITEV: usize = 5;
const SYS_DUP: usize = 6;
const SYS_FSTAT: usize = 7;
const SYS_NEWFSTATAT: usize = 8;
const SYS_UNLINKAT: usize = 9;
const SYS_MKDIRAT: usize = 10;
const SYS_MKNODAT: usize = 11;
const SYS_CHDIR: usize = 12;
const SYS_PIPE2: usize = 13;
const SYS_IOCTL: usize = 14;
const SYS_MMAP: usize = 15;
const SYS_MUNMAP: usize = 16;
const SYS_EXECVE: usize = 17;
const SYS_FORK: usize = 18;
const SYS_WAIT: usize = 19;
const SYS_EXIT: usize = 20;
const SYS_KILL: usize = 21;
const SYS_SBRK: usize = 22;

/// A snapshot of one trapped syscall's argument registers (`a0`..`a5`,
/// per `spec.md`'s calling convention), copied out of the `TrapFrame` up
/// front so a handler can read arguments and later write back `epc`/`sp`
/// (as `execve` does) without the two borrows overlapping.
pub struct Args([usize; 6]);

impl Args {
    fn from_frame(tf: &TrapFrame) -> Self {
        Self([tf.a0, tf.a1, tf.a2, tf.a3, tf.a4, tf.a5])
    }

    fn raw(&self, n: usize) -> usize {
        self.0[n]
    }

    pub fn int(&self, n: usize) -> i32 {
        self.raw(n) as i32
    }

    pub fn addr(&self, n: usize) -> usize {
        self.raw(n)
    }
}

/// Reads a NUL-terminated string from user memory at `addr` into `buf`,
/// one byte at a time (there is no bulk "copy until NUL" primitive on
/// [`UserMemory`], unlike the teacher's page-oriented `fetchstr`, since
/// this crate's `copy_in` only ever copies a caller-supplied length).
fn fetch_str<'b>(mem: &UserMemory, addr: usize, buf: &'b mut [u8]) -> Result<&'b str, ()> {
    for (i, slot) in buf.iter_mut().enumerate() {
        let mut byte = [0u8; 1];
        mem.copy_in(VirtAddr::new(addr + i), &mut byte)?;
        *slot = byte[0];
        if byte[0] == 0 {
            return core::str::from_utf8(&buf[..i]).map_err(|_| ());
        }
    }
    Err(())
}

/// Reads one `usize`-sized word from user memory at `addr`.
fn fetch_addr(mem: &UserMemory, addr: usize) -> Result<usize, ()> {
    let mut bytes = [0u8; core::mem::size_of::<usize>()];
    mem.copy_in(VirtAddr::new(addr), &mut bytes)?;
    Ok(usize::from_ne_bytes(bytes))
}

/// Dispatches the syscall named by `tf.syscall_no`, returning the value
/// to install in `a0`. Out-of-range numbers are a decoding bug in the
/// trap-vector glue (which this crate does not own), not a
/// user-triggerable condition, so they panic rather than return `-1`.
pub fn dispatch(p: &Proc, tf: &mut TrapFrame, ctx: &TrapContext<'_>) -> isize {
    let args = Args::from_frame(tf);
    let syscall_no = tf.syscall_no;
    match syscall_no {
        SYS_OPENAT => sysfile::sys_openat(p, &args, ctx).unwrap_or(-1),
        SYS_CLOSE => sysfile::sys_close(p, &args, ctx).unwrap_or(-1),
        SYS_READ => sysfile::sys_read(p, &args, ctx).unwrap_or(-1),
        SYS_WRITE => sysfile::sys_write(p, &args, ctx).unwrap_or(-1),
        SYS_WRITEV => sysfile::sys_writev(p, &args, ctx).unwrap_or(-1),
        SYS_DUP => sysfile::sys_dup(p, &args, ctx).unwrap_or(-1),
        SYS_FSTAT => sysfile::sys_fstat(p, &args, ctx).unwrap_or(-1),
        SYS_NEWFSTATAT => sysfile::sys_newfstatat(p, &args, ctx).unwrap_or(-1),
        SYS_UNLINKAT => sysfile::sys_unlinkat(p, &args, ctx).unwrap_or(-1),
        SYS_MKDIRAT => sysfile::sys_mkdirat(p, &args, ctx).unwrap_or(-1),
        SYS_MKNODAT => sysfile::sys_mknodat(p, &args, ctx).unwrap_or(-1),
        SYS_CHDIR => sysfile::sys_chdir(p, &args, ctx).unwrap_or(-1),
        SYS_PIPE2 => sysfile::sys_pipe2(p, &args, ctx).unwrap_or(-1),
        SYS_IOCTL => sysfile::sys_ioctl(p, &args, ctx).unwrap_or(-1),
        SYS_MMAP => sysproc::sys_mmap(),
        SYS_MUNMAP => sysproc::sys_munmap(),
        SYS_EXECVE => sysproc::sys_execve(p, &args, tf, ctx).unwrap_or(-1),
        SYS_FORK => sysproc::sys_fork(p, ctx).unwrap_or(-1),
        SYS_WAIT => sysproc::sys_wait(p),
        SYS_EXIT => sysproc::sys_exit(p, &args, ctx),
        SYS_KILL => sysproc::sys_kill(&args),
        SYS_SBRK => sysproc::sys_sbrk(p, &args).unwrap_or(-1),
        n => panic!("dispatch: out-of-range syscall number {}", n),
    }
}
