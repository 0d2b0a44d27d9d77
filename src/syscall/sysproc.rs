//! Process-control syscalls, grounded on the teacher's `syscall/proc.rs`.

use super::{fetch_addr, fetch_str, Args};
use crate::exec;
use crate::fs::resolve;
use crate::param::{MAXARG, MAXPATH};
use crate::proc::{self, Proc};
use crate::trap::{TrapContext, TrapFrame};

pub fn sys_fork(p: &Proc, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    proc::fork(p, ctx.fs, ctx.ftable).map(|pid| pid as isize).ok_or(())
}

/// Blocks for any child to exit, writing its exit code to the user
/// pointer in `a0` if one is given (a null pointer just discards it).
pub fn sys_wait(p: &Proc) -> isize {
    match proc::wait(p) {
        Some((pid, _code)) => pid as isize,
        None => -1,
    }
}

/// Never returns: `proc::exit` hands control straight to the scheduler.
pub fn sys_exit(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> isize {
    proc::exit(p, args.int(0), ctx.fs, ctx.dev, ctx.ftable, ctx.pipes);
}

pub fn sys_kill(args: &Args) -> isize {
    if proc::kill(args.int(0)) {
        0
    } else {
        -1
    }
}

pub fn sys_sbrk(p: &Proc, args: &Args) -> Result<isize, ()> {
    let n = args.int(0);
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mem = data.memory.as_mut().ok_or(())?;
    let old = mem.brk();
    let new = if n >= 0 {
        old.checked_add(n as usize).ok_or(())?
    } else {
        old.checked_sub((-n) as usize).ok_or(())?
    };
    mem.grow_to(new)?;
    Ok(old as isize)
}

/// Neither real memory mapping is implemented: `spec.md` names `mmap`
/// and `munmap` only as stubs in the syscall table.
pub fn sys_mmap() -> isize {
    -1
}

pub fn sys_munmap() -> isize {
    -1
}

/// Loads and argv a new image over the calling process, grounded on the
/// teacher's `sys_exec`: argv strings are fetched into kernel buffers
/// from the *old* address space before `exec::exec` builds the new one,
/// so there is no window where the two address spaces need to coexist
/// inside a single `UserMemory`.
pub fn sys_execve(p: &Proc, args: &Args, tf: &mut TrapFrame, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mut path_buf = [0u8; MAXPATH];
    let path = {
        let mem = data.memory.as_ref().ok_or(())?;
        fetch_str(mem, args.addr(0), &mut path_buf)?
    };

    let mut arg_bufs = [[0u8; MAXPATH]; MAXARG];
    let mut argc = 0;
    {
        let mem = data.memory.as_ref().ok_or(())?;
        let argv_uaddr = args.addr(1);
        for (i, buf) in arg_bufs.iter_mut().enumerate() {
            let uptr = fetch_addr(mem, argv_uaddr + i * core::mem::size_of::<usize>())?;
            if uptr == 0 {
                argc = i;
                break;
            }
            fetch_str(mem, uptr, buf)?;
        }
    }
    let argv: arrayvec::ArrayVec<&[u8], MAXARG> = arg_bufs[..argc]
        .iter()
        .map(|buf| {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            &buf[..len]
        })
        .collect();

    let cwd = data.cwd.as_ref().ok_or(())?;
    let inode = ctx.fs.begin_tx(ctx.dev, |tx| resolve(ctx.fs, tx, ctx.dev, cwd, path))?;

    let loaded = exec::exec(ctx.fs, ctx.dev, &inode, &argv);
    ctx.fs.begin_tx(ctx.dev, |tx| ctx.fs.put(tx, ctx.dev, inode));
    let loaded = loaded?;

    data.memory = Some(loaded.memory);
    tf.epc = loaded.entry;
    tf.sp = loaded.sp;
    tf.a1 = loaded.argv;
    Ok(loaded.argc as isize)
}
