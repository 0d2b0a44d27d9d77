//! File-system syscalls: mostly argument decoding and bookkeeping
//! around `crate::fs`/`crate::file`, grounded on the teacher's
//! `syscall/file.rs`.

use super::{fetch_str, Args};
use crate::fcntl::{OpenFlags, AT_FDCWD};
use crate::file::RcFile;
use crate::fs::{resolve, resolve_parent, FileSystem, OpContext, RcInode, T_DEVICE, T_DIR, T_FILE};
use crate::hal::BlockDevice;
use crate::param::MAXPATH;
use crate::proc::{Proc, ProcData};
use crate::trap::TrapContext;
use zerocopy::FromBytes;

/// `ioctl` command this kernel recognizes: the `TCGETS` terminal-attribute
/// query, answered trivially (the console has no termios state to report).
const TCGETS: i32 = 0x5413;

fn current_path<'b>(data: &ProcData, args: &Args, n: usize, buf: &'b mut [u8; MAXPATH]) -> Result<&'b str, ()> {
    let mem = data.memory.as_ref().ok_or(())?;
    fetch_str(mem, args.addr(n), buf)
}

/// Installs `file` in the first free descriptor slot. Hands `file` back
/// on failure (table full) so the caller can close it instead of
/// leaking its file-table reference.
fn fdalloc(data: &mut ProcData, file: RcFile) -> Result<usize, RcFile> {
    for (fd, slot) in data.open_files.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(file);
            return Ok(fd);
        }
    }
    Err(file)
}

fn argfd<'a>(data: &'a ProcData, args: &Args, n: usize) -> Result<(usize, &'a RcFile), ()> {
    let fd = args.int(n);
    if fd < 0 {
        return Err(());
    }
    let fd = fd as usize;
    let file = data.open_files.get(fd).ok_or(())?.as_ref().ok_or(())?;
    Ok((fd, file))
}

/// Creates `path` as a fresh inode of `file_type` (`major`/`minor` only
/// meaningful for `T_DEVICE`), or returns the existing plain file if one
/// already sits there and `file_type == T_FILE`. Grounded on the
/// teacher's `KernelCtx::create`.
fn create_inode(
    fs: &FileSystem,
    ctx: &OpContext,
    dev: &dyn BlockDevice,
    cwd: &RcInode,
    path: &str,
    file_type: u16,
    major: u16,
    minor: u16,
) -> Result<RcInode, ()> {
    let (parent, name) = resolve_parent(fs, ctx, dev, cwd, path)?;
    let mut pguard = fs.lock(dev, &parent);

    if let Some((inum, _)) = fs.dir_lookup(dev, &mut pguard, name) {
        drop(pguard);
        let existing = fs.itable().get(parent.dev(), inum);
        fs.put(ctx, dev, parent);
        if file_type != T_FILE {
            fs.put(ctx, dev, existing);
            return Err(());
        }
        let guard = fs.lock(dev, &existing);
        let ok = guard.file_type() == T_FILE || guard.file_type() == T_DEVICE;
        drop(guard);
        if !ok {
            fs.put(ctx, dev, existing);
            return Err(());
        }
        return Ok(existing);
    }

    let inode = match fs.alloc_inode(ctx, dev, file_type) {
        Some(inode) => inode,
        None => {
            drop(pguard);
            fs.put(ctx, dev, parent);
            return Err(());
        }
    };
    let mut iguard = fs.lock(dev, &inode);
    iguard.set_nlink(1);
    if file_type == T_DEVICE {
        iguard.set_major_minor(major, minor);
    }
    fs.update(ctx, dev, &inode, &iguard);

    if file_type == T_DIR {
        pguard.set_nlink(pguard.nlink() + 1);
        fs.update(ctx, dev, &parent, &pguard);
        fs.dir_link(ctx, dev, &mut iguard, ".", inode.inum())
            .expect("create_inode: dirlink .");
        fs.dir_link(ctx, dev, &mut iguard, "..", parent.inum())
            .expect("create_inode: dirlink ..");
    }
    drop(iguard);

    if fs.dir_link(ctx, dev, &mut pguard, name, inode.inum()).is_err() {
        drop(pguard);
        fs.put(ctx, dev, parent);
        fs.put(ctx, dev, inode);
        return Err(());
    }
    drop(pguard);
    fs.put(ctx, dev, parent);
    Ok(inode)
}

pub fn sys_openat(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    if args.int(0) != AT_FDCWD {
        return Err(());
    }
    let flags = OpenFlags::from_bits_truncate(args.int(2));

    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mut path_buf = [0u8; MAXPATH];
    let path = current_path(data, args, 1, &mut path_buf)?;
    let cwd = data.cwd.as_ref().ok_or(())?;

    let inode = ctx.fs.begin_tx(ctx.dev, |tx| -> Result<RcInode, ()> {
        if flags.contains(OpenFlags::CREAT) {
            create_inode(ctx.fs, tx, ctx.dev, cwd, path, T_FILE, 0, 0)
        } else {
            let ip = resolve(ctx.fs, tx, ctx.dev, cwd, path)?;
            let guard = ctx.fs.lock(ctx.dev, &ip);
            let is_dir = guard.file_type() == T_DIR;
            drop(guard);
            if is_dir && flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR) {
                ctx.fs.put(tx, ctx.dev, ip);
                return Err(());
            }
            Ok(ip)
        }
    })?;

    let guard = ctx.fs.lock(ctx.dev, &inode);
    let file_type = guard.file_type();
    let (major, _minor) = guard.major_minor();
    drop(guard);

    let readable = !flags.contains(OpenFlags::WRONLY);
    let writable = flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR);

    let file = if file_type == T_DEVICE {
        ctx.fs.begin_tx(ctx.dev, |tx| ctx.fs.put(tx, ctx.dev, inode));
        ctx.ftable.open_device(major, readable, writable)
    } else {
        ctx.ftable.open_inode(inode, readable, writable)
    }
    .ok_or(())?;

    match fdalloc(data, file) {
        Ok(fd) => Ok(fd as isize),
        Err(file) => {
            ctx.ftable.close(ctx.fs, ctx.dev, ctx.pipes, file);
            Err(())
        }
    }
}

pub fn sys_close(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (fd, _) = argfd(data, args, 0)?;
    let file = data.open_files[fd].take().ok_or(())?;
    ctx.ftable.close(ctx.fs, ctx.dev, ctx.pipes, file);
    Ok(0)
}

pub fn sys_read(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (_, file) = argfd(data, args, 0)?;
    let n = args.int(2);
    if n < 0 {
        return Err(());
    }
    let mut buf = [0u8; 512];
    let want = core::cmp::min(n as usize, buf.len());
    let got = ctx
        .ftable
        .read(ctx.fs, ctx.dev, ctx.devsw, ctx.pipes, file, &mut buf[..want])?;
    let mem = data.memory.as_ref().ok_or(())?;
    mem.copy_out(crate::addr::VirtAddr::new(args.addr(1)), &buf[..got])?;
    Ok(got as isize)
}

pub fn sys_write(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (_, file) = argfd(data, args, 0)?;
    let n = args.int(2);
    if n < 0 {
        return Err(());
    }
    let mut buf = [0u8; 512];
    let want = core::cmp::min(n as usize, buf.len());
    let mem = data.memory.as_ref().ok_or(())?;
    mem.copy_in(crate::addr::VirtAddr::new(args.addr(1)), &mut buf[..want])?;
    let written = ctx
        .ftable
        .write(ctx.fs, ctx.dev, ctx.devsw, ctx.pipes, file, &buf[..want])?;
    Ok(written as isize)
}

/// One `iovec` as laid out by the user-space caller.
#[repr(C)]
#[derive(zerocopy::AsBytes, zerocopy::FromBytes)]
struct IoVec {
    base: u64,
    len: u64,
}

/// `writev`: writes each `iovec` segment to `fd` in order, stopping
/// early (but still returning the partial total) on the first segment
/// that writes short, the same behavior `write` itself has.
pub fn sys_writev(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (_, file) = argfd(data, args, 0)?;
    let iov_addr = args.addr(1);
    let iovcnt = args.int(2);
    if !(0..=16).contains(&iovcnt) {
        return Err(());
    }
    let mem = data.memory.as_ref().ok_or(())?;

    let mut total = 0isize;
    for i in 0..iovcnt as usize {
        let mut raw = [0u8; core::mem::size_of::<IoVec>()];
        mem.copy_in(
            crate::addr::VirtAddr::new(iov_addr + i * core::mem::size_of::<IoVec>()),
            &mut raw,
        )?;
        let iov = IoVec::read_from(&raw[..]).expect("iovec size mismatch");

        let mut buf = [0u8; 512];
        let want = core::cmp::min(iov.len as usize, buf.len());
        mem.copy_in(crate::addr::VirtAddr::new(iov.base as usize), &mut buf[..want])?;
        let written = ctx
            .ftable
            .write(ctx.fs, ctx.dev, ctx.devsw, ctx.pipes, file, &buf[..want])?;
        total += written as isize;
        if written < want {
            break;
        }
    }
    Ok(total)
}

pub fn sys_dup(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (_, file) = argfd(data, args, 0)?;
    let dup = file.dup(ctx.ftable);
    match fdalloc(data, dup) {
        Ok(fd) => Ok(fd as isize),
        Err(file) => {
            ctx.ftable.close(ctx.fs, ctx.dev, ctx.pipes, file);
            Err(())
        }
    }
}

pub fn sys_fstat(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (_, file) = argfd(data, args, 0)?;
    let stat = ctx.ftable.stat(ctx.fs, ctx.dev, file)?;
    let mem = data.memory.as_ref().ok_or(())?;
    let bytes = &stat as *const _ as *const u8;
    // SAFETY: `Stat` is `#[repr(C)]`; reading its bytes for a user copy
    // is exactly what `stat`'s ABI means.
    let slice = unsafe { core::slice::from_raw_parts(bytes, core::mem::size_of_val(&stat)) };
    mem.copy_out(crate::addr::VirtAddr::new(args.addr(1)), slice)?;
    Ok(0)
}

/// `newfstatat`: like `fstat`, but names the target by path instead of
/// an already-open fd.
pub fn sys_newfstatat(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    if args.int(0) != AT_FDCWD {
        return Err(());
    }
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mut path_buf = [0u8; MAXPATH];
    let path = current_path(data, args, 1, &mut path_buf)?;
    let cwd = data.cwd.as_ref().ok_or(())?;

    let stat = ctx.fs.begin_tx(ctx.dev, |tx| -> Result<_, ()> {
        let ip = resolve(ctx.fs, tx, ctx.dev, cwd, path)?;
        let guard = ctx.fs.lock(ctx.dev, &ip);
        let stat = crate::fs::Stat::from_inode(ip.dev(), ip.inum(), &guard);
        drop(guard);
        ctx.fs.put(tx, ctx.dev, ip);
        Ok(stat)
    })?;

    let mem = data.memory.as_ref().ok_or(())?;
    let bytes = &stat as *const _ as *const u8;
    // SAFETY: see `sys_fstat`.
    let slice = unsafe { core::slice::from_raw_parts(bytes, core::mem::size_of_val(&stat)) };
    mem.copy_out(crate::addr::VirtAddr::new(args.addr(2)), slice)?;
    Ok(0)
}

pub fn sys_unlinkat(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    if args.int(0) != AT_FDCWD {
        return Err(());
    }
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mut path_buf = [0u8; MAXPATH];
    let path = current_path(data, args, 1, &mut path_buf)?;
    let cwd = data.cwd.as_ref().ok_or(())?;

    ctx.fs.begin_tx(ctx.dev, |tx| -> Result<(), ()> {
        let (parent, name) = resolve_parent(ctx.fs, tx, ctx.dev, cwd, path)?;
        let mut pguard = ctx.fs.lock(ctx.dev, &parent);
        let (inum, off) = match ctx.fs.dir_lookup(ctx.dev, &mut pguard, name) {
            Some(pair) => pair,
            None => {
                drop(pguard);
                ctx.fs.put(tx, ctx.dev, parent);
                return Err(());
            }
        };
        let target = ctx.fs.itable().get(parent.dev(), inum);
        let mut tguard = ctx.fs.lock(ctx.dev, &target);
        if tguard.file_type() == T_DIR {
            drop(tguard);
            drop(pguard);
            ctx.fs.put(tx, ctx.dev, target);
            ctx.fs.put(tx, ctx.dev, parent);
            return Err(());
        }
        ctx.fs.dir_unlink(tx, ctx.dev, &mut pguard, off);
        tguard.set_nlink(tguard.nlink() - 1);
        ctx.fs.update(tx, ctx.dev, &target, &tguard);
        drop(tguard);
        drop(pguard);
        ctx.fs.put(tx, ctx.dev, target);
        ctx.fs.put(tx, ctx.dev, parent);
        Ok(())
    })?;
    Ok(0)
}

pub fn sys_mkdirat(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    if args.int(0) != AT_FDCWD {
        return Err(());
    }
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mut path_buf = [0u8; MAXPATH];
    let path = current_path(data, args, 1, &mut path_buf)?;
    let cwd = data.cwd.as_ref().ok_or(())?;

    ctx.fs.begin_tx(ctx.dev, |tx| {
        create_inode(ctx.fs, tx, ctx.dev, cwd, path, T_DIR, 0, 0).map(|ip| ctx.fs.put(tx, ctx.dev, ip))
    })?;
    Ok(0)
}

pub fn sys_mknodat(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    if args.int(0) != AT_FDCWD {
        return Err(());
    }
    let major = args.int(2) as u16;
    let minor = args.int(3) as u16;
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mut path_buf = [0u8; MAXPATH];
    let path = current_path(data, args, 1, &mut path_buf)?;
    let cwd = data.cwd.as_ref().ok_or(())?;

    ctx.fs.begin_tx(ctx.dev, |tx| {
        create_inode(ctx.fs, tx, ctx.dev, cwd, path, T_DEVICE, major, minor).map(|ip| ctx.fs.put(tx, ctx.dev, ip))
    })?;
    Ok(0)
}

pub fn sys_chdir(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let mut path_buf = [0u8; MAXPATH];
    let path = current_path(data, args, 0, &mut path_buf)?;
    let cwd = data.cwd.as_ref().ok_or(())?;

    let new_cwd = ctx.fs.begin_tx(ctx.dev, |tx| -> Result<RcInode, ()> {
        let ip = resolve(ctx.fs, tx, ctx.dev, cwd, path)?;
        let guard = ctx.fs.lock(ctx.dev, &ip);
        if guard.file_type() != T_DIR {
            drop(guard);
            ctx.fs.put(tx, ctx.dev, ip);
            return Err(());
        }
        drop(guard);
        Ok(ip)
    })?;

    if let Some(old) = data.cwd.replace(new_cwd) {
        ctx.fs.begin_tx(ctx.dev, |tx| ctx.fs.put(tx, ctx.dev, old));
    }
    Ok(0)
}

pub fn sys_pipe2(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (read_file, write_file) = ctx.ftable.open_pipe(ctx.pipes).ok_or(())?;
    let read_fd = match fdalloc(data, read_file) {
        Ok(fd) => fd,
        Err(file) => {
            ctx.ftable.close(ctx.fs, ctx.dev, ctx.pipes, file);
            return Err(());
        }
    };
    let write_fd = match fdalloc(data, write_file) {
        Ok(fd) => fd,
        Err(file) => {
            ctx.ftable.close(ctx.fs, ctx.dev, ctx.pipes, file);
            let orphaned = data.open_files[read_fd].take().unwrap();
            ctx.ftable.close(ctx.fs, ctx.dev, ctx.pipes, orphaned);
            return Err(());
        }
    };
    let fds = [read_fd as u32, write_fd as u32];
    let bytes = &fds as *const _ as *const u8;
    // SAFETY: `fds` is two `u32`s, read for exactly their combined size.
    let slice = unsafe { core::slice::from_raw_parts(bytes, core::mem::size_of_val(&fds)) };
    let mem = data.memory.as_ref().ok_or(())?;
    mem.copy_out(crate::addr::VirtAddr::new(args.addr(0)), slice)?;
    Ok(0)
}

/// The only `ioctl` command this kernel recognizes is `TCGETS`, answered
/// as "no special terminal attributes" for any readable fd; everything
/// else is rejected.
pub fn sys_ioctl(p: &Proc, args: &Args, ctx: &TrapContext<'_>) -> Result<isize, ()> {
    // SAFETY: `p` is the process taking this trap.
    let data = unsafe { p.data_mut() };
    let (_, _file) = argfd(data, args, 0)?;
    if args.int(1) != TCGETS {
        return Err(());
    }
    let _ = ctx;
    Ok(0)
}
