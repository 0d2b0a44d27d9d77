//! `execve`: replaces a process's address space with a freshly loaded
//! ELF image read directly off the filesystem. Grounded on xv6/rv6's
//! `exec.c` (`loadseg` reads a segment's bytes straight from the inode
//! into each newly mapped page, one page at a time, rather than staging
//! the whole file in a buffer first) adapted to this crate's
//! `UserMemory`/`FileSystem` seam.
//!
//! Every step builds into a brand new `UserMemory` rather than mutating
//! the caller's live one in place, so a failure partway through just
//! drops the half-built address space and leaves the caller's own
//! untouched -- there is no `bad:` unwind label to keep in sync with
//! every allocation site.

use crate::addr::VirtAddr;
use crate::elf::{self, PF_EXEC, PF_WRITE, PT_LOAD};
use crate::fs::{FileSystem, RcInode};
use crate::hal::BlockDevice;
use crate::kalloc::kalloc_page;
use crate::param::{MAXARG, MAXPATH, PAGE_SIZE};
use crate::vm::{PteFlags, UserMemory};

const USTACK_PAGES: usize = 1;

/// The result of a successful `exec`: the new address space, plus the
/// user-mode register values the caller installs into the returning
/// process's trapframe.
pub struct Loaded {
    pub memory: UserMemory,
    pub entry: usize,
    pub sp: usize,
    pub argc: usize,
    pub argv: usize,
}

/// Loads the ELF image backing `ip` into a fresh address space and
/// arranges `argv` on its stack. `ip` must already be locked by the
/// caller's open/resolve path; this function only reads it.
pub fn exec(
    fs: &FileSystem,
    dev: &dyn BlockDevice,
    ip: &RcInode,
    argv: &[&[u8]],
) -> Result<Loaded, ()> {
    if argv.len() > MAXARG {
        return Err(());
    }

    let mut iguard = fs.lock(dev, ip);
    let mut hdr_buf = [0u8; core::mem::size_of::<elf::ElfHeader>()];
    if fs.read(dev, &mut iguard, 0, &mut hdr_buf) != hdr_buf.len() {
        return Err(());
    }
    let hdr = elf::read_header(&hdr_buf)?;

    let mut mem = UserMemory::new().ok_or(())?;
    let mut image_top = 0usize;
    let phentsize = hdr.phentsize as usize;
    let mut ph_buf = [0u8; 56];
    if phentsize > ph_buf.len() {
        return Err(());
    }
    for i in 0..hdr.phnum as usize {
        let off = hdr.phoff as u32 + (i * phentsize) as u32;
        if fs.read(dev, &mut iguard, off, &mut ph_buf[..phentsize]) != phentsize {
            return Err(());
        }
        let ph = elf::parse_prog_header(&ph_buf)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(());
        }
        load_segment(fs, dev, &mut mem, &mut iguard, &ph)?;
        image_top = image_top.max((ph.vaddr + ph.memsz) as usize);
    }
    drop(iguard);
    if image_top == 0 {
        return Err(());
    }

    let (sp, argv_uaddr) = build_stack(&mut mem, image_top, argv)?;
    Ok(Loaded {
        memory: mem,
        entry: hdr.entry as usize,
        sp,
        argc: argv.len(),
        argv: argv_uaddr,
    })
}

/// Maps fresh zeroed pages covering one `PT_LOAD` segment and fills
/// each from the inode one page at a time, zeroing the tail past
/// `filesz` (the BSS convention) instead of reading it from disk.
fn load_segment(
    fs: &FileSystem,
    dev: &dyn BlockDevice,
    mem: &mut UserMemory,
    iguard: &mut crate::fs::inode::InodeGuard<'_>,
    ph: &elf::ProgHeader,
) -> Result<(), ()> {
    let mut flags = PteFlags::READABLE | PteFlags::USER;
    if ph.flags & PF_WRITE != 0 {
        flags |= PteFlags::WRITABLE;
    }
    if ph.flags & PF_EXEC != 0 {
        flags |= PteFlags::EXECUTABLE;
    }

    let vaddr = ph.vaddr as usize;
    let filesz = ph.filesz as usize;
    let memsz = ph.memsz as usize;
    let file_off = ph.off as u32;

    let start = VirtAddr::new(vaddr).page_round_down().as_usize();
    let end = VirtAddr::new(vaddr + memsz).page_round_up().as_usize();
    let mut va = start;
    while va < end {
        let page = kalloc_page().ok_or(())?;
        let pa = page.into_addr();
        mem.map_page(VirtAddr::new(va), pa, flags)?;

        let seg_off = va.saturating_sub(vaddr);
        if seg_off < filesz {
            let n = core::cmp::min(PAGE_SIZE, filesz - seg_off);
            let mut buf = [0u8; PAGE_SIZE];
            let read = fs.read(dev, iguard, file_off + seg_off as u32, &mut buf[..n]);
            if read != n {
                return Err(());
            }
            mem.copy_out(VirtAddr::new(va), &buf[..n])?;
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Builds the initial stack: `argv` strings, a NUL-terminated pointer
/// array to them, and returns the resulting stack pointer and the user
/// address of that pointer array.
fn build_stack(
    mem: &mut UserMemory,
    image_top: usize,
    argv: &[&[u8]],
) -> Result<(usize, usize), ()> {
    let stack_bottom = VirtAddr::new(image_top).page_round_up().as_usize() + PAGE_SIZE;
    let mut top = stack_bottom;
    for _ in 0..USTACK_PAGES {
        let page = kalloc_page().ok_or(())?;
        let pa = page.into_addr();
        mem.map_page(
            VirtAddr::new(top),
            pa,
            PteFlags::READABLE | PteFlags::WRITABLE | PteFlags::USER,
        )?;
        top += PAGE_SIZE;
    }
    let stack_top = top;

    let mut sp = stack_top;
    let mut arg_addrs = [0usize; MAXARG];
    for (i, arg) in argv.iter().enumerate() {
        if arg.len() + 1 > MAXPATH {
            return Err(());
        }
        let len = arg.len() + 1;
        sp -= len;
        sp &= !(core::mem::size_of::<usize>() - 1);
        if sp < stack_bottom {
            return Err(());
        }
        let mut bytes = [0u8; MAXPATH];
        bytes[..arg.len()].copy_from_slice(arg);
        mem.copy_out(VirtAddr::new(sp), &bytes[..len])?;
        arg_addrs[i] = sp;
    }

    let ptr_bytes = (argv.len() + 1) * core::mem::size_of::<usize>();
    sp -= ptr_bytes;
    sp &= !(core::mem::size_of::<usize>() - 1);
    if sp < stack_bottom {
        return Err(());
    }
    let argv_uaddr = sp;
    for (i, &addr) in arg_addrs[..argv.len()].iter().enumerate() {
        mem.copy_out(
            VirtAddr::new(argv_uaddr + i * core::mem::size_of::<usize>()),
            &addr.to_ne_bytes(),
        )?;
    }
    mem.copy_out(
        VirtAddr::new(argv_uaddr + argv.len() * core::mem::size_of::<usize>()),
        &0usize.to_ne_bytes(),
    )?;

    mem.set_brk(stack_top);
    Ok((sp, argv_uaddr))
}
