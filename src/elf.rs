//! Minimal ELF64 reader: just enough to find `PT_LOAD` segments and the
//! entry point, grounded on xv6/rv6's `exec.c` `elfhdr`/`proghdr`
//! structures. Parsing works over small buffers the caller has already
//! read from disk (one buffer for the file header, one per program
//! header) rather than a whole-file-resident byte slice, since the
//! executable's inode is read incrementally by `exec` -- this module
//! itself never touches a `BlockDevice`.

use zerocopy::{AsBytes, FromBytes};

pub const ELF_MAGIC: u32 = 0x464c457f;

pub const PT_LOAD: u32 = 1;

pub const PF_EXEC: u32 = 1;
pub const PF_WRITE: u32 = 2;
pub const PF_READ: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct ElfHeader {
    pub magic: u32,
    _ident_rest: [u8; 12],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct ProgHeader {
    pub p_type: u32,
    pub flags: u32,
    pub off: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// Parses `image`'s ELF header, rejecting anything that isn't a
/// well-formed little-endian ELF64 file this kernel could plausibly run.
pub fn read_header(image: &[u8]) -> Result<ElfHeader, ()> {
    let n = core::mem::size_of::<ElfHeader>();
    if image.len() < n {
        return Err(());
    }
    let hdr = ElfHeader::read_from(&image[..n]).expect("elf header size mismatch");
    if hdr.magic != ELF_MAGIC {
        return Err(());
    }
    Ok(hdr)
}

/// Parses one program header from a buffer that starts exactly at its
/// offset (the caller reads `phentsize` bytes from disk at
/// `phoff + i * phentsize` first; the inode is not resident in memory
/// as a contiguous slice, so there is no whole-image byte range to
/// index into).
pub fn parse_prog_header(buf: &[u8]) -> Result<ProgHeader, ()> {
    let n = core::mem::size_of::<ProgHeader>();
    if buf.len() < n {
        return Err(());
    }
    ProgHeader::read_from(&buf[..n]).ok_or(())
}
