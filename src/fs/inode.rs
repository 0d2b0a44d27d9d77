//! In-memory inode cache and the on-disk inode layout it mirrors.
//!
//! Grounded on xv6/rv6's `fs.c`: a fixed on-disk inode array, addressed
//! directly (no free list -- `ialloc` scans for `file_type == FREE`), and
//! an in-memory cache of at most `NINODE` inodes shared across open
//! files, cached directories, and the current-working-directory
//! pointers held by every process.
//!
//! The cache splits its protection the same way [`crate::bio::Bcache`]
//! does: one [`Arena`] keyed by `(dev, inum)` protects which slot holds
//! which inode and its live reference count, while a parallel array of
//! per-slot [`Sleeplock`]s guards the cached on-disk fields, so a reader
//! can block on disk I/O to fill the cache without spinning while the
//! arena's lock is held.
//!
//! `RcInode` deliberately has no `Drop` impl: dropping the last
//! reference to an unlinked inode must free its on-disk blocks, which
//! requires a transaction, which must not happen implicitly inside
//! `Drop`. Callers release a `RcInode` explicitly through [`ITable::put`],
//! the same discipline xv6 asks of `iput`.

use crate::arena::Arena;
use crate::bio::Bcache;
use crate::fs::superblock::SuperBlock;
use crate::fs::OpContext;
use crate::hal::BlockDevice;
use crate::lock::{Sleeplock, SleeplockGuard};
use crate::param::{
    BSIZE, FILE_NAME_MAX_LENGTH, INODE_MAX_BYTES, INODE_NUM_DIRECT, INODE_NUM_INDIRECT, NINODE,
};
use zerocopy::{AsBytes, FromBytes};

pub const T_FREE: u16 = 0;
pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;
pub const T_DEVICE: u16 = 3;

/// On-disk inode entry.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DInode {
    pub file_type: u16,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    /// First `INODE_NUM_DIRECT` are direct block numbers; the last is
    /// the single indirect block.
    pub addrs: [u32; INODE_NUM_DIRECT + 1],
}

impl Default for DInode {
    fn default() -> Self {
        Self {
            file_type: T_FREE,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; INODE_NUM_DIRECT + 1],
        }
    }
}

#[derive(Default)]
struct Meta {
    dev: u32,
    inum: u32,
}

struct InodeContent {
    /// Whether `dinode` reflects `(dev, inum)`'s on-disk entry. Checked
    /// together with `dev`/`inum` (not just a bare flag) so a slot
    /// recycled for a different inode can't be mistaken for up to date.
    valid: bool,
    dev: u32,
    inum: u32,
    dinode: DInode,
}

impl Default for InodeContent {
    fn default() -> Self {
        Self {
            valid: false,
            dev: 0,
            inum: 0,
            dinode: DInode::default(),
        }
    }
}

pub struct ITable {
    arena: Arena<Meta, NINODE>,
    content: [Sleeplock<InodeContent>; NINODE],
}

/// A live reference to an in-memory cached inode. No `Drop`: release
/// through [`ITable::put`].
pub struct RcInode {
    idx: usize,
    dev: u32,
    inum: u32,
}

impl RcInode {
    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Bumps the reference count; the returned handle and `self` must
    /// both eventually be released via `ITable::put`.
    pub fn dup(&self, itable: &ITable) -> RcInode {
        itable.arena.dup(self.idx);
        RcInode {
            idx: self.idx,
            dev: self.dev,
            inum: self.inum,
        }
    }
}

pub struct InodeGuard<'a> {
    guard: SleeplockGuard<'a, InodeContent>,
}

impl InodeGuard<'_> {
    pub fn file_type(&self) -> u16 {
        self.guard.dinode.file_type
    }

    pub fn nlink(&self) -> u16 {
        self.guard.dinode.nlink
    }

    pub fn set_nlink(&mut self, n: u16) {
        self.guard.dinode.nlink = n;
    }

    pub fn size(&self) -> u32 {
        self.guard.dinode.size
    }

    pub fn major_minor(&self) -> (u16, u16) {
        (self.guard.dinode.major, self.guard.dinode.minor)
    }

    pub fn set_major_minor(&mut self, major: u16, minor: u16) {
        self.guard.dinode.major = major;
        self.guard.dinode.minor = minor;
    }
}

fn inodes_per_block() -> u32 {
    (BSIZE / core::mem::size_of::<DInode>()) as u32
}

impl ITable {
    pub fn new() -> Self {
        Self {
            arena: Arena::new("itable"),
            content: array_macro::array![_ => Sleeplock::new("inode", InodeContent::default()); NINODE],
        }
    }

    /// Finds or creates a cache slot for `(dev, inum)`, without reading
    /// the disk yet (lazy, same as xv6's `iget`).
    pub fn get(&self, dev: u32, inum: u32) -> RcInode {
        let idx = self
            .arena
            .find_or_alloc(
                |slot: &Meta| slot.dev == dev && slot.inum == inum,
                |slot: &mut Meta| *slot = Meta { dev, inum },
            )
            .expect("itable: no free inode cache slot (NINODE exhausted)");
        RcInode { idx, dev, inum }
    }

    /// Locks `inode`'s content, reading it from disk if the cache slot
    /// does not already hold this exact `(dev, inum)`.
    pub fn lock<'a>(
        &'a self,
        sb: &SuperBlock,
        bcache: &Bcache,
        dev: &dyn BlockDevice,
        inode: &'a RcInode,
    ) -> InodeGuard<'a> {
        let mut guard = self.content[inode.idx].lock();
        if !(guard.valid && guard.dev == inode.dev && guard.inum == inode.inum) {
            let block_no = sb.iblock(inode.inum);
            let buf = bcache.acquire(dev, block_no);
            let off = (inode.inum % inodes_per_block()) as usize * core::mem::size_of::<DInode>();
            let n = core::mem::size_of::<DInode>();
            guard.dinode = DInode::read_from(&buf.data()[off..off + n]).expect("dinode size mismatch");
            guard.valid = true;
            guard.dev = inode.dev;
            guard.inum = inode.inum;
        }
        InodeGuard { guard }
    }

    /// Writes `guard`'s cached fields back to the inode's on-disk block.
    /// Must be called inside a transaction after any field mutation.
    pub fn update(
        &self,
        inode: &RcInode,
        sb: &SuperBlock,
        bcache: &Bcache,
        dev: &dyn BlockDevice,
        log: &super::log::Log,
        guard: &InodeGuard<'_>,
    ) {
        let block_no = sb.iblock(inode.inum);
        let mut buf = bcache.acquire(dev, block_no);
        let off = (inode.inum % inodes_per_block()) as usize * core::mem::size_of::<DInode>();
        let n = core::mem::size_of::<DInode>();
        buf.data_mut()[off..off + n].copy_from_slice(guard.guard.dinode.as_bytes());
        // Pinned until `Log::commit` restores this block to its home
        // location -- until then, the only copy of this write is here.
        buf.pin();
        log.write(block_no);
    }

    /// Scans the on-disk inode array for a free entry, claims it as
    /// `file_type`, and returns a cached handle to it with refcount 1.
    pub fn alloc(
        &self,
        sb: &SuperBlock,
        bcache: &Bcache,
        dev_no: u32,
        dev: &dyn BlockDevice,
        log: &super::log::Log,
        file_type: u16,
    ) -> Option<RcInode> {
        for inum in 1..sb.ninodes {
            let block_no = sb.iblock(inum);
            let mut buf = bcache.acquire(dev, block_no);
            let off = (inum % inodes_per_block()) as usize * core::mem::size_of::<DInode>();
            let n = core::mem::size_of::<DInode>();
            let existing = DInode::read_from(&buf.data()[off..off + n]).expect("dinode size mismatch");
            if existing.file_type == T_FREE {
                let fresh = DInode { file_type, nlink: 0, ..DInode::default() };
                buf.data_mut()[off..off + n].copy_from_slice(fresh.as_bytes());
                buf.pin();
                log.write(block_no);
                drop(buf);
                return Some(self.get(dev_no, inum));
            }
        }
        None
    }

    /// Releases one reference. If it was the last one and the inode has
    /// no links, frees its blocks and marks it free on disk.
    pub fn put(
        &self,
        sb: &SuperBlock,
        bcache: &Bcache,
        dev: &dyn BlockDevice,
        log: &super::log::Log,
        inode: RcInode,
    ) {
        if self.arena.dec(inode.idx) {
            let mut guard = self.lock(sb, bcache, dev, &inode);
            if guard.nlink() == 0 {
                truncate(sb, bcache, dev, log, &mut guard);
                guard.guard.dinode = DInode::default();
                self.update(&inode, sb, bcache, dev, log, &guard);
            }
            drop(guard);
            self.arena.recycle(inode.idx, |slot| *slot = Meta::default());
        }
    }
}

impl Default for ITable {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps inode-relative block index `bn` to a disk block number,
/// allocating on demand (indirect block included) via the free bitmap.
fn bmap(
    sb: &SuperBlock,
    bcache: &Bcache,
    dev: &dyn BlockDevice,
    log: &super::log::Log,
    guard: &mut InodeGuard<'_>,
    bn: usize,
) -> u32 {
    if bn < INODE_NUM_DIRECT {
        if guard.guard.dinode.addrs[bn] == 0 {
            guard.guard.dinode.addrs[bn] = balloc(sb, bcache, dev, log);
        }
        return guard.guard.dinode.addrs[bn];
    }

    let bn = bn - INODE_NUM_DIRECT;
    assert!(bn < INODE_NUM_INDIRECT, "bmap: offset out of range");

    if guard.guard.dinode.addrs[INODE_NUM_DIRECT] == 0 {
        guard.guard.dinode.addrs[INODE_NUM_DIRECT] = balloc(sb, bcache, dev, log);
    }
    let indirect_block = guard.guard.dinode.addrs[INODE_NUM_DIRECT];
    let mut buf = bcache.acquire(dev, indirect_block);
    let off = bn * 4;
    let mut addr = u32::from_le_bytes(buf.data()[off..off + 4].try_into().unwrap());
    if addr == 0 {
        addr = balloc(sb, bcache, dev, log);
        buf.data_mut()[off..off + 4].copy_from_slice(&addr.to_le_bytes());
        buf.pin();
        log.write(indirect_block);
    }
    addr
}

fn balloc(sb: &SuperBlock, bcache: &Bcache, dev: &dyn BlockDevice, log: &super::log::Log) -> u32 {
    for b in 0..sb.nblocks {
        let bitmap_block = sb.bblock(b);
        let mut buf = bcache.acquire(dev, bitmap_block);
        let bit_in_block = (b % (BSIZE as u32 * 8)) as usize;
        let byte = bit_in_block / 8;
        let mask = 1u8 << (bit_in_block % 8);
        if buf.data()[byte] & mask == 0 {
            buf.data_mut()[byte] |= mask;
            buf.pin();
            log.write(bitmap_block);
            drop(buf);
            let mut zero = bcache.acquire(dev, b);
            zero.data_mut().fill(0);
            zero.pin();
            log.write(b);
            return b;
        }
    }
    panic!("balloc: disk full");
}

fn bfree(sb: &SuperBlock, bcache: &Bcache, dev: &dyn BlockDevice, log: &super::log::Log, b: u32) {
    let bitmap_block = sb.bblock(b);
    let mut buf = bcache.acquire(dev, bitmap_block);
    let bit_in_block = (b % (BSIZE as u32 * 8)) as usize;
    let byte = bit_in_block / 8;
    let mask = 1u8 << (bit_in_block % 8);
    assert!(buf.data()[byte] & mask != 0, "bfree: freeing free block");
    buf.data_mut()[byte] &= !mask;
    buf.pin();
    log.write(bitmap_block);
}

fn truncate(
    sb: &SuperBlock,
    bcache: &Bcache,
    dev: &dyn BlockDevice,
    log: &super::log::Log,
    guard: &mut InodeGuard<'_>,
) {
    for i in 0..INODE_NUM_DIRECT {
        if guard.guard.dinode.addrs[i] != 0 {
            bfree(sb, bcache, dev, log, guard.guard.dinode.addrs[i]);
            guard.guard.dinode.addrs[i] = 0;
        }
    }
    let indirect = guard.guard.dinode.addrs[INODE_NUM_DIRECT];
    if indirect != 0 {
        let buf = bcache.acquire(dev, indirect);
        for i in 0..INODE_NUM_INDIRECT {
            let off = i * 4;
            let addr = u32::from_le_bytes(buf.data()[off..off + 4].try_into().unwrap());
            if addr != 0 {
                bfree(sb, bcache, dev, log, addr);
            }
        }
        drop(buf);
        bfree(sb, bcache, dev, log, indirect);
        guard.guard.dinode.addrs[INODE_NUM_DIRECT] = 0;
    }
    guard.guard.dinode.size = 0;
}

/// Reads up to `dst.len()` bytes starting at `off` into `dst`. Returns
/// the number of bytes actually read (short at end-of-file).
pub fn read(
    sb: &SuperBlock,
    bcache: &Bcache,
    dev: &dyn BlockDevice,
    log: &super::log::Log,
    guard: &mut InodeGuard<'_>,
    off: u32,
    dst: &mut [u8],
) -> usize {
    let size = guard.guard.dinode.size;
    if off >= size {
        return 0;
    }
    let end = core::cmp::min(off as usize + dst.len(), size as usize);
    let mut total = 0;
    let mut pos = off as usize;
    while pos < end {
        let block_no = bmap(sb, bcache, dev, log, guard, pos / BSIZE);
        let buf = bcache.acquire(dev, block_no);
        let off_in_block = pos % BSIZE;
        let n = core::cmp::min(end - pos, BSIZE - off_in_block);
        dst[total..total + n].copy_from_slice(&buf.data()[off_in_block..off_in_block + n]);
        total += n;
        pos += n;
    }
    total
}

/// Writes `src` at `off`, growing the file (and allocating blocks) as
/// needed, up to `INODE_MAX_BYTES`. Returns the number of bytes written.
pub fn write(
    sb: &SuperBlock,
    bcache: &Bcache,
    dev: &dyn BlockDevice,
    log: &super::log::Log,
    guard: &mut InodeGuard<'_>,
    off: u32,
    src: &[u8],
) -> usize {
    if off as usize + src.len() > INODE_MAX_BYTES {
        return 0;
    }
    let mut total = 0;
    let mut pos = off as usize;
    let end = pos + src.len();
    while pos < end {
        let block_no = bmap(sb, bcache, dev, log, guard, pos / BSIZE);
        let mut buf = bcache.acquire(dev, block_no);
        let off_in_block = pos % BSIZE;
        let n = core::cmp::min(end - pos, BSIZE - off_in_block);
        buf.data_mut()[off_in_block..off_in_block + n].copy_from_slice(&src[total..total + n]);
        buf.pin();
        log.write(block_no);
        total += n;
        pos += n;
    }
    if end as u32 > guard.guard.dinode.size {
        guard.guard.dinode.size = end as u32;
    }
    total
}

/// A directory entry as stored in a directory inode's data blocks.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    inum: u16,
    name: [u8; FILE_NAME_MAX_LENGTH],
}

const DIRENT_SIZE: usize = core::mem::size_of::<DirEntry>();

fn name_bytes(name: &str) -> [u8; FILE_NAME_MAX_LENGTH] {
    let mut buf = [0u8; FILE_NAME_MAX_LENGTH];
    let src = name.as_bytes();
    let n = core::cmp::min(src.len(), FILE_NAME_MAX_LENGTH);
    buf[..n].copy_from_slice(&src[..n]);
    buf
}

fn names_eq(entry: &[u8; FILE_NAME_MAX_LENGTH], name: &str) -> bool {
    &name_bytes(name) == entry
}

/// Searches directory `guard` for `name`, returning its inode number and
/// byte offset within the directory's data if found. `guard` must be a
/// directory (caller's responsibility, per `spec.md`'s inode ops).
pub fn dir_lookup(
    sb: &SuperBlock,
    bcache: &Bcache,
    dev: &dyn BlockDevice,
    log: &super::log::Log,
    guard: &mut InodeGuard<'_>,
    name: &str,
) -> Option<(u32, u32)> {
    debug_assert_eq!(guard.file_type(), T_DIR);
    let size = guard.size();
    let mut off = 0u32;
    let mut scratch = [0u8; DIRENT_SIZE];
    while off < size {
        let n = read(sb, bcache, dev, log, guard, off, &mut scratch);
        assert_eq!(n, DIRENT_SIZE, "dir_lookup: short directory read");
        let entry = DirEntry::read_from(&scratch[..]).expect("dirent size mismatch");
        if entry.inum != 0 && names_eq(&entry.name, name) {
            return Some((entry.inum as u32, off));
        }
        off += DIRENT_SIZE as u32;
    }
    None
}

/// Appends a `(name, inum)` entry to directory `guard`, reusing a freed
/// slot (`inum == 0`) if one exists. Fails if `name` already exists or
/// the directory is full (`INODE_MAX_BYTES`).
pub fn dir_link(
    sb: &SuperBlock,
    bcache: &Bcache,
    dev: &dyn BlockDevice,
    log: &super::log::Log,
    guard: &mut InodeGuard<'_>,
    name: &str,
    inum: u32,
) -> Result<(), ()> {
    if dir_lookup(sb, bcache, dev, log, guard, name).is_some() {
        return Err(());
    }

    let size = guard.size();
    let mut off = 0u32;
    let mut scratch = [0u8; DIRENT_SIZE];
    let mut free_off = size;
    while off < size {
        let n = read(sb, bcache, dev, log, guard, off, &mut scratch);
        assert_eq!(n, DIRENT_SIZE, "dir_link: short directory read");
        let entry = DirEntry::read_from(&scratch[..]).expect("dirent size mismatch");
        if entry.inum == 0 {
            free_off = off;
            break;
        }
        off += DIRENT_SIZE as u32;
    }

    let entry = DirEntry { inum: inum as u16, name: name_bytes(name) };
    let written = write(sb, bcache, dev, log, guard, free_off, entry.as_bytes());
    if written != DIRENT_SIZE {
        return Err(());
    }
    Ok(())
}

/// Removes the entry at byte offset `off` (as returned by `dir_lookup`)
/// by zeroing it in place, leaving a reusable hole for `dir_link`.
pub fn dir_unlink(
    sb: &SuperBlock,
    bcache: &Bcache,
    dev: &dyn BlockDevice,
    log: &super::log::Log,
    guard: &mut InodeGuard<'_>,
    off: u32,
) {
    let zero = [0u8; DIRENT_SIZE];
    let n = write(sb, bcache, dev, log, guard, off, &zero);
    assert_eq!(n, DIRENT_SIZE, "dir_unlink: short directory write");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::log::Log;
    use crate::fs::superblock::FSMAGIC;
    use crate::hal::mock::MemBlockDevice;

    /// Lays out a tiny disk by hand: boot block, a 4-block log, two
    /// inode blocks (32 inodes), one bitmap block, data blocks 8..16.
    /// The bitmap's low byte is pre-marked so `balloc` never hands out
    /// a block that collides with the fixed-layout region above it.
    fn fixture() -> (SuperBlock, Bcache, MemBlockDevice, Log, ITable) {
        let sb = SuperBlock {
            magic: FSMAGIC,
            size: 20,
            nblocks: 16,
            ninodes: 32,
            nlog: 4,
            logstart: 1,
            inodestart: 5,
            bmapstart: 7,
        };
        let bcache = Bcache::new();
        let dev = MemBlockDevice::new(20);
        let log = Log::recover(&sb, &bcache, &dev);

        let mut bitmap = [0u8; BSIZE];
        bitmap[0] = 0xff; // blocks 0..=7 reserved
        dev.write(sb.bmapstart, &bitmap);

        let itable = ITable::new();
        (sb, bcache, dev, log, itable)
    }

    #[test]
    fn alloc_persists_across_a_fresh_itable() {
        let (sb, bcache, dev, log, itable) = fixture();
        let inode = itable.alloc(&sb, &bcache, 1, &dev, &log, T_FILE).unwrap();
        {
            let mut guard = itable.lock(&sb, &bcache, &dev, &inode);
            assert_eq!(guard.file_type(), T_FILE);
            guard.set_nlink(1);
            itable.update(&inode, &sb, &bcache, &dev, &log, &guard);
        }

        let itable2 = ITable::new();
        let inode2 = itable2.get(inode.dev(), inode.inum());
        let guard2 = itable2.lock(&sb, &bcache, &dev, &inode2);
        assert_eq!(guard2.file_type(), T_FILE);
        assert_eq!(guard2.nlink(), 1);
    }

    #[test]
    fn dir_link_lookup_and_unlink_round_trip() {
        let (sb, bcache, dev, log, itable) = fixture();
        let dir = itable.alloc(&sb, &bcache, 1, &dev, &log, T_DIR).unwrap();
        let child = itable.alloc(&sb, &bcache, 1, &dev, &log, T_FILE).unwrap();

        let mut guard = itable.lock(&sb, &bcache, &dev, &dir);
        dir_link(&sb, &bcache, &dev, &log, &mut guard, "foo", child.inum()).unwrap();
        assert!(dir_link(&sb, &bcache, &dev, &log, &mut guard, "foo", child.inum()).is_err());

        let (found_inum, off) = dir_lookup(&sb, &bcache, &dev, &log, &mut guard, "foo").unwrap();
        assert_eq!(found_inum, child.inum());
        assert!(dir_lookup(&sb, &bcache, &dev, &log, &mut guard, "bar").is_none());

        dir_unlink(&sb, &bcache, &dev, &log, &mut guard, off);
        assert!(dir_lookup(&sb, &bcache, &dev, &log, &mut guard, "foo").is_none());
    }

    #[test]
    fn write_then_read_round_trips_across_a_block_boundary() {
        let (sb, bcache, dev, log, itable) = fixture();
        let file = itable.alloc(&sb, &bcache, 1, &dev, &log, T_FILE).unwrap();
        let mut guard = itable.lock(&sb, &bcache, &dev, &file);

        let msg: arrayvec::ArrayVec<u8, 1500> = (0..1500u32).map(|i| (i % 256) as u8).collect();
        let written = write(&sb, &bcache, &dev, &log, &mut guard, 0, &msg);
        assert_eq!(written, msg.len());
        assert_eq!(guard.size(), msg.len() as u32);

        let mut back = [0u8; 1500];
        let n = read(&sb, &bcache, &dev, &log, &mut guard, 0, &mut back);
        assert_eq!(n, msg.len());
        assert_eq!(&back[..], &msg[..]);
    }

    #[test]
    fn put_at_zero_links_frees_the_inode_for_reuse() {
        let (sb, bcache, dev, log, itable) = fixture();
        let inode = itable.alloc(&sb, &bcache, 1, &dev, &log, T_FILE).unwrap();
        let inum = inode.inum();
        let dup = inode.dup(&itable);

        itable.put(&sb, &bcache, &dev, &log, inode);
        {
            // Still one live reference: the on-disk entry must survive.
            let guard = itable.lock(&sb, &bcache, &dev, &dup);
            assert_eq!(guard.file_type(), T_FILE);
        }
        itable.put(&sb, &bcache, &dev, &log, dup);

        let fresh = itable.alloc(&sb, &bcache, 1, &dev, &log, T_DIR).unwrap();
        assert_eq!(fresh.inum(), inum, "freed inode slot should be reused by the next alloc");
    }
}
