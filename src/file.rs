//! The open-file table: the layer between file descriptors and the
//! three things a descriptor can actually name (an inode, a pipe end,
//! or a character device), grounded on xv6/rv6's `file.c`.
//!
//! Mirrors [`crate::fs::inode::ITable`]'s split: an [`Arena`] tracks
//! which slot is live and its reference count, while a parallel array
//! of per-slot [`Sleeplock`]s guards the slot's content (so a blocking
//! read/write can hold its own slot without spinning, without blocking
//! unrelated file-table traffic). `RcFile` has no `Drop`, the same
//! explicit-release discipline as `RcInode`: closing the last reference
//! to an unlinked inode requires a transaction, which must not happen
//! implicitly inside a destructor.

use crate::arena::Arena;
use crate::fs::{FileSystem, RcInode, Stat};
use crate::hal::BlockDevice;
use crate::lock::Sleeplock;
use crate::param::NFILE;
use crate::pipe::{PipeEnd, PipePool};

/// A character device reachable through the file table (the console is
/// the only one this kernel implements; `spec.md`'s device switch table
/// is otherwise unpopulated).
pub trait CharDevice: Sync {
    fn read(&self, dst: &mut [u8]) -> Result<usize, ()>;
    fn write(&self, src: &[u8]) -> Result<usize, ()>;
}

/// Maps a major device number to its driver. Indexed the same way
/// xv6's `devsw[]` is; unpopulated entries are simply `None`.
pub struct DevSw {
    table: [Option<&'static dyn CharDevice>; crate::param::NDEV],
}

impl DevSw {
    pub const fn new() -> Self {
        Self {
            table: [None; crate::param::NDEV],
        }
    }

    pub fn register(&mut self, major: u16, dev: &'static dyn CharDevice) {
        self.table[major as usize] = Some(dev);
    }

    fn get(&self, major: u16) -> Option<&'static dyn CharDevice> {
        self.table.get(major as usize).copied().flatten()
    }
}

impl Default for DevSw {
    fn default() -> Self {
        Self::new()
    }
}

enum FileKind {
    Inode(RcInode),
    Pipe(PipeEnd),
    Device(u16),
}

struct FileSlot {
    kind: Option<FileKind>,
    readable: bool,
    writable: bool,
    /// Byte offset for the next `Inode` read/write. Meaningless for the
    /// other two kinds.
    off: u32,
}

impl Default for FileSlot {
    fn default() -> Self {
        Self {
            kind: None,
            readable: false,
            writable: false,
            off: 0,
        }
    }
}

/// A live reference to an open file-table entry. No `Drop`: release
/// through [`FTable::close`].
pub struct RcFile {
    idx: usize,
}

impl RcFile {
    /// Bumps the reference count; the returned handle and `self` must
    /// both eventually be released via `FTable::close`.
    pub fn dup(&self, ftable: &FTable) -> RcFile {
        ftable.arena.dup(self.idx);
        RcFile { idx: self.idx }
    }

    pub fn readable(&self, ftable: &FTable) -> bool {
        ftable.content[self.idx].lock().readable
    }

    pub fn writable(&self, ftable: &FTable) -> bool {
        ftable.content[self.idx].lock().writable
    }

    /// `Some((dev, inum))` if this entry names an inode, for `fstat` and
    /// for syscalls that need to recover the underlying file (`dup`-like
    /// identity checks).
    pub fn inode_key(&self, ftable: &FTable) -> Option<(u32, u32)> {
        match &ftable.content[self.idx].lock().kind {
            Some(FileKind::Inode(inode)) => Some((inode.dev(), inode.inum())),
            _ => None,
        }
    }
}

pub struct FTable {
    arena: Arena<(), NFILE>,
    content: [Sleeplock<FileSlot>; NFILE],
}

impl FTable {
    pub fn new() -> Self {
        Self {
            arena: Arena::new("ftable"),
            content: array_macro::array![_ => Sleeplock::new("file", FileSlot::default()); NFILE],
        }
    }

    fn alloc(&self, kind: FileKind, readable: bool, writable: bool) -> Option<RcFile> {
        let idx = self.arena.alloc(|_| {})?;
        *self.content[idx].lock() = FileSlot {
            kind: Some(kind),
            readable,
            writable,
            off: 0,
        };
        Some(RcFile { idx })
    }

    pub fn open_inode(&self, inode: RcInode, readable: bool, writable: bool) -> Option<RcFile> {
        self.alloc(FileKind::Inode(inode), readable, writable)
    }

    pub fn open_device(&self, major: u16, readable: bool, writable: bool) -> Option<RcFile> {
        self.alloc(FileKind::Device(major), readable, writable)
    }

    /// Allocates a connected pair of file-table entries over a fresh
    /// pipe: `(read_file, write_file)`.
    pub fn open_pipe(&self, pipes: &PipePool) -> Option<(RcFile, RcFile)> {
        let (read_end, write_end) = pipes.alloc()?;
        let read_file = match self.alloc(FileKind::Pipe(read_end), true, false) {
            Some(f) => f,
            None => {
                pipes.close(read_end);
                pipes.close(write_end);
                return None;
            }
        };
        let write_file = match self.alloc(FileKind::Pipe(write_end), false, true) {
            Some(f) => f,
            None => {
                pipes.close(write_end);
                self.close_no_tx(read_file);
                return None;
            }
        };
        Some((read_file, write_file))
    }

    /// Releases one reference. If it was the last one, finalizes
    /// whatever the entry named: an inode is released through `fs`
    /// (which may free its blocks, hence the transaction), a pipe end
    /// is closed on `pipes`, and a device needs no cleanup.
    pub fn close(&self, fs: &FileSystem, dev: &dyn BlockDevice, pipes: &PipePool, file: RcFile) {
        if !self.arena.dec(file.idx) {
            return;
        }
        let kind = self.content[file.idx].lock().kind.take();
        self.arena.recycle(file.idx, |_| {});
        match kind {
            Some(FileKind::Inode(inode)) => {
                fs.begin_tx(dev, |ctx| fs.put(ctx, dev, inode));
            }
            Some(FileKind::Pipe(end)) => pipes.close(end),
            Some(FileKind::Device(_)) | None => {}
        }
    }

    /// Like `close`, but for a pure in-memory entry known not to name an
    /// inode (used internally to unwind a partially built pipe pair).
    fn close_no_tx(&self, file: RcFile) {
        if !self.arena.dec(file.idx) {
            return;
        }
        self.content[file.idx].lock().kind = None;
        self.arena.recycle(file.idx, |_| {});
    }

    /// Reads up to `dst.len()` bytes from `file`, dispatching on its
    /// kind. Advances the stored offset for inode-backed files.
    pub fn read(
        &self,
        fs: &FileSystem,
        dev: &dyn BlockDevice,
        devsw: &DevSw,
        pipes: &PipePool,
        file: &RcFile,
        dst: &mut [u8],
    ) -> Result<usize, ()> {
        let mut slot = self.content[file.idx].lock();
        if !slot.readable {
            return Err(());
        }
        let kind = match &slot.kind {
            Some(FileKind::Pipe(end)) => *end,
            Some(FileKind::Device(major)) => {
                let major = *major;
                drop(slot);
                return devsw.get(major).ok_or(())?.read(dst);
            }
            Some(FileKind::Inode(_)) => {
                let off = slot.off;
                let n = match &slot.kind {
                    Some(FileKind::Inode(inode)) => {
                        let mut iguard = fs.lock(dev, inode);
                        fs.read(dev, &mut iguard, off, dst)
                    }
                    _ => unreachable!(),
                };
                slot.off += n as u32;
                return Ok(n);
            }
            None => return Err(()),
        };
        drop(slot);
        pipes.read(kind, dst)
    }

    /// Writes `src` to `file`, dispatching on its kind. Advances the
    /// stored offset for inode-backed files, splitting the write across
    /// transactions in `MAXOPBLOCKS`-sized chunks the same way xv6 does,
    /// since a single write can otherwise need more log space than one
    /// transaction is budgeted for.
    pub fn write(
        &self,
        fs: &FileSystem,
        dev: &dyn BlockDevice,
        devsw: &DevSw,
        pipes: &PipePool,
        file: &RcFile,
        src: &[u8],
    ) -> Result<usize, ()> {
        let mut slot = self.content[file.idx].lock();
        if !slot.writable {
            return Err(());
        }
        let kind = match &slot.kind {
            Some(FileKind::Pipe(end)) => *end,
            Some(FileKind::Device(major)) => {
                let major = *major;
                drop(slot);
                return devsw.get(major).ok_or(())?.write(src);
            }
            Some(FileKind::Inode(_)) => {
                const MAX_PER_TX: usize = crate::param::BSIZE * crate::param::MAXOPBLOCKS / 2;
                let mut total = 0;
                while total < src.len() {
                    let chunk = core::cmp::min(MAX_PER_TX, src.len() - total);
                    let off = slot.off;
                    let written = fs.begin_tx(dev, |ctx| match &slot.kind {
                        Some(FileKind::Inode(inode)) => {
                            let mut iguard = fs.lock(dev, inode);
                            fs.write(ctx, dev, &mut iguard, off, &src[total..total + chunk])
                        }
                        _ => unreachable!(),
                    });
                    slot.off += written as u32;
                    total += written;
                    if written < chunk {
                        break;
                    }
                }
                return Ok(total);
            }
            None => return Err(()),
        };
        drop(slot);
        pipes.write(kind, src)
    }

    /// `fstat`'s result for `file`. Only defined for inode-backed entries.
    pub fn stat(&self, fs: &FileSystem, dev: &dyn BlockDevice, file: &RcFile) -> Result<Stat, ()> {
        let slot = self.content[file.idx].lock();
        match &slot.kind {
            Some(FileKind::Inode(inode)) => {
                let iguard = fs.lock(dev, inode);
                Ok(Stat::from_inode(inode.dev(), inode.inum(), &iguard))
            }
            _ => Err(()),
        }
    }
}

impl Default for FTable {
    fn default() -> Self {
        Self::new()
    }
}
