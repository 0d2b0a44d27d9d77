//! The on-disk filesystem: superblock layout, write-ahead log, inode
//! cache, and path resolution. Grounded on xv6/rv6's `fs.c`/`log.c`, with
//! a `FileSystem` aggregate standing in for the teacher's free functions
//! over global statics.

pub mod inode;
pub mod log;
pub mod path;
pub mod stat;
pub mod superblock;

pub use inode::{ITable, RcInode, T_DEVICE, T_DIR, T_FILE};
pub use path::{dirname_and_basename, resolve, resolve_parent};
pub use stat::Stat;

use crate::bio::Bcache;
use crate::hal::BlockDevice;
use crate::param::ROOTDEV;
use log::Log;
use superblock::SuperBlock;

/// Proof that a file-system transaction is open on the calling hart.
/// Has no `Drop`: a forgotten `OpContext` would mean a transaction left
/// open forever, the same failure mode as forgetting `end_op` in xv6, and
/// trying to paper over it with a destructor would let `end_op` run at an
/// arbitrary, possibly-interrupt-context point instead of the call site
/// that owns the operation.
pub struct OpContext {
    _private: (),
}

pub struct FileSystem {
    sb: SuperBlock,
    bcache: Bcache,
    log: Log,
    itable: ITable,
    root_dev: u32,
}

impl FileSystem {
    /// Reads the superblock from block 1 and replays the log, bringing
    /// the disk to a consistent state before any other access.
    pub fn mount(dev: &dyn BlockDevice) -> Self {
        let bcache = Bcache::new();
        let buf = bcache.acquire(dev, 1);
        // Block 1 is written by this same layout (`mkfs`-style tooling
        // outside this crate); `to_block`/`from_block` agree.
        let sb = SuperBlock::from_block(buf.data());
        assert_eq!(sb.magic, superblock::FSMAGIC, "mount: bad superblock magic");
        drop(buf);
        let log = Log::recover(&sb, &bcache, dev);
        Self {
            sb,
            bcache,
            log,
            itable: ITable::new(),
            root_dev: ROOTDEV,
        }
    }

    pub fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub fn itable(&self) -> &ITable {
        &self.itable
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn root_inode(&self) -> RcInode {
        self.itable.get(self.root_dev, crate::param::ROOT_INODE_NO)
    }

    /// Runs `f` inside a file-system transaction, guaranteeing `end_op`
    /// runs exactly once when `f` returns or panics.
    pub fn begin_tx<R>(&self, dev: &dyn BlockDevice, f: impl FnOnce(&OpContext) -> R) -> R {
        self.log.begin_op();
        let fs = self;
        let _end = scopeguard::guard((), move |_| fs.log.end_op(&fs.bcache, dev));
        let ctx = OpContext { _private: () };
        f(&ctx)
    }

    /// Releases a reference, possibly freeing the inode's disk blocks.
    /// Requires `ctx` as proof a transaction is open: freeing blocks
    /// writes the bitmap and the inode's own entry.
    pub fn put(&self, _ctx: &OpContext, dev: &dyn BlockDevice, inode: RcInode) {
        self.itable.put(&self.sb, &self.bcache, dev, &self.log, inode);
    }

    pub fn update(&self, _ctx: &OpContext, dev: &dyn BlockDevice, inode: &RcInode, guard: &inode::InodeGuard<'_>) {
        self.itable.update(inode, &self.sb, &self.bcache, dev, &self.log, guard);
    }

    pub fn lock<'a>(&'a self, dev: &dyn BlockDevice, inode: &'a RcInode) -> inode::InodeGuard<'a> {
        self.itable.lock(&self.sb, &self.bcache, dev, inode)
    }

    pub fn alloc_inode(&self, _ctx: &OpContext, dev: &dyn BlockDevice, file_type: u16) -> Option<RcInode> {
        self.itable
            .alloc(&self.sb, &self.bcache, self.root_dev, dev, &self.log, file_type)
    }

    pub fn read(&self, dev: &dyn BlockDevice, guard: &mut inode::InodeGuard<'_>, off: u32, dst: &mut [u8]) -> usize {
        inode::read(&self.sb, &self.bcache, dev, &self.log, guard, off, dst)
    }

    pub fn write(
        &self,
        _ctx: &OpContext,
        dev: &dyn BlockDevice,
        guard: &mut inode::InodeGuard<'_>,
        off: u32,
        src: &[u8],
    ) -> usize {
        inode::write(&self.sb, &self.bcache, dev, &self.log, guard, off, src)
    }

    pub fn dir_lookup(&self, dev: &dyn BlockDevice, guard: &mut inode::InodeGuard<'_>, name: &str) -> Option<(u32, u32)> {
        inode::dir_lookup(&self.sb, &self.bcache, dev, &self.log, guard, name)
    }

    pub fn dir_link(
        &self,
        _ctx: &OpContext,
        dev: &dyn BlockDevice,
        guard: &mut inode::InodeGuard<'_>,
        name: &str,
        inum: u32,
    ) -> Result<(), ()> {
        inode::dir_link(&self.sb, &self.bcache, dev, &self.log, guard, name, inum)
    }

    pub fn dir_unlink(&self, _ctx: &OpContext, dev: &dyn BlockDevice, guard: &mut inode::InodeGuard<'_>, off: u32) {
        inode::dir_unlink(&self.sb, &self.bcache, dev, &self.log, guard, off)
    }
}
