//! On-disk layout descriptor, read once from block 1 at mount time.

use zerocopy::{AsBytes, FromBytes};

use super::inode::DInode;
use crate::param::{BSIZE, INODE_NUM_DIRECT, INODE_NUM_INDIRECT};

const INODES_PER_BLOCK: u32 = (BSIZE / core::mem::size_of::<DInode>()) as u32;
const BITS_PER_BLOCK: u32 = (BSIZE * 8) as u32;

/// Matches the fixed layout this teaching filesystem writes: boot block,
/// superblock, log, inode blocks, free bitmap, data blocks.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct SuperBlock {
    pub magic: u32,
    pub size: u32,
    pub nblocks: u32,
    pub ninodes: u32,
    pub nlog: u32,
    pub logstart: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
}

pub const FSMAGIC: u32 = 0x1026_1231;

impl SuperBlock {
    /// `bytes` must hold a value previously written in this layout; a
    /// block of zeros (or garbage) just reads back as a `SuperBlock`
    /// full of zeros (or garbage), not a panic -- the caller is expected
    /// to check `magic` before trusting the rest.
    pub fn from_block(bytes: &[u8; BSIZE]) -> Self {
        let n = core::mem::size_of::<SuperBlock>();
        Self::read_from(&bytes[..n]).expect("superblock size mismatch")
    }

    pub fn to_block(&self, bytes: &mut [u8; BSIZE]) {
        let n = core::mem::size_of::<SuperBlock>();
        bytes[..n].copy_from_slice(self.as_bytes());
    }

    /// Block holding inode number `inum`'s on-disk entry.
    pub fn iblock(&self, inum: u32) -> u32 {
        self.inodestart + inum / INODES_PER_BLOCK
    }

    /// Free-bitmap block holding the bit for data block `block_no`.
    pub fn bblock(&self, block_no: u32) -> u32 {
        self.bmapstart + block_no / BITS_PER_BLOCK
    }
}

static_assertions::const_assert!(INODE_NUM_DIRECT > 0);
static_assertions::const_assert!(INODE_NUM_INDIRECT > 0);
