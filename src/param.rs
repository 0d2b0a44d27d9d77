//! Compile-time budgets shared across subsystems.
//!
//! Every constant here is referenced by at least one invariant in the
//! higher layers (log size vs. op budget, pipe ring size, fd table size,
//! and so on); keep them in one place so the relationships stay visible.

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system (global file table capacity).
pub const NFILE: usize = 100;

/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Major device number of the console.
pub const CONSOLE: u16 = 1;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size, in bytes. Matches the virtio block device's sector size.
pub const BSIZE: usize = 1024;

/// Max number of distinct blocks any single FS operation may write.
pub const MAXOPBLOCKS: usize = 10;

/// Max number of data block slots in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Eviction threshold for the block cache: once this many blocks are
/// resident, `acquire` scans the LRU list for a victim before allocating
/// a new slot.
pub const NBUF: usize = LOGSIZE;

/// Once the cache holds at least this many entries, `acquire` must evict
/// before allocating a fresh one. Kept distinct from `NBUF` (the hard
/// capacity) so the eviction policy and the capacity can be reasoned
/// about separately, per the design's `EVICTION_THRESHOLD`.
pub const EVICTION_THRESHOLD: usize = NBUF;

/// Maximum file path length, including the terminating NUL.
pub const MAXPATH: usize = 128;

/// Maximum length of a process name (for debugging/`ps`-style dumps).
pub const MAXPROCNAME: usize = 16;

/// Maximum length of a directory entry's file name component.
pub const FILE_NAME_MAX_LENGTH: usize = 14;

/// Number of direct block pointers stored in an on-disk inode.
pub const INODE_NUM_DIRECT: usize = 12;

/// Number of block pointers reachable through the inode's single
/// indirect block.
pub const INODE_NUM_INDIRECT: usize = BSIZE / core::mem::size_of::<u32>();

/// Largest file size representable with direct + single-indirect
/// addressing.
pub const INODE_MAX_BYTES: usize = (INODE_NUM_DIRECT + INODE_NUM_INDIRECT) * BSIZE;

/// 1-based inode number of the file system root directory.
pub const ROOT_INODE_NO: u32 = 1;

/// Size of a pipe's ring buffer, in bytes.
pub const PIPESIZE: usize = 512;

/// Maximum number of simultaneously open pipes.
pub const NPIPE: usize = 32;

/// Size of a virtual memory page, in bytes (4 KiB, per the AArch64 4K
/// translation granule this kernel targets).
pub const PAGE_SIZE: usize = 4096;

/// Number of page-table levels walked from the root to a leaf PTE.
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Number of entries in a single page-table level (9 VA bits per level).
pub const PTE_PER_TABLE: usize = 512;

/// Size of the console input ring buffer.
pub const CONSOLE_BUF_SIZE: usize = 128;

/// Fixed user virtual address at which the init process's `icode` payload
/// is linked and mapped.
pub const ICODE_BASE: usize = 0x400000;

/// Upper bound on physical pages tracked by the copy-on-write refcount
/// table (`kalloc::page_refcount`). Covers up to 512 MiB of physical
/// memory at `PAGE_SIZE` granularity, generous for a teaching machine.
pub const MAX_PHYS_PAGES: usize = 131_072;

/// Highest user virtual address this kernel will map (below the trampoline
/// page at the top of the address space).
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
