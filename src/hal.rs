//! Hardware-abstraction-layer seam.
//!
//! The kernel core never talks to a virtio queue, a UART register, or an
//! interrupt controller directly; it talks to these traits. The real
//! implementations (virtio-mmio, PL011, GICv2/v3) live outside the scope
//! of this crate's spec and are wired in by whoever boots it. A `mock`
//! implementation is provided under `#[cfg(test)]` for the host-side unit
//! tests in `spec.md` §8.

use crate::param::BSIZE;

/// Synchronous, sector-addressed block device. Every transfer is exactly
/// `BSIZE` bytes; callers never issue partial-block I/O.
pub trait BlockDevice: Sync {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]);
    fn write(&self, block_no: u32, buf: &[u8; BSIZE]);
}

/// A single-character-at-a-time serial port.
pub trait Uart: Sync {
    fn putc(&self, c: u8);
    /// Returns `None` if no input is pending.
    fn getc(&self) -> Option<u8>;
}

/// Platform interrupt controller, consulted only by the trap path.
pub trait Plic: Sync {
    fn claim(&self) -> Option<u32>;
    fn complete(&self, irq: u32);
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::vec::Vec;

    /// An in-memory `BlockDevice` for host-side tests. Never linked into
    /// the `no_std` kernel image.
    pub struct MemBlockDevice {
        blocks: Mutex<Vec<[u8; BSIZE]>>,
    }

    impl MemBlockDevice {
        pub fn new(num_blocks: usize) -> Self {
            Self {
                blocks: Mutex::new(std::vec![[0u8; BSIZE]; num_blocks]),
            }
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
            let blocks = self.blocks.lock().unwrap();
            buf.copy_from_slice(&blocks[block_no as usize]);
        }

        fn write(&self, block_no: u32, buf: &[u8; BSIZE]) {
            let mut blocks = self.blocks.lock().unwrap();
            blocks[block_no as usize].copy_from_slice(buf);
        }
    }
}
