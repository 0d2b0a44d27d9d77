//! A single physical page, owned linearly.
//!
//! `Page` is the unit the page-granular allocator in `kalloc` hands out.
//! It intentionally has no `Clone`/`Copy`: a page is either free (in the
//! allocator's free list), or owned by exactly one of {a page-table
//! table, a mapped user leaf, a `Buf`, a pipe}. Dropping a live `Page`
//! without returning it to the allocator is a bug the type system can't
//! catch on its own, so `Page` intentionally has no safe public
//! constructor outside of `kalloc`.

use crate::addr::PhysAddr;
use crate::param::PAGE_SIZE;

pub struct Page {
    addr: PhysAddr,
}

impl Page {
    /// # Safety
    ///
    /// `addr` must be page-aligned and must not already be owned by
    /// another live `Page`.
    pub unsafe fn from_addr(addr: PhysAddr) -> Self {
        debug_assert_eq!(addr.as_usize() % PAGE_SIZE, 0);
        Self { addr }
    }

    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr.as_usize() as *const u8
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.addr.as_usize() as *mut u8
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        // SAFETY: a live `Page` owns `PAGE_SIZE` bytes at `addr`.
        unsafe { &*(self.as_ptr() as *const [u8; PAGE_SIZE]) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        // SAFETY: a live `Page` owns `PAGE_SIZE` bytes at `addr`.
        unsafe { &mut *(self.as_mut_ptr() as *mut [u8; PAGE_SIZE]) }
    }

    pub fn clear(&mut self) {
        self.as_bytes_mut().fill(0);
    }

    /// Leaks the page's backing address without running `Drop`, for
    /// handing ownership to a page table entry that will be reclaimed by
    /// a later `free_pgdir` walk rather than by dropping this `Page`.
    pub fn into_addr(self) -> PhysAddr {
        let addr = self.addr;
        core::mem::forget(self);
        addr
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        crate::kalloc::free_page_addr(self.addr);
    }
}
