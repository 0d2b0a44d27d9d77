//! Per-process virtual memory: a 4-level page table, demand paging of
//! the heap, and copy-on-write `fork`.
//!
//! Physical memory is identity-accessible from kernel code (`Page`'s own
//! `as_ptr`), so a page table frame's physical address doubles as a
//! valid kernel pointer to its 512 `Pte` entries -- no separate
//! "physical-to-kernel-virtual" translation layer is needed, matching
//! how `kalloc`/`Page` already treat physical addresses.

use crate::addr::{PhysAddr, VirtAddr};
use crate::kalloc::{self, kalloc_page};
use crate::page::Page;
use crate::param::{MAXVA, PAGE_SIZE, PTE_PER_TABLE};

bitflags::bitflags! {
    pub struct PteFlags: u64 {
        const VALID      = 1 << 0;
        const READABLE   = 1 << 1;
        const WRITABLE   = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const USER       = 1 << 4;
        /// Software-only bit: this mapping is copy-on-write and must be
        /// duplicated, not written in place, on the next write fault.
        const COW        = 1 << 5;
    }
}

#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Pte(u64);

const PTE_ADDR_SHIFT: u32 = 12;

impl Pte {
    const fn invalid() -> Self {
        Self(0)
    }

    fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Self(((pa.as_usize() as u64) >> PTE_ADDR_SHIFT << PTE_ADDR_SHIFT) | flags.bits())
    }

    fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    fn addr(self) -> PhysAddr {
        PhysAddr::new((self.0 & !0xfff) as usize)
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xfff)
    }

    fn with_flags(self, flags: PteFlags) -> Self {
        Self::new(self.addr(), flags)
    }
}

/// Walks `root` for the leaf PTE mapping `va`, allocating intermediate
/// (levels 0..2) tables on the way down if `alloc` is set.
fn walk(root: PhysAddr, va: VirtAddr, alloc: bool) -> Option<*mut Pte> {
    assert!(va.as_usize() < MAXVA, "walk: va out of range");
    let mut table = root;
    for level in 0..3 {
        // SAFETY: `table` is always a live page-table frame: either
        // `root` (owned by the caller's `UserMemory`) or one just
        // allocated below.
        let entries = unsafe { &mut *(table.as_usize() as *mut [Pte; PTE_PER_TABLE]) };
        let pte = &mut entries[va.pte_index(level)];
        if pte.is_valid() {
            table = pte.addr();
        } else {
            if !alloc {
                return None;
            }
            let page = kalloc_page()?;
            let addr = page.into_addr();
            *pte = Pte::new(addr, PteFlags::VALID);
            table = addr;
        }
    }
    // SAFETY: see above.
    let entries = unsafe { &mut *(table.as_usize() as *mut [Pte; PTE_PER_TABLE]) };
    Some(&mut entries[va.pte_index(3)] as *mut Pte)
}

/// Backing store a demand-paged region could fault a page in from.
/// Every mapping in this crate is anonymous memory or a file loaded
/// once at `exec` time, so nothing ever implements this beyond
/// [`NoSwapBacking`]; the trait exists as the seam a real swap device
/// would hang off of without disturbing [`UserMemory::handle_write_fault`]'s
/// callers.
pub trait SwapBacking {
    fn swap_in(&self, va: VirtAddr) -> Result<PhysAddr, ()>;
}

/// The only `SwapBacking` this crate wires up: there is nowhere to swap
/// to, so reaching this at all is a bug in the fault dispatcher above it.
pub struct NoSwapBacking;

impl SwapBacking for NoSwapBacking {
    fn swap_in(&self, _va: VirtAddr) -> Result<PhysAddr, ()> {
        unimplemented!("swap_in: no swap backing store is configured")
    }
}

/// A process's address space: its root page-table frame and the extent
/// of its demand-paged heap (`[0, brk)` above the loaded image).
pub struct UserMemory {
    root: Page,
    brk: usize,
}

impl UserMemory {
    /// A fresh, empty address space (just a zeroed root table).
    pub fn new() -> Option<Self> {
        let root = kalloc_page()?;
        Some(Self { root, brk: 0 })
    }

    pub fn brk(&self) -> usize {
        self.brk
    }

    /// Sets `brk` directly, without allocating or mapping anything.
    /// Used once by `exec` after its `PT_LOAD` segments and stack are
    /// already mapped, so the next `sbrk` grows from the right place.
    pub(crate) fn set_brk(&mut self, brk: usize) {
        self.brk = brk;
    }

    fn root_addr(&self) -> PhysAddr {
        self.root.addr()
    }

    /// Maps one page at `va` to physical page `pa` with `flags`. Fails
    /// only if an intermediate table allocation fails.
    pub fn map_page(&mut self, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> Result<(), ()> {
        let pte = walk(self.root_addr(), va, true).ok_or(())?;
        // SAFETY: `walk` returns a pointer into a live table frame owned
        // by `self.root`.
        unsafe {
            assert!(!(*pte).is_valid(), "map_page: remap of {:#x}", va.as_usize());
            *pte = Pte::new(pa, flags | PteFlags::VALID);
        }
        Ok(())
    }

    /// Unmaps the page at `va`. If `free` is set, also returns the
    /// backing physical page (respecting its copy-on-write refcount).
    fn unmap_page(&mut self, va: VirtAddr, free: bool) {
        if let Some(pte) = walk(self.root_addr(), va, false) {
            // SAFETY: see `map_page`.
            let entry = unsafe { *pte };
            if entry.is_valid() {
                if free {
                    kalloc::free_page_addr(entry.addr());
                }
                // SAFETY: see above.
                unsafe { *pte = Pte::invalid() };
            }
        }
    }

    /// Grows the heap from `old` to `new` bytes, demand-allocating pages
    /// lazily is not implemented here: pages are allocated eagerly, kept
    /// simple at the cost of not supporting sparse, huge `sbrk` calls.
    pub fn grow_to(&mut self, new: usize) -> Result<(), ()> {
        if new < self.brk {
            return self.shrink_to(new);
        }
        let old_top = VirtAddr::new(self.brk).page_round_up().as_usize();
        let new_top = VirtAddr::new(new).page_round_up().as_usize();
        let mut va = old_top;
        while va < new_top {
            let page = kalloc_page().ok_or(())?;
            let pa = page.into_addr();
            if self
                .map_page(
                    VirtAddr::new(va),
                    pa,
                    PteFlags::READABLE | PteFlags::WRITABLE | PteFlags::USER,
                )
                .is_err()
            {
                kalloc::free_page_addr(pa);
                return Err(());
            }
            va += PAGE_SIZE;
        }
        self.brk = new;
        Ok(())
    }

    fn shrink_to(&mut self, new: usize) -> Result<(), ()> {
        let old_top = VirtAddr::new(self.brk).page_round_up().as_usize();
        let new_top = VirtAddr::new(new).page_round_up().as_usize();
        let mut va = new_top;
        while va < old_top {
            self.unmap_page(VirtAddr::new(va), true);
            va += PAGE_SIZE;
        }
        self.brk = new;
        Ok(())
    }

    /// Copies `src` into user memory starting at `va`, crossing page
    /// boundaries as needed. Used by `exec` to load argv/envp and by
    /// syscalls writing small structs back to user space.
    pub fn copy_out(&self, va: VirtAddr, src: &[u8]) -> Result<(), ()> {
        let mut off = 0;
        while off < src.len() {
            let cur = VirtAddr::new(va.as_usize() + off);
            let page_va = cur.page_round_down();
            let pte = walk(self.root_addr(), page_va, false).ok_or(())?;
            // SAFETY: `pte` came from `walk` over a live table.
            let entry = unsafe { *pte };
            if !entry.is_valid() {
                return Err(());
            }
            let page_off = cur.page_offset();
            let n = core::cmp::min(PAGE_SIZE - page_off, src.len() - off);
            let dst = (entry.addr().as_usize() + page_off) as *mut u8;
            // SAFETY: `entry` maps a live physical page; `n` stays
            // within it by construction of `page_off`/`PAGE_SIZE`.
            unsafe { core::ptr::copy_nonoverlapping(src[off..off + n].as_ptr(), dst, n) };
            off += n;
        }
        Ok(())
    }

    /// Copies from user memory starting at `va` into `dst`.
    pub fn copy_in(&self, va: VirtAddr, dst: &mut [u8]) -> Result<(), ()> {
        let mut off = 0;
        while off < dst.len() {
            let cur = VirtAddr::new(va.as_usize() + off);
            let page_va = cur.page_round_down();
            let pte = walk(self.root_addr(), page_va, false).ok_or(())?;
            // SAFETY: see `copy_out`.
            let entry = unsafe { *pte };
            if !entry.is_valid() {
                return Err(());
            }
            let page_off = cur.page_offset();
            let n = core::cmp::min(PAGE_SIZE - page_off, dst.len() - off);
            let src = (entry.addr().as_usize() + page_off) as *const u8;
            // SAFETY: see `copy_out`.
            unsafe { core::ptr::copy_nonoverlapping(src, dst[off..off + n].as_mut_ptr(), n) };
            off += n;
        }
        Ok(())
    }

    /// Builds a child address space sharing every mapped page
    /// copy-on-write: both this process's and the child's mappings lose
    /// `WRITABLE` and gain `COW`, and the page's refcount is bumped so
    /// neither side frees it while the other still maps it.
    pub fn fork(&self) -> Option<UserMemory> {
        let mut child = UserMemory::new()?;
        child.brk = self.brk;

        let top = VirtAddr::new(self.brk).page_round_up().as_usize();
        let mut va = 0;
        while va < top {
            let vaddr = VirtAddr::new(va);
            if let Some(pte) = walk(self.root_addr(), vaddr, false) {
                // SAFETY: `pte` came from `walk` over a live table.
                let entry = unsafe { *pte };
                if entry.is_valid() {
                    let cow_flags =
                        (entry.flags() - PteFlags::WRITABLE) | PteFlags::COW;
                    // SAFETY: see above; downgrading permissions in
                    // place on an already-valid entry is sound.
                    unsafe { *pte = entry.with_flags(cow_flags) };
                    kalloc::dup_page(entry.addr());
                    if child.map_page(vaddr, entry.addr(), cow_flags).is_err() {
                        return None;
                    }
                }
            }
            va += PAGE_SIZE;
        }
        Some(child)
    }

    /// Resolves a write fault at `va`. If the page is copy-on-write and
    /// still shared, allocates a private copy and remaps it writable;
    /// if this is the last reference, simply clears `COW` in place.
    /// Returns `Err` if `va` is not a valid COW mapping (a genuine
    /// protection fault the caller should deliver as a kill/signal).
    pub fn handle_write_fault(&mut self, va: VirtAddr) -> Result<(), ()> {
        let page_va = va.page_round_down();
        let pte = walk(self.root_addr(), page_va, false).ok_or(())?;
        // SAFETY: `pte` came from `walk` over a live table.
        let entry = unsafe { *pte };
        if !entry.is_valid() || !entry.flags().contains(PteFlags::COW) {
            return Err(());
        }

        let writable_flags = (entry.flags() - PteFlags::COW) | PteFlags::WRITABLE;
        if kalloc::page_refcount(entry.addr()) == 1 {
            // SAFETY: sole owner; safe to reuse in place.
            unsafe { *pte = entry.with_flags(writable_flags) };
            return Ok(());
        }

        let mut new_page = kalloc_page().ok_or(())?;
        new_page.as_bytes_mut().copy_from_slice(
            // SAFETY: `entry` maps a live, readable physical page.
            unsafe { &*(entry.addr().as_usize() as *const [u8; PAGE_SIZE]) },
        );
        let new_pa = new_page.into_addr();
        kalloc::free_page_addr(entry.addr());
        // SAFETY: see above.
        unsafe { *pte = Pte::new(new_pa, writable_flags | PteFlags::VALID) };
        Ok(())
    }
}

impl Drop for UserMemory {
    fn drop(&mut self) {
        free_subtree(self.root_addr(), 0);
    }
}

/// Recursively frees a page-table subtree, including leaf data pages at
/// level 3 (their refcount-aware release happens in `free_page_addr`, so
/// a still-COW-shared page survives until its last owner drops it).
fn free_subtree(table: PhysAddr, level: usize) {
    // SAFETY: `table` is a live table frame owned by the `UserMemory`
    // being dropped.
    let entries = unsafe { &*(table.as_usize() as *const [Pte; PTE_PER_TABLE]) };
    for &pte in entries.iter() {
        if pte.is_valid() {
            if level < 3 {
                free_subtree(pte.addr(), level + 1);
            }
            kalloc::free_page_addr(pte.addr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP_PAGES: usize = 256;

    #[repr(align(4096))]
    struct Heap([u8; HEAP_PAGES * PAGE_SIZE]);
    static mut HEAP: Heap = Heap([0; HEAP_PAGES * PAGE_SIZE]);

    fn ensure_heap() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            // SAFETY: `HEAP` is a test-only static never touched outside
            // this module; `init` is called exactly once via `Once`.
            unsafe {
                let start = HEAP.0.as_mut_ptr() as usize;
                kalloc::init(PhysAddr::new(start), PhysAddr::new(start + HEAP.0.len()));
            }
        });
    }

    #[test]
    fn copy_out_then_copy_in_round_trips() {
        ensure_heap();
        let mut mem = UserMemory::new().unwrap();
        let page = kalloc_page().unwrap();
        mem.map_page(
            VirtAddr::new(0x1000),
            page.into_addr(),
            PteFlags::READABLE | PteFlags::WRITABLE | PteFlags::USER,
        )
        .unwrap();
        let msg = b"hello from user space";
        mem.copy_out(VirtAddr::new(0x1000 + 8), msg).unwrap();
        let mut back = [0u8; 22];
        mem.copy_in(VirtAddr::new(0x1000 + 8), &mut back).unwrap();
        assert_eq!(&back, msg);
    }

    #[test]
    fn copy_out_past_mapped_range_fails() {
        ensure_heap();
        let mem = UserMemory::new().unwrap();
        assert!(mem.copy_out(VirtAddr::new(0x5000), &[1, 2, 3]).is_err());
    }

    #[test]
    fn fork_shares_pages_cow_until_write_fault() {
        ensure_heap();
        let mut parent = UserMemory::new().unwrap();
        let page = kalloc_page().unwrap();
        let pa = page.into_addr();
        parent
            .map_page(VirtAddr::new(0x2000), pa, PteFlags::READABLE | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        parent.copy_out(VirtAddr::new(0x2000), b"parent").unwrap();

        let mut child = parent.fork().unwrap();
        assert_eq!(kalloc::page_refcount(pa), 2);

        let mut buf = [0u8; 6];
        child.copy_in(VirtAddr::new(0x2000), &mut buf).unwrap();
        assert_eq!(&buf, b"parent");

        // Writing through the child must not perturb the parent's page.
        child.handle_write_fault(VirtAddr::new(0x2000)).unwrap();
        child.copy_out(VirtAddr::new(0x2000), b"child!").unwrap();

        let mut parent_buf = [0u8; 6];
        parent.copy_in(VirtAddr::new(0x2000), &mut parent_buf).unwrap();
        assert_eq!(&parent_buf, b"parent");
    }

    #[test]
    fn dropping_user_memory_frees_every_mapped_page() {
        ensure_heap();
        let mut mem = UserMemory::new().unwrap();
        for i in 0..4 {
            let page = kalloc_page().unwrap();
            mem.map_page(
                VirtAddr::new(i * PAGE_SIZE),
                page.into_addr(),
                PteFlags::READABLE | PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        }
        drop(mem);

        // The allocator must be able to hand out the same number of
        // pages again without growing the heap: nothing leaked.
        let mut reclaimed = Vec::new();
        for _ in 0..4 {
            reclaimed.push(kalloc_page().unwrap());
        }
        assert_eq!(reclaimed.len(), 4);
    }
}
