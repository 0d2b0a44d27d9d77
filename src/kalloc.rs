//! Physical memory allocation.
//!
//! Two allocators, layered:
//!
//! * A page-granular free list (`Kmem`) over the range `[heap_start,
//!   heap_end)` handed to `init`. Free pages are linked through their own
//!   first word, so the free list costs no separate metadata.
//! * A sub-page allocator (`kmalloc`/`kfree`) for small, short-lived
//!   kernel objects, built the same way but over blocks smaller than a
//!   page; it grows by pulling a fresh page from `Kmem` whenever its own
//!   free list runs dry. This mirrors the teacher's `Kmem` design of
//!   "page allocator underneath, header-in-freed-memory free list on
//!   top."

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::addr::PhysAddr;
use crate::lock::Spinlock;
use crate::page::Page;
use crate::param::{MAX_PHYS_PAGES, PAGE_SIZE};

struct FreeListNode {
    next: *mut FreeListNode,
}

/// Page-granular free list.
pub struct Kmem {
    freelist: *mut FreeListNode,
}

// SAFETY: all access to `freelist` is through the owning `Spinlock`.
unsafe impl Send for Kmem {}

impl Kmem {
    const fn new() -> Self {
        Self {
            freelist: core::ptr::null_mut(),
        }
    }
}

pub static KMEM: Spinlock<Kmem> = Spinlock::new("kmem", Kmem::new());

/// Physical base address tracked by `page_refcount`; pages below this
/// are never touched by the copy-on-write path (only heap pages handed
/// out by `kalloc_page` are).
static PHYS_BASE: AtomicUsize = AtomicUsize::new(0);

/// One refcount per tracked physical page, for copy-on-write sharing
/// after `fork`. A freshly allocated page starts at refcount 1 (owned
/// solely by its allocator); `dup_page` bumps it when a second page
/// table entry comes to share the frame, and `free_page_addr` only
/// returns the frame to `Kmem` once it reaches zero.
static PAGE_REFCOUNT: [AtomicU8; MAX_PHYS_PAGES] = {
    const ZERO: AtomicU8 = AtomicU8::new(0);
    [ZERO; MAX_PHYS_PAGES]
};

fn page_index(addr: PhysAddr) -> usize {
    let base = PHYS_BASE.load(Ordering::Relaxed);
    (addr.as_usize() - base) / PAGE_SIZE
}

/// Seeds the page allocator's free list with every page-aligned page in
/// `[start, end)`. Must be called exactly once, before any other thread
/// may call `kalloc_page`/`free_page_addr`.
///
/// # Safety
///
/// `[start, end)` must be unused, mapped, writable physical memory that
/// nothing else references.
pub unsafe fn init(start: PhysAddr, end: PhysAddr) {
    let mut addr = start.page_round_down().as_usize();
    if addr < start.as_usize() {
        addr += PAGE_SIZE;
    }
    PHYS_BASE.store(addr, Ordering::Relaxed);
    while addr + PAGE_SIZE <= end.as_usize() {
        let a = PhysAddr::new(addr);
        PAGE_REFCOUNT[page_index(a)].store(1, Ordering::Relaxed);
        // SAFETY: `addr` is within the caller-guaranteed free range.
        unsafe { free_page_addr(a) };
        addr += PAGE_SIZE;
    }
}

/// Allocates one physical page, or `None` if the free list is empty.
/// The returned page has refcount 1.
pub fn kalloc_page() -> Option<Page> {
    let mut kmem = KMEM.lock();
    let head = kmem.freelist;
    if head.is_null() {
        return None;
    }
    // SAFETY: `head` came from a prior `free_page_addr` of a page no
    // longer in use by anyone else.
    kmem.freelist = unsafe { (*head).next };
    drop(kmem);
    let addr = PhysAddr::new(head as usize);
    PAGE_REFCOUNT[page_index(addr)].store(1, Ordering::Relaxed);
    let mut page = unsafe { Page::from_addr(addr) };
    page.clear();
    Some(page)
}

/// Marks `addr` shared by one more page table entry, for copy-on-write
/// `fork`. Returns the new refcount.
pub fn dup_page(addr: PhysAddr) -> u8 {
    PAGE_REFCOUNT[page_index(addr)].fetch_add(1, Ordering::Relaxed) + 1
}

/// Current refcount of the page at `addr`, e.g. to decide whether a
/// write fault must copy (refcount > 1) or may write in place (== 1).
pub fn page_refcount(addr: PhysAddr) -> u8 {
    PAGE_REFCOUNT[page_index(addr)].load(Ordering::Relaxed)
}

/// Drops one reference to the page at `addr`, returning it to the free
/// list only once the refcount reaches zero.
///
/// # Safety
///
/// `addr` must be page-aligned and must have been obtained from
/// `kalloc_page`/carried a refcount bumped by `dup_page`; this call must
/// correspond to exactly one such reference.
pub fn free_page_addr(addr: PhysAddr) {
    debug_assert_eq!(addr.as_usize() % PAGE_SIZE, 0, "free_page_addr: unaligned");
    let idx = page_index(addr);
    let prev = PAGE_REFCOUNT[idx].fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev >= 1, "free_page_addr: refcount underflow");
    if prev > 1 {
        return;
    }
    let node = addr.as_usize() as *mut FreeListNode;
    let mut kmem = KMEM.lock();
    // SAFETY: refcount just reached zero, so nothing else references
    // this frame; writing a `FreeListNode` header into it is sound.
    unsafe {
        (*node).next = kmem.freelist;
    }
    kmem.freelist = node;
}

// --- Sub-page allocator -----------------------------------------------

/// Minimum kmalloc block size: large enough to hold a `FreeListNode` and
/// rounded for reasonable alignment.
const MIN_BLOCK: usize = 32;

struct KmallocState {
    /// Free blocks of exactly `MIN_BLOCK` bytes, linked the same way as
    /// `Kmem`'s page free list. Larger requests fall back to a whole
    /// page; this pool only serves the common small-object case (e.g.
    /// directory-entry scratch buffers, small `Vec`-free fixed records).
    freelist: *mut FreeListNode,
}

unsafe impl Send for KmallocState {}

static KMALLOC: Spinlock<KmallocState> = Spinlock::new(
    "kmalloc",
    KmallocState {
        freelist: core::ptr::null_mut(),
    },
);

/// Allocates a `MIN_BLOCK`-sized chunk of kernel memory. Returns null on
/// exhaustion (callers treat this the same as `kalloc_page`'s `None`:
/// release whatever was partially acquired and propagate failure).
pub fn kmalloc() -> *mut u8 {
    let mut state = KMALLOC.lock();
    if state.freelist.is_null() {
        drop(state);
        let page = match kalloc_page() {
            Some(p) => p,
            None => return core::ptr::null_mut(),
        };
        let base = page.into_addr().as_usize();
        // Carve the page into MIN_BLOCK chunks and thread them onto the
        // free list; the page itself is now owned by these chunks.
        state = KMALLOC.lock();
        let mut off = 0;
        while off + MIN_BLOCK <= PAGE_SIZE {
            let node = (base + off) as *mut FreeListNode;
            // SAFETY: `base + off` is within the page we just carved up
            // and nothing else references it yet.
            unsafe {
                (*node).next = state.freelist;
            }
            state.freelist = node;
            off += MIN_BLOCK;
        }
    }
    let head = state.freelist;
    // SAFETY: `head` is a block previously linked by this same function
    // or by `kfree`.
    state.freelist = unsafe { (*head).next };
    head as *mut u8
}

/// Returns a block previously obtained from `kmalloc`.
///
/// # Safety
///
/// `ptr` must have been returned by `kmalloc` and not already freed.
pub unsafe fn kfree(ptr: *mut u8) {
    let node = ptr as *mut FreeListNode;
    let mut state = KMALLOC.lock();
    // SAFETY: caller guarantees `ptr` is a live kmalloc block.
    unsafe {
        (*node).next = state.freelist;
    }
    state.freelist = node;
}
