//! Physical page allocator, for user processes, kernel stacks,
//! page-table pages and pipe buffers. Allocates whole `PGSIZE` pages out
//! of a contiguous physical range handed over at construction.
//!
//! Free pages are chained through a freelist threaded through the pages
//! themselves. Alongside it sits a per-page reference count: a page fresh
//! out of [`Kmem::alloc`] has exactly one owner, and the fork path
//! registers further owners with [`Kmem::incr_ref`] when it maps a page
//! copy-on-write instead of duplicating it. A page only returns to the
//! freelist once the last owner frees it.

use core::ptr;

use log::trace;

use crate::lock::spinlock::SpinLock;
use crate::param::{ALLOC_JUNK, FREE_JUNK, MAXPAGES, PGSIZE};

/// Recoverable allocator failure. Exhaustion is a normal condition the
/// caller handles; everything else the allocator treats as a fatal
/// contract violation and panics on directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("out of physical pages")]
    OutOfMemory,
}

/// A node of the freelist, living in the free page itself.
struct Run {
    next: *mut Run,
}

struct FreeList {
    head: *mut Run,
}

// The raw pointers chain through pages this allocator exclusively owns.
unsafe impl Send for FreeList {}

struct RefTable {
    count: [u32; MAXPAGES],
}

pub struct Kmem {
    freelist: SpinLock<FreeList>,
    refcnt: SpinLock<RefTable>,
    /// Managed range, page-aligned: pages live in `[base, top)`.
    base: usize,
    top: usize,
}

impl Kmem {
    /// Build an allocator over the physical range `[start, end)`. The
    /// range is rounded inward to whole pages and every page is put on
    /// the freelist.
    ///
    /// # Safety
    ///
    /// The caller hands over exclusive ownership of that memory: it must
    /// be valid for reads and writes for the allocator's whole lifetime
    /// and nothing else may touch it except through pages returned by
    /// [`Kmem::alloc`].
    pub unsafe fn new(start: usize, end: usize) -> Self {
        let base = (start + PGSIZE - 1) & !(PGSIZE - 1);
        let top = end & !(PGSIZE - 1);
        assert!(base <= top, "kinit: empty range {:#x}..{:#x}", start, end);
        assert!(
            (top - base) / PGSIZE <= MAXPAGES,
            "kinit: range exceeds refcount table"
        );
        let kmem = Self {
            freelist: SpinLock::new(FreeList { head: ptr::null_mut() }, "kmem"),
            refcnt: SpinLock::new(RefTable { count: [0; MAXPAGES] }, "refcnt"),
            base,
            top,
        };
        kmem.free_range(base, top);
        kmem
    }

    unsafe fn free_range(&self, start: usize, end: usize) {
        let mut pa = start;
        while pa + PGSIZE <= end {
            ptr::write_bytes(pa as *mut u8, FREE_JUNK, PGSIZE);
            self.push_free(pa);
            pa += PGSIZE;
        }
    }

    /// Allocate one page of physical memory. The page comes back with a
    /// reference count of exactly 1, filled with junk so that reads of
    /// uninitialized memory show up as a recognizable pattern.
    pub fn alloc(&self) -> Result<usize, AllocError> {
        let pa = {
            let mut fl = self.freelist.acquire();
            if fl.head.is_null() {
                trace!("kalloc: out of physical pages");
                return Err(AllocError::OutOfMemory);
            }
            let r = fl.head;
            fl.head = unsafe { (*r).next };
            r as usize
        };
        self.refcnt.acquire().count[self.index(pa)] = 1;
        unsafe { ptr::write_bytes(pa as *mut u8, ALLOC_JUNK, PGSIZE) };
        Ok(pa)
    }

    /// Drop one owner of the page at `pa`, which must have come from
    /// [`Kmem::alloc`]. While other owners remain the page stays in use;
    /// the last free junk-fills it to catch dangling references and puts
    /// it back on the freelist.
    ///
    /// Panics on a misaligned, out-of-range or already-free page: those
    /// are bookkeeping bugs in the caller, not recoverable conditions.
    ///
    /// # Safety
    ///
    /// The caller must actually own one reference to the page and must
    /// not touch it afterwards.
    pub unsafe fn free(&self, pa: usize) {
        if pa % PGSIZE != 0 || pa < self.base || pa >= self.top {
            panic!("kfree: bad physical address {:#x}", pa);
        }
        {
            let mut rc = self.refcnt.acquire();
            let n = &mut rc.count[(pa - self.base) / PGSIZE];
            if *n == 0 {
                panic!("kfree: page {:#x} already free", pa);
            }
            *n -= 1;
            if *n > 0 {
                // another owner still maps it
                return;
            }
        }
        ptr::write_bytes(pa as *mut u8, FREE_JUNK, PGSIZE);
        self.push_free(pa);
    }

    /// Current number of owners of the page at `pa`.
    pub fn get_ref(&self, pa: usize) -> u32 {
        self.refcnt.acquire().count[self.index(pa)]
    }

    /// Register one more owner of an in-use page, as the copy-on-write
    /// fork path does when it shares a page instead of copying it.
    pub fn incr_ref(&self, pa: usize) {
        let mut rc = self.refcnt.acquire();
        let n = &mut rc.count[(pa - self.base) / PGSIZE];
        if *n == 0 {
            panic!("incref: page {:#x} is free", pa);
        }
        *n += 1;
    }

    unsafe fn push_free(&self, pa: usize) {
        let r = pa as *mut Run;
        let mut fl = self.freelist.acquire();
        (*r).next = fl.head;
        fl.head = r;
    }

    fn index(&self, pa: usize) -> usize {
        assert!(
            pa % PGSIZE == 0 && pa >= self.base && pa < self.top,
            "bad physical address {:#x}",
            pa
        );
        (pa - self.base) / PGSIZE
    }
}
