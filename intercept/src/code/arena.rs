use std::sync::{Mutex, OnceLock};

use log::{debug, trace, warn};

use crate::types::{InterceptError, Result};

/// Fill byte for freed executable memory. Stray jumps into a reclaimed
/// trampoline hit an int3 instead of executing leftover bytes.
const TRAP_FILL: u8 = 0xCC;

const MIN_PAGE_SIZE: usize = 4096;

/// Handle to one arena allocation. Non-owning; returning it to the arena
/// goes through [`CodeArena::deallocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: *mut u8,
    pub len: usize,
}

impl Region {
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.len
    }
}

/// A span inside a page, addressed by absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    addr: usize,
    size: usize,
}

impl Span {
    fn end(&self) -> usize {
        self.addr + self.size
    }
}

#[derive(Debug)]
struct Page {
    base: *mut u8,
    size: usize,
    /// Free spans, kept sorted by address and coalesced.
    free: Vec<Span>,
    /// Live allocations as (addr, size), so deallocate/reallocate know
    /// extents.
    live: Vec<Span>,
}

impl Page {
    fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.size
    }

    fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Insert a span into the free list, merging with address-adjacent
    /// neighbors on either side.
    fn return_span(&mut self, mut span: Span) {
        unsafe {
            core::ptr::write_bytes(span.addr as *mut u8, TRAP_FILL, span.size);
        }
        let mut i = 0;
        while i < self.free.len() {
            let cur = self.free[i];
            if cur.end() == span.addr {
                span = Span { addr: cur.addr, size: cur.size + span.size };
                self.free.remove(i);
            } else if span.end() == cur.addr {
                span.size += cur.size;
                self.free.remove(i);
            } else {
                i += 1;
            }
        }
        let pos = self.free.partition_point(|r| r.addr < span.addr);
        self.free.insert(pos, span);
    }
}

/// Arena of executable pages backing generated trampolines.
///
/// Pages are mapped read-write, switched to read-write-execute once, and
/// carved into regions with a first-fit scan. All access goes through the
/// process-wide mutex returned by [`CodeArena::global`].
#[derive(Debug, Default)]
pub struct CodeArena {
    pages: Vec<Page>,
}

// Raw page pointers never leave the mutex-guarded arena.
unsafe impl Send for CodeArena {}

impl CodeArena {
    pub fn global() -> &'static Mutex<CodeArena> {
        static ARENA: OnceLock<Mutex<CodeArena>> = OnceLock::new();
        ARENA.get_or_init(|| Mutex::new(CodeArena::default()))
    }

    /// Allocate `size` bytes of executable memory.
    ///
    /// Scans every page's free list in address order and takes the first
    /// span large enough, shrinking it from the front. Maps a fresh page
    /// when no span fits.
    pub fn allocate(&mut self, size: usize) -> Result<Region> {
        if size == 0 {
            return Err(InterceptError::AllocationFailed);
        }
        if let Some(region) = self.take_first_fit(size) {
            return Ok(region);
        }
        self.map_page(size)?;
        self.take_first_fit(size).ok_or(InterceptError::AllocationFailed)
    }

    fn take_first_fit(&mut self, size: usize) -> Option<Region> {
        for page in &mut self.pages {
            for i in 0..page.free.len() {
                let span = page.free[i];
                if span.size < size {
                    continue;
                }
                if span.size == size {
                    page.free.remove(i);
                } else {
                    page.free[i] = Span { addr: span.addr + size, size: span.size - size };
                }
                let taken = Span { addr: span.addr, size };
                let pos = page.live.partition_point(|r| r.addr < taken.addr);
                page.live.insert(pos, taken);
                trace!("arena: {} bytes at {:#x}", size, taken.addr);
                return Some(Region { base: taken.addr as *mut u8, len: size });
            }
        }
        None
    }

    fn map_page(&mut self, at_least: usize) -> Result<()> {
        let size = at_least.max(MIN_PAGE_SIZE).next_multiple_of(MIN_PAGE_SIZE);
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(InterceptError::AllocationFailed);
            }
            // W+X: trampolines keep being rewritten after they go live.
            if libc::mprotect(
                ptr,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            ) != 0
            {
                libc::munmap(ptr, size);
                return Err(InterceptError::ProtectionFailed(ptr as usize));
            }
            core::ptr::write_bytes(ptr as *mut u8, TRAP_FILL, size);
            debug!("arena: mapped {} byte page at {:p}", size, ptr);
            self.pages.push(Page {
                base: ptr as *mut u8,
                size,
                free: vec![Span { addr: ptr as usize, size }],
                live: Vec::new(),
            });
        }
        Ok(())
    }

    /// Return an allocation to its page. A region whose base does not name
    /// a live allocation is refused with a `false` return and no state
    /// change. A page whose last allocation is returned is unmapped.
    pub fn deallocate(&mut self, region: Region) -> bool {
        let addr = region.base as usize;
        let Some(pi) = self.pages.iter().position(|p| p.contains(addr)) else {
            warn!("arena: deallocate of unknown region at {:#x}", addr);
            return false;
        };
        let page = &mut self.pages[pi];
        let Some(li) = page.live.iter().position(|r| r.addr == addr) else {
            warn!("arena: deallocate of non-live region at {:#x}", addr);
            return false;
        };
        let span = page.live.remove(li);
        page.return_span(span);
        trace!("arena: freed {} bytes at {:#x}", span.size, addr);
        if page.is_empty() {
            let page = self.pages.remove(pi);
            unsafe {
                libc::munmap(page.base as *mut libc::c_void, page.size);
            }
            debug!("arena: unmapped empty page at {:p}", page.base);
        }
        true
    }

    /// Grow or shrink an allocation without moving it.
    ///
    /// Growth succeeds only when the bytes directly after the allocation
    /// are free. Failure is reported with a `false` return and no state
    /// change; the region stays valid at its old size either way.
    /// Shrinking returns the tail to the free list and always succeeds.
    pub fn reallocate(&mut self, region: &mut Region, new_size: usize) -> bool {
        let addr = region.base as usize;
        let Some(page) = self.pages.iter_mut().find(|p| p.contains(addr)) else {
            warn!("arena: reallocate of unknown region at {:#x}", addr);
            return false;
        };
        let Some(li) = page.live.iter().position(|r| r.addr == addr) else {
            warn!("arena: reallocate of non-live region at {:#x}", addr);
            return false;
        };
        let old = page.live[li];
        if new_size == old.size {
            return true;
        }
        if new_size < old.size {
            page.live[li].size = new_size;
            page.return_span(Span { addr: addr + new_size, size: old.size - new_size });
            region.len = new_size;
            return true;
        }
        let needed = new_size - old.size;
        let Some(fi) = page.free.iter().position(|r| r.addr == old.end()) else {
            return false;
        };
        let next = page.free[fi];
        if next.size < needed {
            return false;
        }
        if next.size == needed {
            page.free.remove(fi);
        } else {
            page.free[fi] = Span { addr: next.addr + needed, size: next.size - needed };
        }
        page.live[li].size = new_size;
        region.len = new_size;
        trace!("arena: grew {:#x} from {} to {} bytes", addr, old.size, new_size);
        true
    }

    /// Size of the live allocation starting at `ptr`, if any.
    pub fn size_of(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let page = self.pages.iter().find(|p| p.contains(addr))?;
        page.live.iter().find(|r| r.addr == addr).map(|r| r.size)
    }

    #[cfg(test)]
    fn free_spans(&self) -> Vec<(usize, usize)> {
        self.pages
            .iter()
            .flat_map(|p| p.free.iter().map(|r| (r.addr, r.size)))
            .collect()
    }

    #[cfg(test)]
    fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_deallocate_reclaims_page() {
        let mut arena = CodeArena::default();
        let a = arena.allocate(64).expect("alloc");
        let b = arena.allocate(64).expect("alloc");
        assert_eq!(a.len, 64);
        assert_eq!(arena.page_count(), 1);
        assert!(arena.deallocate(a));
        assert!(arena.deallocate(b));
        assert_eq!(arena.page_count(), 0);
    }

    #[test]
    fn coalesces_in_either_deallocation_order() {
        for reversed in [false, true] {
            let mut arena = CodeArena::default();
            let a = arena.allocate(32).expect("alloc");
            let b = arena.allocate(32).expect("alloc");
            let keep = arena.allocate(32).expect("alloc");
            if reversed {
                arena.deallocate(b);
                arena.deallocate(a);
            } else {
                arena.deallocate(a);
                arena.deallocate(b);
            }
            // a and b merge into one 64-byte hole before the live allocation.
            let free = arena.free_spans();
            assert_eq!(free.len(), 2);
            assert_eq!(free[0], (a.base as usize, 64));
            arena.deallocate(keep);
        }
    }

    #[test]
    fn first_fit_takes_earliest_large_enough_hole() {
        let mut arena = CodeArena::default();
        let a = arena.allocate(10).expect("alloc");
        let pad1 = arena.allocate(8).expect("alloc");
        let b = arena.allocate(50).expect("alloc");
        let pad2 = arena.allocate(8).expect("alloc");
        let c = arena.allocate(20).expect("alloc");
        let tail = arena.allocate(8).expect("alloc");
        arena.deallocate(a);
        arena.deallocate(b);
        arena.deallocate(c);
        // Holes of 10, 50 and 20 bytes in address order; 15 bytes must land
        // at the start of the 50-byte hole.
        let d = arena.allocate(15).expect("alloc");
        assert_eq!(d.base, b.base);
        arena.deallocate(d);
        arena.deallocate(pad1);
        arena.deallocate(pad2);
        arena.deallocate(tail);
    }

    #[test]
    fn deallocate_refuses_unattributed_regions() {
        let mut arena = CodeArena::default();
        let a = arena.allocate(32).expect("alloc");
        // Not in any page, and mid-allocation rather than at its start.
        assert!(!arena.deallocate(Region { base: 0x1234 as *mut u8, len: 8 }));
        assert!(!arena.deallocate(Region { base: unsafe { a.base.add(8) }, len: 8 }));
        assert_eq!(arena.size_of(a.base), Some(32));
        assert!(arena.deallocate(a));
    }

    #[test]
    fn freed_memory_is_trap_filled() {
        let mut arena = CodeArena::default();
        let a = arena.allocate(16).expect("alloc");
        let keep = arena.allocate(16).expect("alloc");
        unsafe { core::ptr::write_bytes(a.base, 0x90, 16) };
        arena.deallocate(a);
        let bytes = unsafe { core::slice::from_raw_parts(a.base as *const u8, 16) };
        assert!(bytes.iter().all(|&b| b == TRAP_FILL));
        arena.deallocate(keep);
    }

    #[test]
    fn reallocate_grows_in_place_when_tail_is_free() {
        let mut arena = CodeArena::default();
        let mut a = arena.allocate(32).expect("alloc");
        let base = a.base;
        assert!(arena.reallocate(&mut a, 64));
        assert_eq!(a.base, base);
        assert_eq!(a.len, 64);
        assert_eq!(arena.size_of(a.base), Some(64));
        arena.deallocate(a);
    }

    #[test]
    fn reallocate_fails_when_tail_is_taken() {
        let mut arena = CodeArena::default();
        let mut a = arena.allocate(32).expect("alloc");
        let b = arena.allocate(32).expect("alloc");
        assert_eq!(b.base as usize, a.base as usize + 32);
        assert!(!arena.reallocate(&mut a, 64));
        // The original allocation is untouched.
        assert_eq!(a.len, 32);
        assert_eq!(arena.size_of(a.base), Some(32));
        arena.deallocate(a);
        arena.deallocate(b);
    }

    #[test]
    fn reallocate_shrink_returns_tail() {
        let mut arena = CodeArena::default();
        let mut a = arena.allocate(64).expect("alloc");
        let b = arena.allocate(16).expect("alloc");
        assert!(arena.reallocate(&mut a, 32));
        assert_eq!(a.len, 32);
        assert_eq!(arena.size_of(a.base), Some(32));
        // The freed tail is reusable.
        let c = arena.allocate(32).expect("alloc");
        assert_eq!(c.base as usize, a.base as usize + 32);
        arena.deallocate(a);
        arena.deallocate(b);
        arena.deallocate(c);
    }

    #[test]
    fn randomized_allocations_never_overlap() {
        let mut arena = CodeArena::default();
        let mut live: Vec<Region> = Vec::new();
        let mut seed = 0x2545_f491u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        for _ in 0..200 {
            if live.len() > 12 || (!live.is_empty() && next() % 3 == 0) {
                let i = next() as usize % live.len();
                let region = live.swap_remove(i);
                assert!(arena.deallocate(region));
            } else {
                let size = 8 + (next() as usize % 120);
                let region = arena.allocate(size).expect("alloc");
                let (ptr, len) = (region.base as usize, region.len);
                for r in &live {
                    let (a, s) = (r.base as usize, r.len);
                    assert!(ptr + len <= a || a + s <= ptr, "overlap at {:#x}", ptr);
                }
                live.push(region);
            }
        }
        for region in live {
            arena.deallocate(region);
        }
        assert_eq!(arena.page_count(), 0);
    }
}
