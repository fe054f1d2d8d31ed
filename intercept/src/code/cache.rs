/// Invalidate the instruction cache for a patched code region.
///
/// x86 keeps the instruction cache coherent with data writes, so this is a
/// no-op there; it stays at the call sites so non-coherent targets only need
/// to change this one function.
///
/// # Safety
/// `addr` must point to at least `size` bytes of memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let _ = (addr, size);
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }
}
