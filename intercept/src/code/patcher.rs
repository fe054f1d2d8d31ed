use crate::code::cache::invalidate_icache;
use crate::types::{InterceptError, Result};

/// Patch code at `addr` for `size` bytes.
///
/// Flips the covering pages to RWX for the duration of `apply`, then
/// restores RX and flushes the whole range. RWX (not RW) so other code on
/// the same page stays executable while the patch is applied.
///
/// # Safety
/// `addr` must point to `size` bytes of mapped code. `apply` must write
/// within that range.
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let page_start = (addr as usize) & !(page_sz - 1);
    let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
    let map_size = page_end - page_start;

    if libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) != 0
    {
        return Err(InterceptError::ProtectionFailed(addr as usize));
    }

    apply(addr);

    libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_EXEC,
    );

    // Flush the whole page range, not just the patched bytes, so other
    // patch sites sharing a page never see stale instruction cache lines.
    invalidate_icache(page_start as *mut u8, map_size);
    Ok(())
}

/// Read `N` bytes of code at `addr`.
///
/// # Safety
/// `addr` must point to at least `N` bytes of mapped memory.
pub unsafe fn read_code<const N: usize>(addr: *const u8) -> [u8; N] {
    core::ptr::read_unaligned(addr as *const [u8; N])
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn map_code_page() -> (*mut u8, usize) {
        let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page = libc::mmap(
            core::ptr::null_mut(),
            page_sz,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(page, libc::MAP_FAILED, "mmap failed");
        core::ptr::write_bytes(page as *mut u8, 0xC3, page_sz);
        libc::mprotect(page, page_sz, libc::PROT_READ | libc::PROT_EXEC);
        (page as *mut u8, page_sz)
    }

    #[test]
    fn patch_code_writes_are_visible_at_original_address() {
        unsafe {
            let (buf, page_sz) = map_code_page();
            patch_code(buf, 5, |p| {
                p.write(0xE8);
                (p.add(1) as *mut i32).write_unaligned(-64);
            })
            .expect("patch");

            let bytes: [u8; 5] = read_code(buf);
            assert_eq!(bytes, [0xE8, 0xC0, 0xFF, 0xFF, 0xFF]);
            libc::munmap(buf as *mut libc::c_void, page_sz);
        }
    }

    #[test]
    fn patched_code_executes() {
        unsafe {
            let (buf, page_sz) = map_code_page();
            // Patch to: mov eax, 42; ret
            patch_code(buf, 6, |p| {
                p.write(0xB8);
                (p.add(1) as *mut u32).write_unaligned(42);
                p.add(5).write(0xC3);
            })
            .expect("patch");

            let f: extern "C" fn() -> u32 = core::mem::transmute(buf);
            assert_eq!(f(), 42);
            libc::munmap(buf as *mut libc::c_void, page_sz);
        }
    }
}
