use core::ffi::c_void;
use std::ffi::CStr;

use crate::types::{InterceptError, ModuleInfo, Result};

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Enumerate all loaded objects via `dl_iterate_phdr`.
///
/// The base address is the link-time-lowest PT_LOAD segment relocated by
/// the load bias, so module-relative offsets taken from a disassembler can
/// be added to it directly.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    struct Ctx {
        modules: Vec<ModuleInfo>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;

        let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            // Empty name means the main executable.
            match std::fs::read_link("/proc/self/exe") {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => String::new(),
            }
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        let mut min_addr: Option<u64> = None;
        let mut max_addr: u64 = 0;
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for phdr in phdrs {
            if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
                let start = phdr.p_vaddr as u64;
                let end = start + phdr.p_memsz as u64;
                min_addr = Some(min_addr.map(|m: u64| m.min(start)).unwrap_or(start));
                max_addr = max_addr.max(end);
            }
        }

        let base = info.dlpi_addr as usize + min_addr.unwrap_or(0) as usize;
        let size = min_addr.map(|min| (max_addr - min) as usize).unwrap_or(0);

        let name = if path.is_empty() {
            String::from("[unknown]")
        } else {
            basename(&path).to_string()
        };

        ctx.modules.push(ModuleInfo {
            name,
            path,
            base_address: base,
            size,
        });

        0 // continue iteration
    }

    let mut ctx = Ctx { modules: Vec::new() };

    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }

    ctx.modules
}

pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules()
        .into_iter()
        .find(|m| m.name == name || m.path.ends_with(name))
}

/// Base address of a loaded module, for resolving module-relative patch
/// sites.
pub fn find_module_base(name: &str) -> Result<usize> {
    find_module_by_name(name)
        .map(|m| m.base_address)
        .ok_or_else(|| InterceptError::ModuleNotFound(name.to_string()))
}
