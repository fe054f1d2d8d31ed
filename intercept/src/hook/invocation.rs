use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::CpuContext;

/// View over the live argument words of an intercepted call.
///
/// Each entry points into the interrupted thread's stack, so writes take
/// effect when the original code resumes. Arguments are plain 32-bit words;
/// wider values occupy consecutive slots.
pub struct Args<'a> {
    ptrs: &'a [*mut u32],
}

impl<'a> Args<'a> {
    /// # Safety
    /// `argv` must point to `len` valid argument-word pointers that outlive
    /// the borrow.
    pub(crate) unsafe fn from_raw(argv: *const *mut u32, len: usize) -> Self {
        Self {
            ptrs: core::slice::from_raw_parts(argv, len),
        }
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        self.ptrs.get(index).map(|p| unsafe { p.read() })
    }

    /// Overwrite an argument word. Returns false when the index is out of
    /// range.
    pub fn set(&mut self, index: usize, value: u32) -> bool {
        match self.ptrs.get(index) {
            Some(p) => {
                unsafe { p.write(value) };
                true
            }
            None => false,
        }
    }
}

/// Mutable view over the interrupted call, handed to `Info`-shaped
/// callbacks.
///
/// Wraps the live register snapshot and return-address cell, so writes take
/// effect when execution resumes, plus the skip flag for suppressing the
/// displaced instruction.
pub struct CallInfo<'a> {
    cpu: &'a mut CpuContext,
    ret_addr: &'a mut u32,
    skip: &'a AtomicBool,
    target: u32,
}

impl<'a> CallInfo<'a> {
    pub(crate) fn new(
        cpu: &'a mut CpuContext,
        ret_addr: &'a mut u32,
        skip: &'a AtomicBool,
        target: u32,
    ) -> Self {
        Self {
            cpu,
            ret_addr,
            skip,
            target,
        }
    }

    pub fn cpu(&mut self) -> &mut CpuContext {
        self.cpu
    }

    /// Address execution resumes at after the patch site.
    pub fn ret_addr(&self) -> u32 {
        *self.ret_addr
    }

    /// Redirect where execution resumes.
    pub fn set_ret_addr(&mut self, addr: u32) {
        *self.ret_addr = addr;
    }

    /// Skip the displaced original instruction for this invocation.
    pub fn skip_original(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    /// Absolute address of the patch site.
    pub fn target(&self) -> u32 {
        self.target
    }
}
