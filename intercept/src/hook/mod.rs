//! Call-site interception for ia32 code.
//!
//! A [`Hook`] overwrites a patch site with `call` into a generated
//! trampoline. The trampoline snapshots the register file, dispatches the
//! before-callbacks, optionally replays the displaced instruction,
//! snapshots again, dispatches the after-callbacks and resumes at the
//! saved return address. Callbacks observe and mutate arguments and
//! registers through the snapshot.

pub mod invocation;
pub mod registry;

use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::arch::x86::length::{dest_addr, detect_patch_len, rewrite_leading_branch};
use crate::arch::x86::writer::{Reg, X86Writer};
use crate::code::arena::{CodeArena, Region};
use crate::code::patcher::{patch_code, read_code};
use crate::types::{CpuContext, InterceptError, Result, Stage};

pub use invocation::{Args, CallInfo};
pub use registry::{Callback, CallbackList};

/// Longest supported patch, set by the far call/jmp forms.
const MAX_PATCH_LEN: usize = 7;

/// Patch sites shorter than a near call cannot be hooked.
const MIN_PATCH_LEN: usize = 5;

/// Private stack the trampoline switches to before dispatching, so
/// callback frames never touch the interrupted thread's stack.
const SCRATCH_STACK_SIZE: usize = 32 * 1024;

/// How long `remove()` and `Drop` wait for an in-flight dispatch.
const DEFAULT_REMOVE_TIMEOUT: Duration = Duration::from_secs(2);

// Worst-case fragment sizes for the doubling emission, from the longest
// encoding each block can produce.
const CAPTURE_MAX: usize = 72;
const RESTORE_MAX: usize = 60;
const BRANCH_MAX: usize = 8;
const RESUME_MAX: usize = 16;

/// Worst case for one dispatch block: per argument a load, an add and a
/// push, plus the thunk call and stack cleanup.
fn dispatch_max(nargs: usize) -> usize {
    13 * nargs + 20
}

/// Tuning knobs for `Hook::with_options`.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Explicit patch length. `None` detects it from the leading opcode.
    pub patch_len: Option<usize>,
    /// Byte offset from the captured ESP to argument word 0 for the
    /// before-stage.
    pub stack_offset_before: u32,
    /// Same, for the after-stage (the replayed instruction may have moved
    /// the arguments).
    pub stack_offset_after: u32,
    /// Capture and restore EFLAGS around the dispatch.
    pub collect_flags: bool,
    /// Dispatch on the hook's private stack instead of the interrupted
    /// thread's.
    pub scratch_stack: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            patch_len: None,
            stack_offset_before: 0,
            stack_offset_after: 0,
            collect_flags: true,
            scratch_stack: true,
        }
    }
}

/// Fixed-address slots the generated code stores into. The trampoline
/// embeds the absolute address of each field, so the layout is `#[repr(C)]`
/// and the owning allocation must never move.
#[repr(C)]
struct HookSlots {
    cpu: CpuContext,
    ret_addr: u32,
}

struct SavedSite {
    bytes: [u8; MAX_PATCH_LEN],
    len: usize,
}

/// Shared state between the hook handle, the dispatch thunks and the
/// generated code. Heap-pinned behind `Hook` so the embedded slot
/// addresses stay valid for the hook's lifetime.
pub struct HookInner {
    target: usize,
    nargs: usize,
    opts: InstallOptions,
    stage: AtomicU8,
    stage_lock: Mutex<()>,
    stage_cv: Condvar,
    installed: AtomicBool,
    skip: AtomicBool,
    slots: UnsafeCell<HookSlots>,
    saved: Mutex<SavedSite>,
    trampoline: Mutex<Option<Region>>,
    scratch: Box<[u8]>,
    before: Mutex<CallbackList>,
    after: Mutex<CallbackList>,
}

// The slots cell is written by generated code and the dispatch thunks on
// the hooked thread, and only inspected elsewhere through HookRef while a
// dispatch holds the callback lock. Raw trampoline pointers never escape.
unsafe impl Send for HookInner {}
unsafe impl Sync for HookInner {}

/// Handle to a hook, for skip/ret-addr control from inside a callback.
pub struct HookRef<'a> {
    inner: &'a HookInner,
}

impl HookRef<'_> {
    /// Skip the displaced original instruction for this invocation.
    pub fn skip_original(&self) {
        self.inner.skip.store(true, Ordering::SeqCst);
    }

    /// Address execution resumes at after the patch site.
    pub fn ret_addr(&self) -> u32 {
        unsafe { (*self.inner.slots.get()).ret_addr }
    }

    /// Redirect where execution resumes.
    pub fn set_ret_addr(&self, addr: u32) {
        unsafe { (*self.inner.slots.get()).ret_addr = addr }
    }

    pub fn target(&self) -> u32 {
        self.inner.target as u32
    }
}

/// Dispatch entry for the before-stage, reached only from generated code.
///
/// Returns nonzero when the displaced instruction must be skipped. Must
/// never unwind.
unsafe extern "C" fn before_thunk(inner: *mut HookInner, argv: *const *mut u32) -> u32 {
    let inner = &*inner;
    inner.stage.store(Stage::Before as u8, Ordering::SeqCst);
    inner.skip.store(false, Ordering::SeqCst);

    let mut run_original = true;
    {
        let mut list = inner.before.lock().unwrap_or_else(|e| e.into_inner());
        let slots = inner.slots.get();
        // Every live callback runs; a false verdict or a panic only folds
        // into the skip decision, it never keeps later slots from seeing
        // the call.
        for cb in list.iter_live_mut() {
            let mut args = Args::from_raw(argv, inner.nargs);
            let keep = catch_unwind(AssertUnwindSafe(|| match cb {
                Callback::Empty(f) => f(),
                Callback::Args(f) => f(&mut args),
                Callback::Cpu(f) => f(&mut (*slots).cpu, &mut args),
                Callback::Info(f) => {
                    let mut info = CallInfo::new(
                        &mut (*slots).cpu,
                        &mut (*slots).ret_addr,
                        &inner.skip,
                        inner.target as u32,
                    );
                    f(&mut info, &mut args)
                }
                Callback::Hook(f) => f(&HookRef { inner }, &mut args),
            }))
            .unwrap_or_else(|_| {
                error!("before callback panicked at {:#x}", inner.target);
                true
            });
            run_original &= keep;
        }
    }

    (!run_original || inner.skip.load(Ordering::SeqCst)) as u32
}

/// Dispatch entry for the after-stage. Resets the stage to idle and wakes
/// any pending `remove()`.
unsafe extern "C" fn after_thunk(inner: *mut HookInner, argv: *const *mut u32) -> u32 {
    let inner = &*inner;
    inner.stage.store(Stage::After as u8, Ordering::SeqCst);

    {
        let mut list = inner.after.lock().unwrap_or_else(|e| e.into_inner());
        let slots = inner.slots.get();
        for cb in list.iter_live_mut() {
            let mut args = Args::from_raw(argv, inner.nargs);
            // The after stage has no original left to skip; verdicts are
            // dropped and panics contained.
            let res = catch_unwind(AssertUnwindSafe(|| match cb {
                Callback::Empty(f) => f(),
                Callback::Args(f) => f(&mut args),
                Callback::Cpu(f) => f(&mut (*slots).cpu, &mut args),
                Callback::Info(f) => {
                    let mut info = CallInfo::new(
                        &mut (*slots).cpu,
                        &mut (*slots).ret_addr,
                        &inner.skip,
                        inner.target as u32,
                    );
                    f(&mut info, &mut args)
                }
                Callback::Hook(f) => f(&HookRef { inner }, &mut args),
            }));
            if res.is_err() {
                error!("after callback panicked at {:#x}", inner.target);
            }
        }
    }

    let _guard = inner.stage_lock.lock().unwrap_or_else(|e| e.into_inner());
    inner.stage.store(Stage::Idle as u8, Ordering::SeqCst);
    inner.stage_cv.notify_all();
    0
}

/// An installable call-site hook.
pub struct Hook {
    inner: ManuallyDrop<Box<HookInner>>,
}

impl Hook {
    /// Hook for an absolute patch site with `nargs` 32-bit argument words.
    pub fn new(target: usize, nargs: usize) -> Self {
        Self::with_options(target, nargs, InstallOptions::default())
    }

    pub fn with_options(target: usize, nargs: usize, opts: InstallOptions) -> Self {
        Self {
            inner: ManuallyDrop::new(Box::new(HookInner {
                target,
                nargs,
                opts,
                stage: AtomicU8::new(Stage::Idle as u8),
                stage_lock: Mutex::new(()),
                stage_cv: Condvar::new(),
                installed: AtomicBool::new(false),
                skip: AtomicBool::new(false),
                slots: UnsafeCell::new(HookSlots {
                    cpu: CpuContext::default(),
                    ret_addr: 0,
                }),
                saved: Mutex::new(SavedSite {
                    bytes: [0; MAX_PATCH_LEN],
                    len: 0,
                }),
                trampoline: Mutex::new(None),
                scratch: vec![0u8; SCRATCH_STACK_SIZE].into_boxed_slice(),
                before: Mutex::new(CallbackList::default()),
                after: Mutex::new(CallbackList::default()),
            })),
        }
    }

    /// Hook for a module-relative patch site.
    pub fn in_module(module: &str, offset: usize, nargs: usize) -> Result<Self> {
        let base = crate::module::find_module_base(module)?;
        Ok(Self::new(base + offset, nargs))
    }

    pub fn target(&self) -> usize {
        self.inner.target
    }

    pub fn is_installed(&self) -> bool {
        self.inner.installed.load(Ordering::SeqCst)
    }

    /// Register a before-stage callback; the returned id is stable until
    /// unregistered.
    pub fn on_before(&self, callback: Callback) -> usize {
        self.inner
            .before
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(callback)
    }

    pub fn on_after(&self, callback: Callback) -> usize {
        self.inner
            .after
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(callback)
    }

    pub fn remove_before(&self, id: usize) {
        self.inner
            .before
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unregister(id);
    }

    pub fn remove_after(&self, id: usize) {
        self.inner
            .after
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unregister(id);
    }

    /// Patch the site and activate the hook.
    ///
    /// # Safety
    /// The target must be a mapped, executable patch site whose leading
    /// instruction matches the detected (or configured) patch length, and
    /// no other thread may be executing inside the patched range.
    pub unsafe fn install(&mut self) -> Result<()> {
        if self.inner.installed.load(Ordering::SeqCst) {
            return Err(InterceptError::AlreadyInstalled);
        }
        let stage = &self.inner.stage;
        stage
            .compare_exchange(
                Stage::Idle as u8,
                Stage::Installing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|cur| InterceptError::BadStage(Stage::from_u8(cur)))?;

        let res = self.install_inner();
        self.inner.stage.store(Stage::Idle as u8, Ordering::SeqCst);
        res
    }

    unsafe fn install_inner(&mut self) -> Result<()> {
        let inner = &**self.inner;
        let site = inner.target;
        let lead = read_code::<1>(site as *const u8)[0];
        let patch_len = match inner.opts.patch_len {
            Some(len) => {
                if !(MIN_PATCH_LEN..=MAX_PATCH_LEN).contains(&len) {
                    return Err(InterceptError::LengthNotDetectable(lead));
                }
                len
            }
            None => detect_patch_len(lead)?,
        };

        let mut saved = [0u8; MAX_PATCH_LEN];
        core::ptr::copy_nonoverlapping(site as *const u8, saved.as_mut_ptr(), patch_len);

        // Fragment-at-a-time emission into an arena region that doubles in
        // place on exhaustion; the initial size covers the fixed blocks
        // plus the per-argument dispatch code.
        let initial = 268 + patch_len + 32 * inner.nargs;
        let tramp = {
            let mut arena = CodeArena::global().lock().unwrap_or_else(|e| e.into_inner());
            let region = arena.allocate(initial)?;
            let mut buf = TrampolineBuffer {
                arena: &mut arena,
                region,
                used: 0,
            };
            let emitted = emit_trampoline(&mut buf, inner, &saved[..patch_len]);
            let (mut region, used) = (buf.region, buf.used);
            if let Err(e) = emitted {
                arena.deallocate(region);
                return Err(e);
            }
            // Doubling overshoots; hand the slack back.
            arena.reallocate(&mut region, used);
            region
        };
        debug!(
            "trampoline for {:#x}: {} bytes at {:p}",
            site, tramp.len, tramp.base
        );

        // E8 rel32 into the trampoline, padded to the full patch length.
        let mut stub = [0u8; MAX_PATCH_LEN];
        {
            let mut sw = X86Writer::new(stub.as_mut_ptr(), stub.len(), site as u32);
            sw.put_call_rel32(tramp.base as u32);
            sw.put_nop_n(patch_len - MIN_PATCH_LEN);
        }
        if let Err(e) = patch_code(site as *mut u8, patch_len, |p| {
            core::ptr::copy_nonoverlapping(stub.as_ptr(), p, patch_len);
        }) {
            let mut arena = CodeArena::global().lock().unwrap_or_else(|e| e.into_inner());
            arena.deallocate(tramp);
            return Err(e);
        }

        {
            let mut guard = self.inner.saved.lock().unwrap_or_else(|e| e.into_inner());
            guard.bytes = saved;
            guard.len = patch_len;
        }
        *self
            .inner
            .trampoline
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tramp);
        self.inner.installed.store(true, Ordering::SeqCst);
        info!(
            "installed hook at {:#x} ({} byte patch, {} args)",
            site, patch_len, inner.nargs
        );
        Ok(())
    }

    /// Unpatch the site, waiting out any in-flight dispatch.
    pub fn remove(&mut self) -> Result<()> {
        self.remove_timeout(DEFAULT_REMOVE_TIMEOUT)
    }

    pub fn remove_timeout(&mut self, timeout: Duration) -> Result<()> {
        if !self.inner.installed.load(Ordering::SeqCst) {
            return Err(InterceptError::NotInstalled);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.stage.compare_exchange(
                Stage::Idle as u8,
                Stage::Removing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(cur) => {
                    let cur = Stage::from_u8(cur);
                    if !matches!(cur, Stage::Before | Stage::After) {
                        return Err(InterceptError::BadStage(cur));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(InterceptError::RemoveTimeout);
                    }
                    let guard = self
                        .inner
                        .stage_lock
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    // Re-check under the lock; the notify may have landed
                    // between the failed exchange and here.
                    if Stage::from_u8(self.inner.stage.load(Ordering::SeqCst)) == Stage::Idle {
                        continue;
                    }
                    let _ = self
                        .inner
                        .stage_cv
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }

        let res = unsafe { self.remove_inner() };
        self.inner.stage.store(Stage::Idle as u8, Ordering::SeqCst);
        res
    }

    unsafe fn remove_inner(&mut self) -> Result<()> {
        let site = self.inner.target;
        let (saved_bytes, saved_len) = {
            let guard = self.inner.saved.lock().unwrap_or_else(|e| e.into_inner());
            (guard.bytes, guard.len)
        };
        let tramp = self
            .inner
            .trampoline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(InterceptError::NotInstalled)?;

        let head: [u8; 5] = read_code(site as *const u8);
        let rel = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
        let intact = head[0] == 0xE8 && dest_addr(site as u32, rel, 5) == tramp.base as u32;

        if intact {
            patch_code(site as *mut u8, saved_len, |p| {
                core::ptr::copy_nonoverlapping(saved_bytes.as_ptr(), p, saved_len);
            })?;
            let mut arena = CodeArena::global().lock().unwrap_or_else(|e| e.into_inner());
            arena.deallocate(tramp);
            info!("removed hook at {:#x}", site);
        } else {
            // Another patch landed on top of ours; restoring our bytes
            // would clobber it. Rewrite our trampoline in place into a
            // passthrough that replays the displaced instruction, and leak
            // the allocation since foreign code now flows through it.
            warn!(
                "patch site {:#x} drifted (lead {:#04x}); leaving passthrough trampoline",
                site, head[0]
            );
            let cells: &'static mut [u32; 2] = Box::leak(Box::new([0, 0]));
            emit_passthrough(tramp, site as u32, &saved_bytes[..saved_len], cells);
        }

        self.inner.installed.store(false, Ordering::SeqCst);
        Ok(())
    }

    #[cfg(test)]
    fn inner_raw(&self) -> *mut HookInner {
        (&**self.inner) as *const HookInner as *mut HookInner
    }

    #[cfg(test)]
    fn trampoline_region(&self) -> Option<Region> {
        *self
            .inner
            .trampoline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        let mut leak = false;
        if self.inner.installed.load(Ordering::SeqCst) {
            if let Err(e) = self.remove_timeout(DEFAULT_REMOVE_TIMEOUT) {
                // Generated code may still reference the shared state, so
                // freeing it would turn a stuck hook into a crash.
                warn!(
                    "hook at {:#x} could not be removed on drop ({e}); leaking its state",
                    self.inner.target
                );
                leak = true;
            }
        }
        if !leak {
            unsafe { ManuallyDrop::drop(&mut self.inner) }
        }
    }
}

/// Emission target for trampoline fragments: an arena region that doubles
/// in place when the next fragment may not fit.
struct TrampolineBuffer<'a> {
    arena: &'a mut CodeArena,
    region: Region,
    used: usize,
}

impl TrampolineBuffer<'_> {
    /// Run one emission fragment with at least `worst` bytes of room,
    /// growing the region first when needed. Emitted bytes never move.
    unsafe fn fragment<R>(
        &mut self,
        worst: usize,
        f: impl FnOnce(&mut X86Writer) -> R,
    ) -> Result<R> {
        while self.region.len - self.used < worst {
            let doubled = self.region.len * 2;
            if !self.arena.reallocate(&mut self.region, doubled) {
                return Err(InterceptError::TrampolineExhausted);
            }
        }
        let mut w = X86Writer::new(
            self.region.base.add(self.used),
            self.region.len - self.used,
            (self.region.base as usize + self.used) as u32,
        );
        let out = f(&mut w);
        self.used += w.offset();
        Ok(out)
    }
}

/// Emit the full trampoline for `inner`, fragment by fragment.
///
/// Entered via the patch-site `call`, so the return address sits on top of
/// the interrupted stack.
unsafe fn emit_trampoline(
    buf: &mut TrampolineBuffer<'_>,
    inner: &HookInner,
    saved: &[u8],
) -> Result<()> {
    let slots = inner.slots.get();
    let cpu = core::ptr::addr_of_mut!((*slots).cpu);
    let reg_addr = |off: usize| (cpu as usize + off) as u32;
    let eax_a = reg_addr(core::mem::offset_of!(CpuContext, eax));
    let esp_a = reg_addr(core::mem::offset_of!(CpuContext, esp));
    let eflags_a = reg_addr(core::mem::offset_of!(CpuContext, eflags));
    let ret_a = (slots as usize + core::mem::offset_of!(HookSlots, ret_addr)) as u32;
    let inner_a = inner as *const HookInner as usize as u32;
    let scratch_top =
        ((inner.scratch.as_ptr() as usize + inner.scratch.len()) & !0xF) as u32;
    let site = inner.target as u32;

    let gp_regs = [
        (Reg::ECX, core::mem::offset_of!(CpuContext, ecx)),
        (Reg::EDX, core::mem::offset_of!(CpuContext, edx)),
        (Reg::EBX, core::mem::offset_of!(CpuContext, ebx)),
        (Reg::ESP, core::mem::offset_of!(CpuContext, esp)),
        (Reg::EBP, core::mem::offset_of!(CpuContext, ebp)),
        (Reg::ESI, core::mem::offset_of!(CpuContext, esi)),
        (Reg::EDI, core::mem::offset_of!(CpuContext, edi)),
    ];

    // ── Entry capture: eax first, then the call's return address ──
    buf.fragment(CAPTURE_MAX, |w| {
        w.put_store_reg_abs(eax_a, Reg::EAX);
        w.put_pop_reg(Reg::EAX);
        w.put_store_reg_abs(ret_a, Reg::EAX);
        for (reg, off) in gp_regs {
            w.put_store_reg_abs(reg_addr(off), reg);
        }
        if inner.opts.collect_flags {
            w.put_pushfd();
            w.put_pop_reg(Reg::EAX);
            w.put_store_reg_abs(eflags_a, Reg::EAX);
        }
        if inner.opts.scratch_stack {
            w.put_mov_reg_imm32(Reg::ESP, scratch_top);
        }
    })?;

    // ── Before-stage dispatch ──
    buf.fragment(dispatch_max(inner.nargs), |w| {
        emit_dispatch(
            w,
            inner_a,
            esp_a,
            inner.nargs,
            inner.opts.stack_offset_before,
            before_thunk as usize as u32,
        );
    })?;

    // ── Skip branch: nonzero verdict bypasses the replay ──
    let (jnz_patch, jnz_pc) = buf.fragment(BRANCH_MAX, |w| {
        w.put_test_reg_reg(Reg::EAX, Reg::EAX);
        let patch = w.code_ptr();
        let pc = w.pc();
        w.put_bytes(&[0x0F, 0x85, 0x00, 0x00, 0x00, 0x00]);
        (patch, pc)
    })?;

    // ── Restore and replay the displaced instruction ──
    buf.fragment(RESTORE_MAX + MAX_PATCH_LEN, |w| {
        emit_restore(w, inner, &gp_regs, reg_addr, eax_a, esp_a, eflags_a);
        let mut replay = [0u8; MAX_PATCH_LEN];
        replay[..saved.len()].copy_from_slice(saved);
        rewrite_leading_branch(&mut replay[..saved.len()], site, w.pc());
        w.put_bytes(&replay[..saved.len()]);
    })?;

    // ── Re-capture for the after-stage ──
    buf.fragment(CAPTURE_MAX, |w| {
        w.put_store_reg_abs(eax_a, Reg::EAX);
        for (reg, off) in gp_regs {
            w.put_store_reg_abs(reg_addr(off), reg);
        }
        if inner.opts.collect_flags {
            w.put_pushfd();
            w.put_pop_reg(Reg::EAX);
            w.put_store_reg_abs(eflags_a, Reg::EAX);
        }
        if inner.opts.scratch_stack {
            w.put_mov_reg_imm32(Reg::ESP, scratch_top);
        }
    })?;

    // The skip branch joins here: registers still hold the before-stage
    // snapshot and the dispatch stack is already active. The fixup reaches
    // back into already-emitted bytes, which in-place growth never moves.
    {
        let skip_pc = (buf.region.base as usize + buf.used) as u32;
        let rel = skip_pc.wrapping_sub(jnz_pc.wrapping_add(6));
        (jnz_patch.add(2) as *mut i32).write_unaligned(rel as i32);
    }

    // ── After-stage dispatch ──
    buf.fragment(dispatch_max(inner.nargs), |w| {
        emit_dispatch(
            w,
            inner_a,
            esp_a,
            inner.nargs,
            inner.opts.stack_offset_after,
            after_thunk as usize as u32,
        );
    })?;

    // ── Final restore and resume ──
    buf.fragment(RESTORE_MAX + RESUME_MAX, |w| {
        emit_restore(w, inner, &gp_regs, reg_addr, eax_a, esp_a, eflags_a);
        w.put_load_reg_abs(Reg::EAX, ret_a);
        w.put_push_reg(Reg::EAX);
        w.put_load_reg_abs(Reg::EAX, eax_a);
        w.put_ret();
    })?;

    Ok(())
}

/// Push the argument-word pointers, then call
/// `thunk(inner, argv)` (cdecl) and drop the whole block.
unsafe fn emit_dispatch(
    w: &mut X86Writer,
    inner_a: u32,
    esp_a: u32,
    nargs: usize,
    stack_offset: u32,
    thunk: u32,
) {
    // argv[k] = captured_esp + stack_offset + 4k, pushed right-to-left so
    // the array reads in argument order.
    for k in (0..nargs).rev() {
        w.put_load_reg_abs(Reg::EDX, esp_a);
        let off = stack_offset + 4 * k as u32;
        if off != 0 {
            w.put_add_reg_imm32(Reg::EDX, off);
        }
        w.put_push_reg(Reg::EDX);
    }
    w.put_mov_reg_reg(Reg::EDX, Reg::ESP);
    w.put_push_reg(Reg::EDX);
    w.put_push_imm32(inner_a);
    w.put_call_rel32(thunk);
    let cleanup = 8 + 4 * nargs as u32;
    if cleanup <= i8::MAX as u32 {
        w.put_add_reg_imm8(Reg::ESP, cleanup as i8);
    } else {
        w.put_add_reg_imm32(Reg::ESP, cleanup);
    }
}

/// Reload the snapshot into the register file: flags first (still on the
/// dispatch stack), then ESP, then the rest, EAX last.
unsafe fn emit_restore(
    w: &mut X86Writer,
    inner: &HookInner,
    gp_regs: &[(Reg, usize)],
    reg_addr: impl Fn(usize) -> u32,
    eax_a: u32,
    esp_a: u32,
    eflags_a: u32,
) {
    if inner.opts.collect_flags {
        w.put_load_reg_abs(Reg::EAX, eflags_a);
        w.put_push_reg(Reg::EAX);
        w.put_popfd();
    }
    w.put_load_reg_abs(Reg::ESP, esp_a);
    for &(reg, off) in gp_regs {
        if reg == Reg::ESP {
            continue;
        }
        w.put_load_reg_abs(reg, reg_addr(off));
    }
    w.put_load_reg_abs(Reg::EAX, eax_a);
}

/// Rewrite a trampoline in place into a passthrough that only replays the
/// displaced instruction. Entered via `call` like the original trampoline;
/// EAX and the return address spill into the two leaked heap cells, kept
/// out of the allocation so every trampoline byte stays executable.
unsafe fn emit_passthrough(tramp: Region, site: u32, saved: &[u8], cells: &'static mut [u32; 2]) {
    let slot_eax = cells.as_mut_ptr() as usize as u32;
    let slot_ret = slot_eax.wrapping_add(4);

    let mut w = X86Writer::new(tramp.base, tramp.len, tramp.base as u32);
    w.put_store_reg_abs(slot_eax, Reg::EAX);
    w.put_pop_reg(Reg::EAX);
    w.put_store_reg_abs(slot_ret, Reg::EAX);
    w.put_load_reg_abs(Reg::EAX, slot_eax);

    let mut replay = [0u8; MAX_PATCH_LEN];
    replay[..saved.len()].copy_from_slice(saved);
    rewrite_leading_branch(&mut replay[..saved.len()], site, w.pc());
    w.put_bytes(&replay[..saved.len()]);

    w.put_store_reg_abs(slot_eax, Reg::EAX);
    w.put_load_reg_abs(Reg::EAX, slot_ret);
    w.put_push_reg(Reg::EAX);
    w.put_load_reg_abs(Reg::EAX, slot_eax);
    w.put_ret();
}
