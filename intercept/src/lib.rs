//! gantry-intercept: runtime function interception for ia32 targets.

pub mod arch;
pub mod code;
pub mod diag;
pub mod hook;
pub mod module;
pub mod types;

// Re-exports for convenience (flattened imports)
pub use code::{CodeArena, Region};
pub use hook::{Args, CallInfo, Callback, Hook, HookRef, InstallOptions};
pub use module::{enumerate_modules, find_module_base, find_module_by_name};
pub use types::{CpuContext, Eflags, InterceptError, ModuleInfo, Result, Stage};

/// Process-global lock for tests that modify executable code (hooks + patcher).
///
/// All tests that patch mapped code or touch the shared arena must hold this
/// lock to keep concurrent patching of the same pages from faulting.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
