use bitflags::bitflags;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, InterceptError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterceptError {
    #[error("executable memory allocation failed")]
    AllocationFailed,

    #[error("memory protection change failed at 0x{0:x}")]
    ProtectionFailed(usize),

    #[error("patch length not detectable from leading opcode 0x{0:02x}")]
    LengthNotDetectable(u8),

    #[error("module \"{0}\" is not loaded")]
    ModuleNotFound(String),

    #[error("hook is busy: stage {0:?} does not allow this transition")]
    BadStage(Stage),

    #[error("remove timed out waiting for in-flight dispatch")]
    RemoveTimeout,

    #[error("trampoline buffer exhausted and in-place growth failed")]
    TrampolineExhausted,

    #[error("hook is already installed")]
    AlreadyInstalled,

    #[error("hook is not installed")]
    NotInstalled,
}

/// Hook lifecycle stage. Stored in an `AtomicU8` inside the hook; the
/// `Before`/`After` values mark an in-flight dispatch that `remove()`
/// must wait out before unpatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    Installing = 1,
    Before = 2,
    After = 3,
    Removing = 4,
}

impl Stage {
    pub(crate) fn from_u8(v: u8) -> Stage {
        match v {
            1 => Stage::Installing,
            2 => Stage::Before,
            3 => Stage::After,
            4 => Stage::Removing,
            _ => Stage::Idle,
        }
    }
}

bitflags! {
    /// Decomposed EFLAGS register. `IOPL` is a two-bit field, exposed as
    /// two single-bit flags so a raw store from generated code round-trips
    /// exactly.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Eflags: u32 {
        const CF    = 1 << 0;
        const PF    = 1 << 2;
        const AF    = 1 << 4;
        const ZF    = 1 << 6;
        const SF    = 1 << 7;
        const TF    = 1 << 8;
        const IF    = 1 << 9;
        const DF    = 1 << 10;
        const OF    = 1 << 11;
        const IOPL0 = 1 << 12;
        const IOPL1 = 1 << 13;
        const NT    = 1 << 14;
        const RF    = 1 << 16;
        const VM    = 1 << 17;
        const AC    = 1 << 18;
        const VIF   = 1 << 19;
        const VIP   = 1 << 20;
        const ID    = 1 << 21;

        // Reserved bits must survive a store/reload cycle untouched.
        const _ = !0;
    }
}

/// Snapshot of the interrupted x86 register file.
///
/// Generated code stores every register into this structure on entry and
/// reloads from it before resuming, so a field mutated by a callback takes
/// effect on the resumed execution path. The layout is `#[repr(C)]` because
/// the trampoline embeds the absolute address of each field as an imm32.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuContext {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eflags: Eflags,
}

/// A loaded module, as reported by the dynamic linker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}
