pub mod arena;
pub mod cache;
pub mod patcher;

pub use arena::{CodeArena, Region};
pub use patcher::patch_code;
