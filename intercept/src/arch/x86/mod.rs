pub mod length;
pub mod writer;

pub use length::{detect_patch_len, dest_addr, rel_addr};
pub use writer::{Reg, X86Writer};
