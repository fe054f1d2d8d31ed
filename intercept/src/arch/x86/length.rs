use crate::types::{InterceptError, Result};

/// Detect the patch length from the leading opcode at a prospective site.
///
/// This is a closed table of the instruction shapes seen at supported call
/// sites, not a general decoder. Anything outside the table is an error and
/// the caller must pass an explicit length instead.
pub fn detect_patch_len(lead: u8) -> Result<usize> {
    match lead {
        // call/jmp rel32, moffs forms, test eax, mov r32 imm32, push imm32,
        // and the eax-form ALU imm32 group.
        0xE8 | 0xE9 | 0xA0 | 0xA1 | 0xA2 | 0xA3 | 0xA9 | 0xB8..=0xBF | 0x68 | 0x05 | 0x0D
        | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => Ok(5),
        // ModRM forms with a 4-byte operand, and 0F-prefixed jcc rel32.
        0x89 | 0x8B | 0x69 | 0x81 | 0xC7 | 0xF7 | 0x0F => Ok(6),
        // Far call/jmp ptr16:32.
        0xEA | 0x9A => Ok(7),
        other => Err(InterceptError::LengthNotDetectable(other)),
    }
}

/// rel32 operand for a branch at `from` reaching absolute `target`.
pub fn rel_addr(from: u32, target: u32, op_len: u32) -> u32 {
    target.wrapping_sub(from).wrapping_sub(op_len)
}

/// Absolute destination of a branch at `from` carrying `rel`.
pub fn dest_addr(from: u32, rel: u32, op_len: u32) -> u32 {
    from.wrapping_add(rel).wrapping_add(op_len)
}

/// Location of the rel32 operand in a relocatable leading instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadingBranch {
    /// Byte offset of the rel32 within the instruction.
    pub disp_off: usize,
    /// Total instruction length.
    pub op_len: u32,
}

/// Identify a leading instruction whose rel32 must be rewritten when the
/// bytes execute at a different address. Only near call/jmp and the
/// two-byte jcc forms are position-dependent among the supported shapes.
pub fn leading_branch(code: &[u8]) -> Option<LeadingBranch> {
    match code.first()? {
        0xE8 | 0xE9 => Some(LeadingBranch { disp_off: 1, op_len: 5 }),
        0x0F if matches!(code.get(1)?, 0x80..=0x8F) => {
            Some(LeadingBranch { disp_off: 2, op_len: 6 })
        }
        _ => None,
    }
}

/// Rewrite the rel32 of a leading branch so the copied bytes still reach
/// their original destination when executed at `new_pc` instead of
/// `old_pc`. Returns false when the bytes need no rewrite.
pub fn rewrite_leading_branch(code: &mut [u8], old_pc: u32, new_pc: u32) -> bool {
    let Some(branch) = leading_branch(code) else {
        return false;
    };
    let off = branch.disp_off;
    let rel = u32::from_le_bytes([code[off], code[off + 1], code[off + 2], code[off + 3]]);
    let dest = dest_addr(old_pc, rel, branch.op_len);
    let new_rel = rel_addr(new_pc, dest, branch.op_len);
    code[off..off + 4].copy_from_slice(&new_rel.to_le_bytes());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_classifies_known_opcodes() {
        for lead in [0xE8u8, 0xE9, 0xA1, 0xA3, 0xB8, 0xBF, 0x68, 0x3D] {
            assert_eq!(detect_patch_len(lead).unwrap(), 5, "lead {lead:#04x}");
        }
        for lead in [0x89u8, 0x8B, 0x69, 0x81, 0xC7, 0xF7, 0x0F] {
            assert_eq!(detect_patch_len(lead).unwrap(), 6, "lead {lead:#04x}");
        }
        for lead in [0xEAu8, 0x9A] {
            assert_eq!(detect_patch_len(lead).unwrap(), 7, "lead {lead:#04x}");
        }
    }

    #[test]
    fn table_rejects_unknown_opcodes() {
        assert_eq!(
            detect_patch_len(0x55),
            Err(InterceptError::LengthNotDetectable(0x55))
        );
        assert_eq!(
            detect_patch_len(0xFF),
            Err(InterceptError::LengthNotDetectable(0xFF))
        );
    }

    #[test]
    fn rel_and_dest_are_inverse() {
        let from = 0x0074_8DA3u32;
        let target = 0x0040_1000u32;
        let rel = rel_addr(from, target, 5);
        assert_eq!(dest_addr(from, rel, 5), target);
    }

    #[test]
    fn rel_wraps_across_address_space() {
        let rel = rel_addr(0xFFFF_FF00, 0x10, 5);
        assert_eq!(dest_addr(0xFFFF_FF00, rel, 5), 0x10);
    }

    #[test]
    fn rewrites_call_rel32() {
        // call +0x100 at old_pc=0x1000 → dest 0x1105
        let mut code = [0xE8, 0x00, 0x01, 0x00, 0x00];
        assert!(rewrite_leading_branch(&mut code, 0x1000, 0x5000));
        let rel = u32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(dest_addr(0x5000, rel, 5), 0x1105);
    }

    #[test]
    fn rewrites_two_byte_jcc() {
        // jz +0x20 at old_pc=0x2000 → dest 0x2026
        let mut code = [0x0F, 0x84, 0x20, 0x00, 0x00, 0x00];
        assert!(rewrite_leading_branch(&mut code, 0x2000, 0x3000));
        let rel = u32::from_le_bytes(code[2..6].try_into().unwrap());
        assert_eq!(dest_addr(0x3000, rel, 6), 0x2026);
    }

    #[test]
    fn position_independent_bytes_are_untouched() {
        let mut code = [0xA3, 0x00, 0x10, 0x40, 0x00];
        let before = code;
        assert!(!rewrite_leading_branch(&mut code, 0x1000, 0x2000));
        assert_eq!(code, before);
    }

    #[test]
    fn non_jcc_0f_is_not_a_branch() {
        // 0F AF /r (imul) detects as 6 bytes but carries no rel32.
        assert_eq!(leading_branch(&[0x0F, 0xAF, 0xC2]), None);
    }
}
