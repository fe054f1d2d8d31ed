#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    EAX = 0,
    ECX = 1,
    EDX = 2,
    EBX = 3,
    ESP = 4,
    EBP = 5,
    ESI = 6,
    EDI = 7,
}

impl Reg {
    #[inline]
    fn enc(self) -> u8 {
        self as u8
    }
}

/// Emits ia32 machine code into a caller-provided buffer.
///
/// `pc` tracks the virtual address the next byte will execute at, which can
/// differ from the buffer address when encoding for another location. All
/// relative branches are computed against `pc`, and absolute operands are
/// plain imm32 values since the whole address space fits in 32 bits.
#[derive(Debug)]
pub struct X86Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u32,
    size: usize,
}

impl X86Writer {
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u32) -> Self {
        Self {
            base: buffer,
            code: buffer,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    pub fn code_ptr(&self) -> *mut u8 {
        self.code
    }

    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.offset())
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    unsafe fn emit(&mut self, byte: u8) {
        debug_assert!(self.can_write(1));
        self.code.write(byte);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    unsafe fn emit_u32_le(&mut self, val: u32) {
        debug_assert!(self.can_write(4));
        (self.code as *mut u32).write_unaligned(val);
        self.code = self.code.add(4);
        self.pc = self.pc.wrapping_add(4);
    }

    /// ModRM byte: mod(2) | reg(3) | rm(3)
    #[inline]
    fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
        ((mod_ & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    // ── Push / Pop ───────────────────────────────────────────────────

    /// `push reg` — 50+rd
    pub unsafe fn put_push_reg(&mut self, reg: Reg) {
        self.emit(0x50 + reg.enc());
    }

    /// `pop reg` — 58+rd
    pub unsafe fn put_pop_reg(&mut self, reg: Reg) {
        self.emit(0x58 + reg.enc());
    }

    /// `push imm32` — 68 id
    pub unsafe fn put_push_imm32(&mut self, imm: u32) {
        self.emit(0x68);
        self.emit_u32_le(imm);
    }

    // ── MOV ──────────────────────────────────────────────────────────

    /// `mov reg, imm32` — B8+rd id
    pub unsafe fn put_mov_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(0xB8 + reg.enc());
        self.emit_u32_le(imm);
    }

    /// `mov dst, src` — 89 ModRM (mod=11)
    pub unsafe fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(0x89);
        self.emit(Self::modrm(0b11, src.enc(), dst.enc()));
    }

    /// `mov [moffs32], eax` / `mov [disp32], reg`.
    ///
    /// EAX gets the short moffs form (A3), the rest use 89 /r with
    /// mod=00 rm=101 absolute addressing.
    pub unsafe fn put_store_reg_abs(&mut self, addr: u32, src: Reg) {
        if src == Reg::EAX {
            self.emit(0xA3);
        } else {
            self.emit(0x89);
            self.emit(Self::modrm(0b00, src.enc(), 0b101));
        }
        self.emit_u32_le(addr);
    }

    /// `mov eax, [moffs32]` / `mov reg, [disp32]`.
    pub unsafe fn put_load_reg_abs(&mut self, dst: Reg, addr: u32) {
        if dst == Reg::EAX {
            self.emit(0xA1);
        } else {
            self.emit(0x8B);
            self.emit(Self::modrm(0b00, dst.enc(), 0b101));
        }
        self.emit_u32_le(addr);
    }

    // ── Arithmetic ───────────────────────────────────────────────────

    /// `add reg, imm32` — 81 /0 id
    pub unsafe fn put_add_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(0x81);
        self.emit(Self::modrm(0b11, 0, reg.enc()));
        self.emit_u32_le(imm);
    }

    /// `add reg, imm8` — 83 /0 ib (sign-extended)
    pub unsafe fn put_add_reg_imm8(&mut self, reg: Reg, imm: i8) {
        self.emit(0x83);
        self.emit(Self::modrm(0b11, 0, reg.enc()));
        self.emit(imm as u8);
    }

    /// `test r1, r2` — 85 ModRM (mod=11)
    pub unsafe fn put_test_reg_reg(&mut self, r1: Reg, r2: Reg) {
        self.emit(0x85);
        self.emit(Self::modrm(0b11, r2.enc(), r1.enc()));
    }

    // ── Branches / Calls ─────────────────────────────────────────────

    /// `call rel32` — E8 cd. `target` is an absolute address.
    pub unsafe fn put_call_rel32(&mut self, target: u32) {
        self.emit(0xE8);
        let rel = target.wrapping_sub(self.pc.wrapping_add(4));
        self.emit_u32_le(rel);
    }

    /// `jmp rel32` — E9 cd. `target` is an absolute address.
    pub unsafe fn put_jmp_rel32(&mut self, target: u32) {
        self.emit(0xE9);
        let rel = target.wrapping_sub(self.pc.wrapping_add(4));
        self.emit_u32_le(rel);
    }

    /// `jnz rel32` — 0F 85 cd. `target` is an absolute address.
    pub unsafe fn put_jnz_rel32(&mut self, target: u32) {
        self.emit(0x0F);
        self.emit(0x85);
        let rel = target.wrapping_sub(self.pc.wrapping_add(4));
        self.emit_u32_le(rel);
    }

    // ── Misc ─────────────────────────────────────────────────────────

    /// `ret` — C3
    pub unsafe fn put_ret(&mut self) {
        self.emit(0xC3);
    }

    /// `pushfd` — 9C
    pub unsafe fn put_pushfd(&mut self) {
        self.emit(0x9C);
    }

    /// `popfd` — 9D
    pub unsafe fn put_popfd(&mut self) {
        self.emit(0x9D);
    }

    /// `nop` — 90
    pub unsafe fn put_nop(&mut self) {
        self.emit(0x90);
    }

    /// Single-byte NOP padding.
    ///
    /// Patch-site padding stays single-byte so a thread resumed mid-pad
    /// after a remove still lands on a valid instruction.
    pub unsafe fn put_nop_n(&mut self, n: usize) {
        for _ in 0..n {
            self.emit(0x90);
        }
    }

    /// Emit raw bytes.
    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.can_write(bytes.len()));
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
        self.code = self.code.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len() as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86Writer)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86Writer::new(buf.as_mut_ptr(), buf.len(), 0x1000);
            f(&mut w);
            buf[..w.offset()].to_vec()
        }
    }

    fn encode_at(pc: u32, f: impl FnOnce(&mut X86Writer)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86Writer::new(buf.as_mut_ptr(), buf.len(), pc);
            f(&mut w);
            buf[..w.offset()].to_vec()
        }
    }

    #[test]
    fn push_pop_regs() {
        assert_eq!(encode(|w| unsafe { w.put_push_reg(Reg::EAX) }), &[0x50]);
        assert_eq!(encode(|w| unsafe { w.put_push_reg(Reg::EDX) }), &[0x52]);
        assert_eq!(encode(|w| unsafe { w.put_pop_reg(Reg::EAX) }), &[0x58]);
        assert_eq!(encode(|w| unsafe { w.put_pop_reg(Reg::EDI) }), &[0x5F]);
    }

    #[test]
    fn push_imm32() {
        let bytes = encode(|w| unsafe { w.put_push_imm32(0xDEADBEEF) });
        assert_eq!(bytes, &[0x68, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn mov_reg_imm32() {
        // mov esp, imm32 — BC id
        let bytes = encode(|w| unsafe { w.put_mov_reg_imm32(Reg::ESP, 0x11223344) });
        assert_eq!(bytes, &[0xBC, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn mov_reg_reg() {
        // mov edx, esp — 89 E2 (mod=11, reg=esp(4), rm=edx(2))
        let bytes = encode(|w| unsafe { w.put_mov_reg_reg(Reg::EDX, Reg::ESP) });
        assert_eq!(bytes, &[0x89, 0xE2]);
    }

    #[test]
    fn store_eax_uses_moffs_form() {
        let bytes = encode(|w| unsafe { w.put_store_reg_abs(0x00401000, Reg::EAX) });
        assert_eq!(bytes, &[0xA3, 0x00, 0x10, 0x40, 0x00]);
    }

    #[test]
    fn store_other_regs_use_modrm_abs() {
        // mov [0x00401000], ecx — 89 0D disp32
        let bytes = encode(|w| unsafe { w.put_store_reg_abs(0x00401000, Reg::ECX) });
        assert_eq!(bytes, &[0x89, 0x0D, 0x00, 0x10, 0x40, 0x00]);
        // mov [0x00401000], edi — 89 3D disp32
        let bytes = encode(|w| unsafe { w.put_store_reg_abs(0x00401000, Reg::EDI) });
        assert_eq!(bytes, &[0x89, 0x3D, 0x00, 0x10, 0x40, 0x00]);
    }

    #[test]
    fn load_eax_uses_moffs_form() {
        let bytes = encode(|w| unsafe { w.put_load_reg_abs(Reg::EAX, 0x00401000) });
        assert_eq!(bytes, &[0xA1, 0x00, 0x10, 0x40, 0x00]);
    }

    #[test]
    fn load_other_regs_use_modrm_abs() {
        // mov esi, [0x00401000] — 8B 35 disp32
        let bytes = encode(|w| unsafe { w.put_load_reg_abs(Reg::ESI, 0x00401000) });
        assert_eq!(bytes, &[0x8B, 0x35, 0x00, 0x10, 0x40, 0x00]);
    }

    #[test]
    fn add_reg_imm() {
        // add edx, 0x10 — 81 C2 id
        let bytes = encode(|w| unsafe { w.put_add_reg_imm32(Reg::EDX, 0x10) });
        assert_eq!(bytes, &[0x81, 0xC2, 0x10, 0x00, 0x00, 0x00]);
        // add esp, 12 — 83 C4 0C
        let bytes = encode(|w| unsafe { w.put_add_reg_imm8(Reg::ESP, 12) });
        assert_eq!(bytes, &[0x83, 0xC4, 0x0C]);
    }

    #[test]
    fn test_eax_eax() {
        let bytes = encode(|w| unsafe { w.put_test_reg_reg(Reg::EAX, Reg::EAX) });
        assert_eq!(bytes, &[0x85, 0xC0]);
    }

    #[test]
    fn call_rel32() {
        // From pc=0x1000, target 0x2000: rel = 0x2000 - 0x1005 = 0xFFB
        let bytes = encode_at(0x1000, |w| unsafe { w.put_call_rel32(0x2000) });
        assert_eq!(bytes[0], 0xE8);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0xFFB);
    }

    #[test]
    fn jmp_rel32_backward() {
        // From pc=0x2000, target 0x1000: rel = 0x1000 - 0x2005
        let bytes = encode_at(0x2000, |w| unsafe { w.put_jmp_rel32(0x1000) });
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), -0x1005);
    }

    #[test]
    fn jnz_rel32() {
        let bytes = encode_at(0x1000, |w| unsafe { w.put_jnz_rel32(0x1100) });
        assert_eq!(&bytes[..2], &[0x0F, 0x85]);
        assert_eq!(i32::from_le_bytes(bytes[2..6].try_into().unwrap()), 0xFA);
    }

    #[test]
    fn ret_pushfd_popfd_nop() {
        assert_eq!(encode(|w| unsafe { w.put_ret() }), &[0xC3]);
        assert_eq!(encode(|w| unsafe { w.put_pushfd() }), &[0x9C]);
        assert_eq!(encode(|w| unsafe { w.put_popfd() }), &[0x9D]);
        assert_eq!(encode(|w| unsafe { w.put_nop() }), &[0x90]);
    }

    #[test]
    fn nop_padding_is_single_byte() {
        let bytes = encode(|w| unsafe { w.put_nop_n(7) });
        assert_eq!(bytes, &[0x90; 7]);
    }

    #[test]
    fn cursor_accessors_advance_in_step() {
        let mut buf = [0u8; 16];
        unsafe {
            let mut w = X86Writer::new(buf.as_mut_ptr(), buf.len(), 0x2000);
            w.put_push_imm32(0x1234);
            assert_eq!(w.offset(), 5);
            assert_eq!(w.remaining(), 11);
            assert_eq!(w.pc(), 0x2005);
            assert_eq!(w.code_ptr(), buf.as_mut_ptr().add(5));
        }
    }

    #[test]
    fn pc_wraps_at_address_space_end() {
        let bytes = encode_at(0xFFFF_FFFE, |w| unsafe { w.put_call_rel32(0x10) });
        assert_eq!(bytes[0], 0xE8);
        // rel = 0x10 - (0xFFFFFFFE + 5) wrapping
        assert_eq!(
            u32::from_le_bytes(bytes[1..5].try_into().unwrap()),
            0x10u32.wrapping_sub(0x0000_0003)
        );
    }
}
