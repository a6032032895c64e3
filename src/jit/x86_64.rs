//! x86-64 instruction encoding for JIT compilation.
//!
//! Only the instructions the baseline compiler needs. 64-bit forms carry
//! REX.W; the `*32` forms operate on the low dword and zero the upper half
//! of the destination, which is what re-tags a result as `INT` (tag 0).

use super::codebuf::{CodeBuffer, Label};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low three bits of the register number.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }

    fn rex_b(self) -> u8 {
        if self.is_extended() { 0x01 } else { 0x00 }
    }

    fn rex_r(self) -> u8 {
        if self.is_extended() { 0x04 } else { 0x00 }
    }
}

/// SSE register number (xmm0..xmm7).
pub type Xmm = u8;

/// x86-64 condition codes (for Jcc and SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    E = 0x4,
    Ne = 0x5,
    L = 0xC,
    Le = 0xE,
}

/// x86-64 assembler writing into a [`CodeBuffer`].
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    // ==================== Encoding helpers ====================

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// REX.W with `reg` in ModRM.reg and `rm` in ModRM.rm.
    fn rex_w(&mut self, reg: Reg, rm: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    /// REX without W, only when an extended register needs it.
    fn rex_opt(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x40 | reg.rex_r() | rm.rex_b();
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    /// ModRM (+ SIB + displacement) for `[base + disp]`.
    fn mem_operand(&mut self, reg: u8, base: Reg, disp: i32) {
        let needs_sib = base.code() == Reg::Rsp.code();
        // rbp/r13 with mod=00 means rip-relative, so they always take a disp.
        let (mode, disp_bytes) = if disp == 0 && base.code() != Reg::Rbp.code() {
            (0b00, 0)
        } else if (-128..=127).contains(&disp) {
            (0b01, 1)
        } else {
            (0b10, 4)
        };

        self.buf
            .emit_u8(Self::modrm(mode, reg, if needs_sib { 0b100 } else { base.code() }));
        if needs_sib {
            self.buf.emit_u8(0x24);
        }
        match disp_bytes {
            1 => self.buf.emit_u8(disp as u8),
            4 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// Register-register op in the `op r/m, r` direction.
    fn rr(&mut self, wide: bool, opcode: &[u8], dst: Reg, src: Reg) {
        if wide {
            self.rex_w(src, dst);
        } else {
            self.rex_opt(src, dst);
        }
        for &b in opcode {
            self.buf.emit_u8(b);
        }
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(true, &[0x89], dst, src);
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.buf.emit_u8(0x48 | dst.rex_b());
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x8B);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_w(src, base);
        self.buf.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    /// MOV r32, r32 (zero-extends)
    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.rr(false, &[0x89], dst, src);
    }

    // ==================== Integer Arithmetic ====================

    /// ADD r32, r32
    pub fn add_rr32(&mut self, dst: Reg, src: Reg) {
        self.rr(false, &[0x01], dst, src);
    }

    /// SUB r32, r32
    pub fn sub_rr32(&mut self, dst: Reg, src: Reg) {
        self.rr(false, &[0x29], dst, src);
    }

    /// IMUL r32, r32
    pub fn imul_rr32(&mut self, dst: Reg, src: Reg) {
        // 0F AF /r has the destination in ModRM.reg
        self.rex_opt(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CDQ (sign-extend EAX into EDX:EAX)
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// IDIV r32 (EDX:EAX / r32; quotient in EAX, remainder in EDX)
    pub fn idiv_r32(&mut self, src: Reg) {
        self.rex_opt(Reg::Rax, src);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 7, src.code()));
    }

    /// NEG r32
    pub fn neg_r32(&mut self, dst: Reg) {
        self.rex_opt(Reg::Rax, dst);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// XOR r32, r32
    pub fn xor_rr32(&mut self, dst: Reg, src: Reg) {
        self.rr(false, &[0x31], dst, src);
    }

    /// OR r64, r64
    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(true, &[0x09], dst, src);
    }

    /// SHR r64, imm8
    pub fn shr_ri(&mut self, dst: Reg, imm: u8) {
        self.buf.emit_u8(0x48 | dst.rex_b());
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
        self.buf.emit_u8(imm);
    }

    /// BTC r64, imm8 (complement one bit)
    pub fn btc_ri(&mut self, dst: Reg, bit: u8) {
        self.buf.emit_u8(0x48 | dst.rex_b());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBA);
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
        self.buf.emit_u8(bit);
    }

    // ==================== Comparison ====================

    /// CMP r32, r32
    pub fn cmp_rr32(&mut self, dst: Reg, src: Reg) {
        self.rr(false, &[0x39], dst, src);
    }

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.rr(true, &[0x39], dst, src);
    }

    /// CMP r32, imm8 (sign-extended)
    pub fn cmp_ri8_32(&mut self, dst: Reg, imm: i8) {
        self.rex_opt(Reg::Rax, dst);
        self.buf.emit_u8(0x83);
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
        self.buf.emit_u8(imm as u8);
    }

    /// TEST r32, r32
    pub fn test_rr32(&mut self, dst: Reg, src: Reg) {
        self.rr(false, &[0x85], dst, src);
    }

    /// SETcc r8. Only the legacy byte registers (al, cl, dl, bl) are accepted.
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        debug_assert!((dst as u8) < 4, "setcc needs a legacy byte register");
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    // ==================== Stack / Control Flow ====================

    pub fn push(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// JMP rel32 to a label
    pub fn jmp(&mut self, target: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_rel32(target);
    }

    /// Jcc rel32 to a label
    pub fn jcc(&mut self, cond: Cond, target: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_rel32(target);
    }

    // ==================== SSE Single Precision ====================

    /// MOVD xmm, r32
    pub fn movd_xmm_r32(&mut self, xmm: Xmm, src: Reg) {
        self.buf.emit_u8(0x66);
        if src.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, xmm, src.code()));
    }

    /// MOVD r32, xmm (zero-extends)
    pub fn movd_r32_xmm(&mut self, dst: Reg, xmm: Xmm) {
        self.buf.emit_u8(0x66);
        if dst.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, xmm, dst.code()));
    }

    fn sse_ss(&mut self, opcode: u8, dst: Xmm, src: Xmm) {
        self.buf.emit_u8(0xF3);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, dst, src));
    }

    /// ADDSS xmm, xmm
    pub fn addss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_ss(0x58, dst, src);
    }

    /// SUBSS xmm, xmm
    pub fn subss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_ss(0x5C, dst, src);
    }

    /// MULSS xmm, xmm
    pub fn mulss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_ss(0x59, dst, src);
    }

    /// DIVSS xmm, xmm
    pub fn divss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_ss(0x5E, dst, src);
    }
}
