//! x86-64 instruction encoding.
//!
//! Pure byte-level encoders over a [`CodeBuffer`]; operand selection and
//! pseudo-op expansion live in the emitter layer. Encodings follow the
//! System V AMD64 conventions used by the emitter's register mapping.

use crate::buffer::CodeBuffer;

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
    /// The register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// REX.B bit when used as base/rm.
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// REX.R bit when used as the reg field.
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }

    pub fn from_code(code: u8) -> Reg {
        match code {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            15 => Reg::R15,
            _ => unreachable!("register code out of range"),
        }
    }
}

/// SSE registers XMM0-XMM15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xmm(pub u8);

impl Xmm {
    pub fn code(self) -> u8 {
        self.0 & 0x7
    }

    pub fn rex_b(self) -> u8 {
        if self.0 >= 8 { 0x01 } else { 0x00 }
    }

    pub fn rex_r(self) -> u8 {
        if self.0 >= 8 { 0x04 } else { 0x00 }
    }
}

/// x86-64 condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// x86-64 assembler over a code buffer.
pub struct Asm<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Asm<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // ==================== prefix and ModR/M helpers ====================

    fn rex_w(&mut self, reg: Reg, rm: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    fn rex_w_single(&mut self, rm: Reg) {
        self.buf.emit_u8(0x48 | rm.rex_b());
    }

    fn rex_opt(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x40 | reg.rex_r() | rm.rex_b();
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// ModR/M + SIB + displacement for a `[base + disp]` operand.
    /// RSP/R12 as base require a SIB byte; RBP/R13 have no disp-free form.
    fn mem_operand(&mut self, reg_field: u8, base: Reg, disp: i32) {
        let needs_sib = base.code() == 0b100;
        let force_disp = base.code() == 0b101;
        if disp == 0 && !force_disp {
            self.buf.emit_u8(Self::modrm(0b00, reg_field, base.code()));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.buf.emit_u8(Self::modrm(0b01, reg_field, base.code()));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u8(Self::modrm(0b10, reg_field, base.code()));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u32(disp as u32);
        }
    }

    // ==================== moves ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    // ==================== loads and stores ====================

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x8B);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOV r32, [base + disp] (zero-extends into the full register)
    pub fn mov32_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_opt(dst, base);
        self.buf.emit_u8(0x8B);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOVSXD r64, [base + disp] (sign-extend 32-bit load)
    pub fn movsxd_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x63);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOVZX r64, byte [base + disp]
    pub fn movzx8_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOVSX r64, byte [base + disp]
    pub fn movsx8_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOVZX r64, word [base + disp]
    pub fn movzx16_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOVSX r64, word [base + disp]
    pub fn movsx16_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_w(src, base);
        self.buf.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    /// MOV [base + disp], r32
    pub fn mov32_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_opt(src, base);
        self.buf.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    /// MOV [base + disp], r16
    pub fn mov16_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.buf.emit_u8(0x66);
        self.rex_opt(src, base);
        self.buf.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    /// MOV [base + disp], r8
    /// REX is always emitted so SPL/BPL/SIL/DIL encode instead of AH-DH.
    pub fn mov8_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.buf.emit_u8(0x40 | src.rex_r() | base.rex_b());
        self.buf.emit_u8(0x88);
        self.mem_operand(src.code(), base, disp);
    }

    // ==================== ALU ====================

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    fn alu_ri(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    pub fn add_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(0, dst, imm);
    }

    /// ADC r64, r64 (add with carry)
    pub fn adc_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x11, dst, src);
    }

    pub fn adc_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(2, dst, imm);
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    pub fn sub_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(5, dst, imm);
    }

    /// SBB r64, r64 (subtract with borrow)
    pub fn sbb_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x19, dst, src);
    }

    pub fn sbb_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(3, dst, imm);
    }

    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    pub fn and_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(4, dst, imm);
    }

    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    pub fn or_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(1, dst, imm);
    }

    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    pub fn xor_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(6, dst, imm);
    }

    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x39, dst, src);
    }

    pub fn cmp_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(7, dst, imm);
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// IMUL r64, r64, imm32
    pub fn imul_rri(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.rex_w(dst, src);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x6B);
            self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x69);
            self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IDIV r64 (RDX:RAX / r64 -> quotient RAX, remainder RDX)
    pub fn idiv_r(&mut self, src: Reg) {
        self.rex_w_single(src);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 7, src.code()));
    }

    /// CQO (sign-extend RAX into RDX:RAX)
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// NEG r64
    pub fn neg_r(&mut self, dst: Reg) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// NOT r64
    pub fn not_r(&mut self, dst: Reg) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 2, dst.code()));
    }

    // ==================== shifts ====================

    fn shift_ri(&mut self, ext: u8, dst: Reg, imm: u8) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
        self.buf.emit_u8(imm);
    }

    fn shift_cl(&mut self, ext: u8, dst: Reg) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
    }

    pub fn shl_ri(&mut self, dst: Reg, imm: u8) {
        self.shift_ri(4, dst, imm);
    }

    pub fn shr_ri(&mut self, dst: Reg, imm: u8) {
        self.shift_ri(5, dst, imm);
    }

    pub fn sar_ri(&mut self, dst: Reg, imm: u8) {
        self.shift_ri(7, dst, imm);
    }

    pub fn shl_cl(&mut self, dst: Reg) {
        self.shift_cl(4, dst);
    }

    pub fn shr_cl(&mut self, dst: Reg) {
        self.shift_cl(5, dst);
    }

    pub fn sar_cl(&mut self, dst: Reg) {
        self.shift_cl(7, dst);
    }

    // ==================== stack ====================

    pub fn push_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== control flow ====================

    /// JMP rel8
    pub fn jmp_rel8(&mut self, disp: i8) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_u8(disp as u8);
    }

    /// JMP rel32
    pub fn jmp_rel32(&mut self, disp: i32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(disp as u32);
    }

    /// Opcode byte of JMP rel32, for patchable emission.
    pub fn jmp_op(&mut self) {
        self.buf.emit_u8(0xE9);
    }

    /// Jcc rel8
    pub fn jcc_rel8(&mut self, cc: Cc, disp: i8) {
        self.buf.emit_u8(0x70 + cc as u8);
        self.buf.emit_u8(disp as u8);
    }

    /// Jcc rel32
    pub fn jcc_rel32(&mut self, cc: Cc, disp: i32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cc as u8);
        self.buf.emit_u32(disp as u32);
    }

    /// Opcode bytes of Jcc rel32, for patchable emission.
    pub fn jcc_op(&mut self, cc: Cc) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cc as u8);
    }

    /// CALL rel32
    pub fn call_rel32(&mut self, disp: i32) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_u32(disp as u32);
    }

    /// Opcode byte of CALL rel32, for patchable emission.
    pub fn call_op(&mut self) {
        self.buf.emit_u8(0xE8);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    // ==================== SSE scalar float ====================

    fn sse_rr(&mut self, prefix: u8, opcode: u8, reg: Xmm, rm: Xmm) {
        self.buf.emit_u8(prefix);
        let rex = 0x40 | reg.rex_r() | rm.rex_b();
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg.code(), rm.code()));
    }

    fn sse_rm(&mut self, prefix: u8, opcode: u8, x: Xmm, base: Reg, disp: i32) {
        self.buf.emit_u8(prefix);
        let rex = 0x40 | x.rex_r() | base.rex_b();
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.mem_operand(x.code(), base, disp);
    }

    /// MOVSS xmm, xmm
    pub fn movss_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF3, 0x10, dst, src);
    }

    /// MOVSD xmm, xmm
    pub fn movsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x10, dst, src);
    }

    /// MOVSS xmm, dword [base + disp]
    pub fn movss_load(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.sse_rm(0xF3, 0x10, dst, base, disp);
    }

    /// MOVSS dword [base + disp], xmm
    pub fn movss_store(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.sse_rm(0xF3, 0x11, src, base, disp);
    }

    /// MOVSD xmm, qword [base + disp]
    pub fn movsd_load(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.sse_rm(0xF2, 0x10, dst, base, disp);
    }

    /// MOVSD qword [base + disp], xmm
    pub fn movsd_store(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.sse_rm(0xF2, 0x11, src, base, disp);
    }

    pub fn addss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF3, 0x58, dst, src);
    }

    pub fn subss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF3, 0x5C, dst, src);
    }

    pub fn mulss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF3, 0x59, dst, src);
    }

    pub fn divss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF3, 0x5E, dst, src);
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x58, dst, src);
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5C, dst, src);
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x59, dst, src);
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5E, dst, src);
    }

    /// MOVQ xmm, r64
    pub fn movq_xmm_r(&mut self, dst: Xmm, src: Reg) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x48 | dst.rex_r() | src.rex_b());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVQ r64, xmm
    pub fn movq_r_xmm(&mut self, dst: Reg, src: Xmm) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x48 | src.rex_r() | dst.rex_b());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }
}
