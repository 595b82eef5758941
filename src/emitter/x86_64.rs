//! x86-64 realization of the emission API.
//!
//! Logical registers are mapped to physical encodings here and nowhere
//! else. Each operation picks the cheapest encoding for its operand
//! values and synthesizes multi-instruction sequences where x86-64 has
//! no single form (64-bit immediates, fixed-register divides and shifts,
//! three-operand shapes over two-operand instructions).

use crate::abi::{AbiParam, ArgLoc, CallConv, MoveOp, PlannedMove, sequence_moves};
use crate::backend::x86_64::{Asm, Cc, Reg, Xmm};
use crate::buffer::{CodeBuffer, Label, PatchKind};
use crate::error::JitError;
use crate::intrinsics::{Intrinsic, IntrinsicTable};
use crate::memory::ExecutableCode;
use crate::operand::{CallTarget, Cond, Fpr, Gpr, NUM_GPRS, Operand};

/// Physical homes of the logical general-purpose registers: `R0`..`R2`
/// caller-saved, `V0`..`V2` callee-saved under System V.
const GPR_MAP: [Reg; NUM_GPRS] = [Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rbx, Reg::R13, Reg::R14];

/// Holds call targets and oversized immediates; never a logical register.
const SCRATCH: Reg = Reg::R11;
/// Marshaling staging and parallel-move cycle breaking.
const SCRATCH2: Reg = Reg::R10;
const FSCRATCH: Xmm = Xmm(15);

/// System V AMD64: rdi, rsi, rdx, rcx, r8, r9 / xmm0-7; incoming stack
/// arguments start 16 bytes above the frame pointer.
const CALL_CONV: CallConv = CallConv {
    word_regs: &[7, 6, 2, 1, 8, 9],
    float_regs: &[0, 1, 2, 3, 4, 5, 6, 7],
    incoming_stack_base: 16,
};

fn phys(r: Gpr) -> Reg {
    GPR_MAP[r.index()]
}

fn fphys(r: Fpr) -> Xmm {
    Xmm(r.index() as u8)
}

fn fits_i32(value: i64) -> bool {
    value >= i32::MIN as i64 && value <= i32::MAX as i64
}

fn cc_of(cond: Cond) -> Cc {
    match cond {
        Cond::Eq => Cc::E,
        Cond::Ne => Cc::Ne,
        Cond::Lt => Cc::L,
        Cond::Le => Cc::Le,
        Cond::Gt => Cc::G,
        Cond::Ge => Cc::Ge,
        Cond::Ult => Cc::B,
        Cond::Ule => Cc::Be,
        Cond::Ugt => Cc::A,
        Cond::Uge => Cc::Ae,
    }
}

/// The x86-64 emitter.
pub struct Emitter {
    buf: CodeBuffer,
}

impl Emitter {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: CodeBuffer::with_capacity(capacity),
        }
    }

    fn asm(&mut self) -> Asm<'_> {
        Asm::new(&mut self.buf)
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    /// The bytes emitted so far.
    pub fn code(&self) -> &[u8] {
        self.buf.code()
    }

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    pub fn finalize(self) -> Result<ExecutableCode, JitError> {
        self.buf.finalize()
    }

    // ==================== moves ====================

    fn mov_if(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.asm().mov_rr(dst, src);
        }
    }

    pub fn movr(&mut self, dst: Gpr, src: Gpr) {
        self.mov_if(phys(dst), phys(src));
    }

    pub fn movi(&mut self, dst: Gpr, value: i64) {
        self.load_imm(phys(dst), value);
    }

    fn load_imm(&mut self, dst: Reg, value: i64) {
        if fits_i32(value) {
            self.asm().mov_ri32(dst, value as i32);
        } else {
            self.asm().mov_ri64(dst, value);
        }
    }

    pub fn movr_f(&mut self, dst: Fpr, src: Fpr) {
        if dst != src {
            self.asm().movss_rr(fphys(dst), fphys(src));
        }
    }

    pub fn movr_d(&mut self, dst: Fpr, src: Fpr) {
        if dst != src {
            self.asm().movsd_rr(fphys(dst), fphys(src));
        }
    }

    pub fn movi_f(&mut self, dst: Fpr, value: f32) {
        self.load_imm(SCRATCH, value.to_bits() as i64);
        self.asm().movq_xmm_r(fphys(dst), SCRATCH);
    }

    pub fn movi_d(&mut self, dst: Fpr, value: f64) {
        self.load_imm(SCRATCH, value.to_bits() as i64);
        self.asm().movq_xmm_r(fphys(dst), SCRATCH);
    }

    // ==================== three-operand expansion helpers ====================

    /// dst = a OP b over a two-operand instruction. Flag-safe: only MOVs
    /// are inserted around `op`, so carry produced or consumed by `op`
    /// survives the expansion.
    fn op3(
        &mut self,
        dst: Reg,
        a: Reg,
        b: Reg,
        commutes: bool,
        op: for<'x, 'y> fn(&'x mut Asm<'y>, Reg, Reg),
    ) {
        if dst == a {
            op(&mut self.asm(), dst, b);
        } else if dst == b {
            if commutes {
                op(&mut self.asm(), dst, a);
            } else {
                self.asm().mov_rr(SCRATCH, a);
                op(&mut self.asm(), SCRATCH, b);
                self.asm().mov_rr(dst, SCRATCH);
            }
        } else {
            self.asm().mov_rr(dst, a);
            op(&mut self.asm(), dst, b);
        }
    }

    /// dst = a OP imm, falling back to the register form through the
    /// scratch register when the immediate exceeds the sign-extended
    /// 32-bit field. MOV into scratch is flag-safe.
    fn op3i(
        &mut self,
        dst: Reg,
        a: Reg,
        imm: i64,
        op_ri: for<'x, 'y> fn(&'x mut Asm<'y>, Reg, i32),
        op_rr: for<'x, 'y> fn(&'x mut Asm<'y>, Reg, Reg),
    ) {
        self.mov_if(dst, a);
        if fits_i32(imm) {
            op_ri(&mut self.asm(), dst, imm as i32);
        } else {
            self.asm().mov_ri64(SCRATCH, imm);
            op_rr(&mut self.asm(), dst, SCRATCH);
        }
    }

    fn fop3(
        &mut self,
        dst: Xmm,
        a: Xmm,
        b: Xmm,
        commutes: bool,
        op: for<'x, 'y> fn(&'x mut Asm<'y>, Xmm, Xmm),
        mov: for<'x, 'y> fn(&'x mut Asm<'y>, Xmm, Xmm),
    ) {
        if dst == a {
            op(&mut self.asm(), dst, b);
        } else if dst == b {
            if commutes {
                op(&mut self.asm(), dst, a);
            } else {
                mov(&mut self.asm(), FSCRATCH, a);
                op(&mut self.asm(), FSCRATCH, b);
                mov(&mut self.asm(), dst, FSCRATCH);
            }
        } else {
            mov(&mut self.asm(), dst, a);
            op(&mut self.asm(), dst, b);
        }
    }

    // ==================== integer arithmetic ====================

    pub fn addr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), true, |asm, d, s| {
            asm.add_rr(d, s)
        });
    }

    pub fn addi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        self.op3i(
            phys(dst),
            phys(a),
            imm,
            |asm, d, i| asm.add_ri(d, i),
            |asm, d, s| asm.add_rr(d, s),
        );
    }

    pub fn subr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), false, |asm, d, s| {
            asm.sub_rr(d, s)
        });
    }

    pub fn subi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        self.op3i(
            phys(dst),
            phys(a),
            imm,
            |asm, d, i| asm.sub_ri(d, i),
            |asm, d, s| asm.sub_rr(d, s),
        );
    }

    /// Add, leaving the carry flag set for a following `addxr`/`addxi`.
    pub fn addcr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), true, |asm, d, s| {
            asm.add_rr(d, s)
        });
    }

    /// Add incorporating and propagating the carry flag.
    pub fn addxr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), true, |asm, d, s| {
            asm.adc_rr(d, s)
        });
    }

    pub fn addxi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        self.op3i(
            phys(dst),
            phys(a),
            imm,
            |asm, d, i| asm.adc_ri(d, i),
            |asm, d, s| asm.adc_rr(d, s),
        );
    }

    /// Subtract, leaving the borrow in the carry flag for `subxr`/`subxi`.
    pub fn subcr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), false, |asm, d, s| {
            asm.sub_rr(d, s)
        });
    }

    /// Subtract incorporating and propagating the borrow.
    pub fn subxr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), false, |asm, d, s| {
            asm.sbb_rr(d, s)
        });
    }

    pub fn subxi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        self.op3i(
            phys(dst),
            phys(a),
            imm,
            |asm, d, i| asm.sbb_ri(d, i),
            |asm, d, s| asm.sbb_rr(d, s),
        );
    }

    pub fn mulr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), true, |asm, d, s| {
            asm.imul_rr(d, s)
        });
    }

    pub fn muli(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        let (dst, a) = (phys(dst), phys(a));
        if fits_i32(imm) {
            self.asm().imul_rri(dst, a, imm as i32);
        } else {
            self.asm().mov_ri64(SCRATCH, imm);
            self.op3(dst, a, SCRATCH, true, |asm, d, s| asm.imul_rr(d, s));
        }
    }

    /// Signed division. RAX/RDX are fixed by the instruction; both are
    /// logical registers here, so they are preserved around the divide.
    pub fn divr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.div_rem(phys(dst), phys(a), phys(b), false);
    }

    /// Signed remainder.
    pub fn remr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.div_rem(phys(dst), phys(a), phys(b), true);
    }

    fn div_rem(&mut self, dst: Reg, a: Reg, b: Reg, rem: bool) {
        let mut asm = self.asm();
        asm.push_r(Reg::Rax);
        asm.push_r(Reg::Rdx);
        asm.mov_rr(SCRATCH, b);
        if a != Reg::Rax {
            asm.mov_rr(Reg::Rax, a);
        }
        asm.cqo();
        asm.idiv_r(SCRATCH);
        asm.mov_rr(SCRATCH, if rem { Reg::Rdx } else { Reg::Rax });
        asm.pop_r(Reg::Rdx);
        asm.pop_r(Reg::Rax);
        asm.mov_rr(dst, SCRATCH);
    }

    pub fn negr(&mut self, dst: Gpr, src: Gpr) {
        self.mov_if(phys(dst), phys(src));
        self.asm().neg_r(phys(dst));
    }

    /// Bitwise complement.
    pub fn comr(&mut self, dst: Gpr, src: Gpr) {
        self.mov_if(phys(dst), phys(src));
        self.asm().not_r(phys(dst));
    }

    // ==================== logic ====================

    pub fn andr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), true, |asm, d, s| {
            asm.and_rr(d, s)
        });
    }

    pub fn andi(&mut self, dst: Gpr, a: Gpr, imm: u64) {
        self.logic_i(
            phys(dst),
            phys(a),
            imm,
            |asm, d, i| asm.and_ri(d, i),
            |asm, d, s| asm.and_rr(d, s),
        );
    }

    pub fn orr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), true, |asm, d, s| {
            asm.or_rr(d, s)
        });
    }

    pub fn ori(&mut self, dst: Gpr, a: Gpr, imm: u64) {
        self.logic_i(
            phys(dst),
            phys(a),
            imm,
            |asm, d, i| asm.or_ri(d, i),
            |asm, d, s| asm.or_rr(d, s),
        );
    }

    pub fn xorr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.op3(phys(dst), phys(a), phys(b), true, |asm, d, s| {
            asm.xor_rr(d, s)
        });
    }

    pub fn xori(&mut self, dst: Gpr, a: Gpr, imm: u64) {
        self.logic_i(
            phys(dst),
            phys(a),
            imm,
            |asm, d, i| asm.xor_ri(d, i),
            |asm, d, s| asm.xor_rr(d, s),
        );
    }

    /// The imm32 form sign-extends, so it is only usable when that
    /// sign extension reproduces the requested 64-bit mask.
    fn logic_i(
        &mut self,
        dst: Reg,
        a: Reg,
        imm: u64,
        op_ri: for<'x, 'y> fn(&'x mut Asm<'y>, Reg, i32),
        op_rr: for<'x, 'y> fn(&'x mut Asm<'y>, Reg, Reg),
    ) {
        if imm == imm as i32 as i64 as u64 {
            self.mov_if(dst, a);
            op_ri(&mut self.asm(), dst, imm as i32);
        } else {
            self.asm().mov_ri64(SCRATCH, imm as i64);
            self.op3(dst, a, SCRATCH, true, op_rr);
        }
    }

    // ==================== shifts ====================

    /// Shift by register. The count must be in CL; RCX is a logical
    /// register, so it is preserved around the shift.
    fn shift_rr(&mut self, dst: Reg, a: Reg, b: Reg, op: for<'x, 'y> fn(&'x mut Asm<'y>, Reg)) {
        let mut asm = self.asm();
        asm.push_r(Reg::Rcx);
        asm.mov_rr(SCRATCH, a);
        if b != Reg::Rcx {
            asm.mov_rr(Reg::Rcx, b);
        }
        op(&mut asm, SCRATCH);
        asm.pop_r(Reg::Rcx);
        asm.mov_rr(dst, SCRATCH);
    }

    pub fn lshr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.shift_rr(phys(dst), phys(a), phys(b), |asm, r| asm.shl_cl(r));
    }

    pub fn lshi(&mut self, dst: Gpr, a: Gpr, count: u32) {
        debug_assert!(count < 64);
        self.mov_if(phys(dst), phys(a));
        self.asm().shl_ri(phys(dst), count as u8);
    }

    /// Arithmetic right shift by register.
    pub fn rshr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.shift_rr(phys(dst), phys(a), phys(b), |asm, r| asm.sar_cl(r));
    }

    pub fn rshi(&mut self, dst: Gpr, a: Gpr, count: u32) {
        debug_assert!(count < 64);
        self.mov_if(phys(dst), phys(a));
        self.asm().sar_ri(phys(dst), count as u8);
    }

    /// Logical right shift by register.
    pub fn rshr_u(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.shift_rr(phys(dst), phys(a), phys(b), |asm, r| asm.shr_cl(r));
    }

    pub fn rshi_u(&mut self, dst: Gpr, a: Gpr, count: u32) {
        debug_assert!(count < 64);
        self.mov_if(phys(dst), phys(a));
        self.asm().shr_ri(phys(dst), count as u8);
    }

    // ==================== float arithmetic ====================

    pub fn addr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            true,
            |asm, d, s| asm.addss(d, s),
            |asm, d, s| asm.movss_rr(d, s),
        );
    }

    pub fn subr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            false,
            |asm, d, s| asm.subss(d, s),
            |asm, d, s| asm.movss_rr(d, s),
        );
    }

    pub fn mulr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            true,
            |asm, d, s| asm.mulss(d, s),
            |asm, d, s| asm.movss_rr(d, s),
        );
    }

    pub fn divr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            false,
            |asm, d, s| asm.divss(d, s),
            |asm, d, s| asm.movss_rr(d, s),
        );
    }

    pub fn addr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            true,
            |asm, d, s| asm.addsd(d, s),
            |asm, d, s| asm.movsd_rr(d, s),
        );
    }

    pub fn subr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            false,
            |asm, d, s| asm.subsd(d, s),
            |asm, d, s| asm.movsd_rr(d, s),
        );
    }

    pub fn mulr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            true,
            |asm, d, s| asm.mulsd(d, s),
            |asm, d, s| asm.movsd_rr(d, s),
        );
    }

    pub fn divr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.fop3(
            fphys(dst),
            fphys(a),
            fphys(b),
            false,
            |asm, d, s| asm.divsd(d, s),
            |asm, d, s| asm.movsd_rr(d, s),
        );
    }

    // ==================== loads and stores ====================

    pub fn ldr_i8(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        self.asm().movsx8_rm(phys(dst), phys(base), offset);
    }

    pub fn ldr_u8(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        self.asm().movzx8_rm(phys(dst), phys(base), offset);
    }

    pub fn ldr_i16(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        self.asm().movsx16_rm(phys(dst), phys(base), offset);
    }

    pub fn ldr_u16(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        self.asm().movzx16_rm(phys(dst), phys(base), offset);
    }

    pub fn ldr_i32(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        self.asm().movsxd_rm(phys(dst), phys(base), offset);
    }

    pub fn ldr_u32(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        self.asm().mov32_rm(phys(dst), phys(base), offset);
    }

    pub fn ldr_i64(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        self.asm().mov_rm(phys(dst), phys(base), offset);
    }

    pub fn str_8(&mut self, base: Gpr, offset: i32, src: Gpr) {
        self.asm().mov8_mr(phys(base), offset, phys(src));
    }

    pub fn str_16(&mut self, base: Gpr, offset: i32, src: Gpr) {
        self.asm().mov16_mr(phys(base), offset, phys(src));
    }

    pub fn str_32(&mut self, base: Gpr, offset: i32, src: Gpr) {
        self.asm().mov32_mr(phys(base), offset, phys(src));
    }

    pub fn str_64(&mut self, base: Gpr, offset: i32, src: Gpr) {
        self.asm().mov_mr(phys(base), offset, phys(src));
    }

    pub fn ldr_f(&mut self, dst: Fpr, base: Gpr, offset: i32) {
        self.asm().movss_load(fphys(dst), phys(base), offset);
    }

    pub fn str_f(&mut self, base: Gpr, offset: i32, src: Fpr) {
        self.asm().movss_store(phys(base), offset, fphys(src));
    }

    pub fn ldr_d(&mut self, dst: Fpr, base: Gpr, offset: i32) {
        self.asm().movsd_load(fphys(dst), phys(base), offset);
    }

    pub fn str_d(&mut self, base: Gpr, offset: i32, src: Fpr) {
        self.asm().movsd_store(phys(base), offset, fphys(src));
    }

    // ==================== control transfer ====================

    /// Unconditional jump. A bound (backward) target takes the rel8 form
    /// when in range; an unbound target reserves the rel32 form.
    pub fn jmp(&mut self, label: Label) {
        if let Some(target) = self.buf.label_offset(label) {
            let disp8 = target as i64 - (self.buf.offset() as i64 + 2);
            if (-128..=127).contains(&disp8) {
                self.asm().jmp_rel8(disp8 as i8);
            } else {
                let disp32 = target as i64 - (self.buf.offset() as i64 + 5);
                self.asm().jmp_rel32(disp32 as i32);
            }
        } else {
            self.asm().jmp_op();
            self.buf.emit_patchable(PatchKind::Rel32, label, 0);
        }
    }

    pub fn jmpr(&mut self, target: Gpr) {
        self.asm().jmp_r(phys(target));
    }

    fn jcc_to(&mut self, cc: Cc, label: Label) {
        if let Some(target) = self.buf.label_offset(label) {
            let disp8 = target as i64 - (self.buf.offset() as i64 + 2);
            if (-128..=127).contains(&disp8) {
                self.asm().jcc_rel8(cc, disp8 as i8);
            } else {
                let disp32 = target as i64 - (self.buf.offset() as i64 + 6);
                self.asm().jcc_rel32(cc, disp32 as i32);
            }
        } else {
            self.asm().jcc_op(cc);
            self.buf.emit_patchable(PatchKind::Rel32, label, 0);
        }
    }

    /// Compare and branch.
    pub fn brcmp(&mut self, cond: Cond, a: Gpr, b: Gpr, label: Label) {
        self.asm().cmp_rr(phys(a), phys(b));
        self.jcc_to(cc_of(cond), label);
    }

    pub fn brcmpi(&mut self, cond: Cond, a: Gpr, imm: i64, label: Label) {
        if fits_i32(imm) {
            self.asm().cmp_ri(phys(a), imm as i32);
        } else {
            self.asm().mov_ri64(SCRATCH, imm);
            self.asm().cmp_rr(phys(a), SCRATCH);
        }
        self.jcc_to(cc_of(cond), label);
    }

    pub fn call(&mut self, label: Label) {
        self.asm().call_op();
        self.buf.emit_patchable(PatchKind::Rel32, label, 0);
    }

    pub fn callr(&mut self, target: Gpr) {
        self.asm().call_r(phys(target));
    }

    /// Call an absolute native address through the scratch register.
    pub fn calli(&mut self, addr: usize) {
        self.asm().mov_ri64(SCRATCH, addr as i64);
        self.asm().call_r(SCRATCH);
    }

    pub fn ret(&mut self) {
        self.asm().ret();
    }

    pub fn retr(&mut self, src: Gpr) {
        self.mov_if(Reg::Rax, phys(src));
        self.asm().ret();
    }

    pub fn retr_f(&mut self, src: Fpr) {
        if fphys(src) != Xmm(0) {
            self.asm().movss_rr(Xmm(0), fphys(src));
        }
        self.asm().ret();
    }

    pub fn retr_d(&mut self, src: Fpr) {
        if fphys(src) != Xmm(0) {
            self.asm().movsd_rr(Xmm(0), fphys(src));
        }
        self.asm().ret();
    }

    /// Capture the word return value of the last call.
    pub fn retval(&mut self, dst: Gpr) {
        self.mov_if(phys(dst), Reg::Rax);
    }

    pub fn retval_f(&mut self, dst: Fpr) {
        if fphys(dst) != Xmm(0) {
            self.asm().movss_rr(fphys(dst), Xmm(0));
        }
    }

    pub fn retval_d(&mut self, dst: Fpr) {
        if fphys(dst) != Xmm(0) {
            self.asm().movsd_rr(fphys(dst), Xmm(0));
        }
    }

    /// Call a runtime intrinsic through its installed table entry.
    pub fn call_intrinsic(&mut self, table: &IntrinsicTable, which: Intrinsic) {
        self.calli(table.address(which));
    }

    // ==================== ABI adaptor ====================

    /// Native-ABI prologue: frame-pointer link, callee-saved spills,
    /// 16-byte-aligned local area. Returns the stack adjustment that
    /// `leave_abi_frame` must undo.
    pub fn enter_abi_frame(
        &mut self,
        saved_gprs: &[Gpr],
        saved_fprs: &[Fpr],
        frame_size: usize,
    ) -> usize {
        debug_assert!(
            saved_fprs.is_empty(),
            "System V has no callee-saved float registers"
        );
        let mut asm = self.asm();
        asm.push_r(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        for g in saved_gprs {
            asm.push_r(phys(*g));
        }
        let pushed = saved_gprs.len() * 8;
        let adjustment = ((pushed + frame_size + 15) & !15) - pushed;
        if adjustment > 0 {
            asm.sub_ri(Reg::Rsp, adjustment as i32);
        }
        adjustment
    }

    /// Exact inverse of `enter_abi_frame`.
    pub fn leave_abi_frame(&mut self, saved_gprs: &[Gpr], saved_fprs: &[Fpr], adjustment: usize) {
        debug_assert!(saved_fprs.is_empty());
        let mut asm = self.asm();
        if adjustment > 0 {
            asm.add_ri(Reg::Rsp, adjustment as i32);
        }
        for g in saved_gprs.iter().rev() {
            asm.pop_r(phys(*g));
        }
        asm.pop_r(Reg::Rbp);
    }

    /// Where the native convention put the given incoming parameters.
    pub fn receive_args(&self, params: &[AbiParam]) -> Vec<ArgLoc> {
        CALL_CONV.place_incoming(params)
    }

    /// Copy incoming arguments into the named logical registers. Each
    /// operand must be `AbiWord` or `AbiFloat`; register-file conflicts
    /// are resolved per class. Stack arguments are frame-pointer
    /// relative, so this must run after `enter_abi_frame`.
    pub fn load_args(&mut self, args: &[Operand]) {
        let params: Vec<AbiParam> = args
            .iter()
            .map(|op| match op {
                Operand::AbiWord(_) => AbiParam::Word,
                Operand::AbiFloat(_) => AbiParam::Float,
                _ => {
                    debug_assert!(false, "load_args takes only ABI operands");
                    AbiParam::Word
                }
            })
            .collect();
        let locs = CALL_CONV.place_incoming(&params);
        let mut words = Vec::new();
        let mut floats = Vec::new();
        for (op, loc) in args.iter().zip(&locs) {
            match (op, loc) {
                (Operand::AbiWord(dst), ArgLoc::WordReg(src)) => {
                    words.push(PlannedMove::reg(*src, phys(*dst) as u8));
                }
                (Operand::AbiWord(dst), ArgLoc::Stack(off)) => {
                    words.push(PlannedMove::load(Reg::Rbp as u8, *off, phys(*dst) as u8));
                }
                (Operand::AbiFloat(dst), ArgLoc::FloatReg(src)) => {
                    floats.push(PlannedMove::reg(*src, fphys(*dst).0));
                }
                (Operand::AbiFloat(dst), ArgLoc::Stack(off)) => {
                    floats.push(PlannedMove::load_foreign(Reg::Rbp as u8, *off, fphys(*dst).0));
                }
                _ => debug_assert!(false, "operand/placement class mismatch"),
            }
        }
        self.run_float_plan(floats);
        self.run_word_plan(words);
    }

    fn run_word_plan(&mut self, moves: Vec<PlannedMove>) {
        for m in sequence_moves(moves, SCRATCH2 as u8) {
            let dst = Reg::from_code(m.dst);
            match (m.op, m.src) {
                (MoveOp::Reg, Some(src)) => self.asm().mov_rr(dst, Reg::from_code(src)),
                (MoveOp::Load { base, offset }, _) => {
                    self.asm().mov_rm(dst, Reg::from_code(base), offset)
                }
                (MoveOp::Imm(value), _) => self.load_imm(dst, value),
                _ => debug_assert!(false, "register move without source"),
            }
        }
    }

    fn run_float_plan(&mut self, moves: Vec<PlannedMove>) {
        for m in sequence_moves(moves, FSCRATCH.0) {
            let dst = Xmm(m.dst);
            match (m.op, m.src) {
                (MoveOp::Reg, Some(src)) => self.asm().movsd_rr(dst, Xmm(src)),
                (MoveOp::Load { base, offset }, _) => {
                    self.asm().movsd_load(dst, Reg::from_code(base), offset)
                }
                (MoveOp::Imm(bits), _) => {
                    self.load_imm(SCRATCH2, bits);
                    self.asm().movq_xmm_r(dst, SCRATCH2);
                }
                _ => debug_assert!(false, "register move without source"),
            }
        }
    }

    /// Marshal outgoing arguments and call a native function. The word
    /// return value, if any, is captured afterwards with `retval`.
    pub fn call_native(&mut self, target: CallTarget, args: &[(AbiParam, Operand)]) {
        let params: Vec<AbiParam> = args.iter().map(|(p, _)| *p).collect();
        let locs = CALL_CONV.place_outgoing(&params);
        let stack_bytes = CALL_CONV.outgoing_stack_bytes(&params) as i32;

        // The target register could itself be an argument home.
        if let CallTarget::Reg(g) = target {
            self.mov_if(SCRATCH, phys(g));
        }
        if stack_bytes > 0 {
            self.asm().sub_ri(Reg::Rsp, stack_bytes);
        }

        // Stack slots first, while every source register is still intact.
        for ((_, op), loc) in args.iter().zip(&locs) {
            let ArgLoc::Stack(off) = loc else { continue };
            match op {
                Operand::Gpr(g) => self.asm().mov_mr(Reg::Rsp, *off, phys(*g)),
                Operand::Fpr(f) => self.asm().movsd_store(Reg::Rsp, *off, fphys(*f)),
                Operand::Imm(v) => {
                    self.load_imm(SCRATCH2, *v);
                    self.asm().mov_mr(Reg::Rsp, *off, SCRATCH2);
                }
                Operand::Uimm(v) => {
                    self.load_imm(SCRATCH2, *v as i64);
                    self.asm().mov_mr(Reg::Rsp, *off, SCRATCH2);
                }
                Operand::FImm(v) => {
                    self.load_imm(SCRATCH2, v.to_bits() as i64);
                    self.asm().mov_mr(Reg::Rsp, *off, SCRATCH2);
                }
                Operand::Mem { base, offset } => {
                    self.asm().mov_rm(SCRATCH2, phys(*base), *offset);
                    self.asm().mov_mr(Reg::Rsp, *off, SCRATCH2);
                }
                _ => debug_assert!(false, "ABI operands are not call arguments"),
            }
        }

        // Float registers next: their loads read GPR bases, which the word
        // pass below is still free to clobber afterwards.
        let mut floats = Vec::new();
        let mut words = Vec::new();
        for ((_, op), loc) in args.iter().zip(&locs) {
            match loc {
                ArgLoc::FloatReg(dst) => match op {
                    Operand::Fpr(f) => floats.push(PlannedMove::reg(fphys(*f).0, *dst)),
                    Operand::FImm(v) => floats.push(PlannedMove::imm(v.to_bits() as i64, *dst)),
                    Operand::Mem { base, offset } => {
                        floats.push(PlannedMove::load_foreign(phys(*base) as u8, *offset, *dst));
                    }
                    _ => debug_assert!(false, "float argument from a word operand"),
                },
                ArgLoc::WordReg(dst) => match op {
                    Operand::Gpr(g) => words.push(PlannedMove::reg(phys(*g) as u8, *dst)),
                    Operand::Imm(v) => words.push(PlannedMove::imm(*v, *dst)),
                    Operand::Uimm(v) => words.push(PlannedMove::imm(*v as i64, *dst)),
                    Operand::Mem { base, offset } => {
                        words.push(PlannedMove::load(phys(*base) as u8, *offset, *dst));
                    }
                    _ => debug_assert!(false, "word argument from a float operand"),
                },
                ArgLoc::Stack(_) => {}
            }
        }
        self.run_float_plan(floats);
        self.run_word_plan(words);

        match target {
            CallTarget::Addr(addr) => {
                self.asm().mov_ri64(SCRATCH, addr as i64);
                self.asm().call_r(SCRATCH);
            }
            CallTarget::Reg(_) => self.asm().call_r(SCRATCH),
        }
        if stack_bytes > 0 {
            self.asm().add_ri(Reg::Rsp, stack_bytes);
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{F0, F1, R0, R1, R2, V0};

    #[test]
    fn movi_picks_shortest_form() {
        let mut e = Emitter::new();
        e.movi(R0, 42);
        assert_eq!(e.code(), &[0x48, 0xC7, 0xC0, 0x2A, 0, 0, 0]);

        let mut e = Emitter::new();
        e.movi(R0, 0x1_0000_0000);
        assert_eq!(e.code(), &[0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn three_operand_add_reuses_destination() {
        // dst == a: single ADD
        let mut e = Emitter::new();
        e.addr(R0, R0, R1);
        assert_eq!(e.code(), &[0x48, 0x01, 0xC8]);

        // dst == b, commutative: operands swap
        let mut e = Emitter::new();
        e.addr(R1, R0, R1);
        assert_eq!(e.code(), &[0x48, 0x01, 0xC1]);

        // disjoint: MOV then ADD
        let mut e = Emitter::new();
        e.addr(R2, R0, R1);
        assert_eq!(e.code(), &[0x48, 0x89, 0xC2, 0x48, 0x01, 0xCA]);
    }

    #[test]
    fn subtraction_from_destination_routes_through_scratch() {
        // dst == b on a non-commutative op
        let mut e = Emitter::new();
        e.subr(R1, R0, R1);
        assert_eq!(
            e.code(),
            &[
                0x49, 0x89, 0xC3, // mov r11, rax
                0x49, 0x29, 0xCB, // sub r11, rcx
                0x4C, 0x89, 0xD9, // mov rcx, r11
            ]
        );
    }

    #[test]
    fn wide_and_mask_uses_scratch_register() {
        // 0x80000000 sign-extends wrong as imm32, so it goes via r11
        let mut e = Emitter::new();
        e.andi(R0, R0, 0x8000_0000);
        assert_eq!(
            e.code(),
            &[
                0x49, 0xBB, 0, 0, 0, 0x80, 0, 0, 0, 0, // movabs r11, 0x80000000
                0x4C, 0x21, 0xD8, // and rax, r11
            ]
        );

        // 0x7fffffff fits the sign-extended imm32 field
        let mut e = Emitter::new();
        e.andi(R0, R0, 0x7FFF_FFFF);
        assert_eq!(e.code(), &[0x48, 0x81, 0xE0, 0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn borrow_chain_stays_flag_safe() {
        let mut e = Emitter::new();
        e.subcr(R0, R0, R1);
        e.subxi(R2, R2, 0);
        assert_eq!(
            e.code(),
            &[
                0x48, 0x29, 0xC8, // sub rax, rcx
                0x48, 0x83, 0xDA, 0x00, // sbb rdx, 0
            ]
        );
    }

    #[test]
    fn register_shift_preserves_rcx() {
        let mut e = Emitter::new();
        e.lshr(R0, R0, R2);
        assert_eq!(
            e.code(),
            &[
                0x51, // push rcx
                0x49, 0x89, 0xC3, // mov r11, rax
                0x48, 0x89, 0xD1, // mov rcx, rdx
                0x49, 0xD3, 0xE3, // shl r11, cl
                0x59, // pop rcx
                0x4C, 0x89, 0xD8, // mov rax, r11
            ]
        );
    }

    #[test]
    fn backward_jump_takes_rel8() {
        let mut e = Emitter::new();
        let l = e.new_label();
        e.bind(l);
        e.addr(R0, R0, R1);
        e.jmp(l);
        // jmp at offset 3, rel8 target 0 -> disp -5
        assert_eq!(&e.code()[3..], &[0xEB, 0xFB]);
    }

    #[test]
    fn forward_branch_reserves_rel32() {
        let mut e = Emitter::new();
        let l = e.new_label();
        e.brcmp(Cond::Eq, R0, R1, l);
        // cmp (3) + 0F 84 + 4-byte field
        assert_eq!(e.code().len(), 9);
        assert_eq!(&e.code()[3..5], &[0x0F, 0x84]);
        e.bind(l);
    }

    #[test]
    fn float_immediate_goes_through_gpr() {
        let mut e = Emitter::new();
        e.movi_f(F0, 0.5);
        let bits = 0.5f32.to_bits();
        let mut want = vec![0x49, 0xC7, 0xC3]; // mov r11d form (imm32)
        want.extend_from_slice(&bits.to_le_bytes());
        want.extend_from_slice(&[0x66, 0x49, 0x0F, 0x6E, 0xC3]); // movq xmm0, r11
        assert_eq!(e.code(), &want[..]);
    }

    #[test]
    fn frame_adjustment_keeps_sixteen_byte_alignment() {
        let mut e = Emitter::new();
        let adj = e.enter_abi_frame(&[V0], &[], 24);
        // 8 bytes pushed; 8 + 24 rounds to 32; adjustment 24
        assert_eq!(adj, 24);
        let mut e = Emitter::new();
        let adj = e.enter_abi_frame(&[], &[], 0);
        assert_eq!(adj, 0);
    }

    #[test]
    fn load_args_resolves_register_overlap() {
        // Incoming: rdi, rsi -> rax, rcx. rcx is not a source, so any
        // order works; just check the exact bytes of the obvious one.
        let mut e = Emitter::new();
        e.load_args(&[Operand::AbiWord(R0), Operand::AbiWord(R1)]);
        assert_eq!(
            e.code(),
            &[
                0x48, 0x89, 0xF8, // mov rax, rdi
                0x48, 0x89, 0xF1, // mov rcx, rsi
            ]
        );
    }

    #[test]
    fn call_native_spills_seventh_argument() {
        let mut e = Emitter::new();
        let args: Vec<(AbiParam, Operand)> = (0..7)
            .map(|_| (AbiParam::Word, Operand::Gpr(R0)))
            .collect();
        e.call_native(CallTarget::Addr(0x1000), &args);
        // 16 bytes reserved and released around the call
        let code = e.code();
        assert_eq!(&code[0..4], &[0x48, 0x83, 0xEC, 0x10]); // sub rsp, 16
        assert_eq!(&code[code.len() - 4..], &[0x48, 0x83, 0xC4, 0x10]); // add rsp, 16
    }

    #[test]
    fn reused_float_register_swap_uses_scratch() {
        // F0 -> xmm1 and F1 -> xmm0 is a two-cycle.
        let mut e = Emitter::new();
        e.call_native(
            CallTarget::Addr(0x1000),
            &[
                (AbiParam::Float, Operand::Fpr(F1)),
                (AbiParam::Float, Operand::Fpr(F0)),
            ],
        );
        // park xmm1, move xmm0 -> xmm1, unpark into xmm0
        assert_eq!(
            &e.code()[..14],
            &[
                0xF2, 0x44, 0x0F, 0x10, 0xF9, // movsd xmm15, xmm1
                0xF2, 0x0F, 0x10, 0xC8, // movsd xmm1, xmm0
                0xF2, 0x41, 0x0F, 0x10, 0xC7, // movsd xmm0, xmm15
            ][..14]
        );
    }
}
