//! AArch64 realization of the emission API.
//!
//! A64 instructions are mostly three-operand already, so expansion here
//! is about immediates: values outside the imm12/bitmask fields are
//! materialized into a scratch register with MOVZ/MOVN/MOVK sequences,
//! which never touch the flags and so are safe inside carry chains.

use crate::abi::{AbiParam, ArgLoc, CallConv, MoveOp, PlannedMove, sequence_moves};
use crate::backend::aarch64::{A64Cond, Asm, FP, LR, LogicalImm, SP, VReg, XReg};
use crate::buffer::{CodeBuffer, Label};
use crate::error::JitError;
use crate::intrinsics::{Intrinsic, IntrinsicTable};
use crate::memory::ExecutableCode;
use crate::operand::{CallTarget, Cond, Fpr, Gpr, NUM_GPRS, Operand};

/// Physical homes of the logical registers: `R0`..`R2` in caller-saved
/// x9-x11, `V0`..`V2` in callee-saved x19-x21.
const GPR_MAP: [XReg; NUM_GPRS] = [XReg(9), XReg(10), XReg(11), XReg(19), XReg(20), XReg(21)];

/// Holds call targets and oversized immediates (the platform IP0 slot).
const SCRATCH: XReg = XReg(16);
/// Marshaling staging and parallel-move cycle breaking (IP1).
const SCRATCH2: XReg = XReg(17);
const FSCRATCH: VReg = VReg(16);

/// AAPCS64: x0-x7 / v0-v7; incoming stack arguments start 16 bytes above
/// the frame pointer.
const CALL_CONV: CallConv = CallConv {
    word_regs: &[0, 1, 2, 3, 4, 5, 6, 7],
    float_regs: &[0, 1, 2, 3, 4, 5, 6, 7],
    incoming_stack_base: 16,
};

fn phys(r: Gpr) -> XReg {
    GPR_MAP[r.index()]
}

fn fphys(r: Fpr) -> VReg {
    VReg(r.index() as u8)
}

fn cond_of(cond: Cond) -> A64Cond {
    match cond {
        Cond::Eq => A64Cond::Eq,
        Cond::Ne => A64Cond::Ne,
        Cond::Lt => A64Cond::Lt,
        Cond::Le => A64Cond::Le,
        Cond::Gt => A64Cond::Gt,
        Cond::Ge => A64Cond::Ge,
        Cond::Ult => A64Cond::Lo,
        Cond::Ule => A64Cond::Ls,
        Cond::Ugt => A64Cond::Hi,
        Cond::Uge => A64Cond::Hs,
    }
}

/// The AArch64 emitter.
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

    pub fn movr(&mut self, dst: Gpr, src: Gpr) {
        if dst != src {
            self.asm().mov_rr(phys(dst), phys(src));
        }
    }

    pub fn movi(&mut self, dst: Gpr, value: i64) {
        self.load_imm(phys(dst), value as u64);
    }

    /// Minimal MOVZ/MOVN seed plus MOVK fills, chosen by whether zero or
    /// all-ones halfwords dominate. Never touches the flags.
    fn load_imm(&mut self, dst: XReg, value: u64) {
        let halves = [
            value as u16,
            (value >> 16) as u16,
            (value >> 32) as u16,
            (value >> 48) as u16,
        ];
        let zeros = halves.iter().filter(|&&h| h == 0).count();
        let ones = halves.iter().filter(|&&h| h == 0xFFFF).count();
        let mut asm = self.asm();
        let mut seeded = false;
        if ones > zeros {
            for (i, &h) in halves.iter().enumerate() {
                if h == 0xFFFF {
                    continue;
                }
                if seeded {
                    asm.movk(dst, h, i as u32 * 16);
                } else {
                    asm.movn(dst, !h, i as u32 * 16);
                    seeded = true;
                }
            }
            if !seeded {
                asm.movn(dst, 0, 0);
            }
        } else {
            for (i, &h) in halves.iter().enumerate() {
                if h == 0 {
                    continue;
                }
                if seeded {
                    asm.movk(dst, h, i as u32 * 16);
                } else {
                    asm.movz(dst, h, i as u32 * 16);
                    seeded = true;
                }
            }
            if !seeded {
                asm.movz(dst, 0, 0);
            }
        }
    }

    pub fn movr_f(&mut self, dst: Fpr, src: Fpr) {
        if dst != src {
            self.asm().fmov_s(fphys(dst), fphys(src));
        }
    }

    pub fn movr_d(&mut self, dst: Fpr, src: Fpr) {
        if dst != src {
            self.asm().fmov_d(fphys(dst), fphys(src));
        }
    }

    pub fn movi_f(&mut self, dst: Fpr, value: f32) {
        self.load_imm(SCRATCH, value.to_bits() as u64);
        self.asm().fmov_s_from_w(fphys(dst), SCRATCH);
    }

    pub fn movi_d(&mut self, dst: Fpr, value: f64) {
        self.load_imm(SCRATCH, value.to_bits());
        self.asm().fmov_d_from_x(fphys(dst), SCRATCH);
    }

    // ==================== integer arithmetic ====================

    pub fn addr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().add(phys(dst), phys(a), phys(b));
    }

    pub fn addi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        let (dst, a) = (phys(dst), phys(a));
        if (0..4096).contains(&imm) {
            self.asm().add_imm(dst, a, imm as u32);
        } else if (-4095..0).contains(&imm) {
            self.asm().sub_imm(dst, a, (-imm) as u32);
        } else {
            self.load_imm(SCRATCH, imm as u64);
            self.asm().add(dst, a, SCRATCH);
        }
    }

    pub fn subr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().sub(phys(dst), phys(a), phys(b));
    }

    pub fn subi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        let (dst, a) = (phys(dst), phys(a));
        if (0..4096).contains(&imm) {
            self.asm().sub_imm(dst, a, imm as u32);
        } else if (-4095..0).contains(&imm) {
            self.asm().add_imm(dst, a, (-imm) as u32);
        } else {
            self.load_imm(SCRATCH, imm as u64);
            self.asm().sub(dst, a, SCRATCH);
        }
    }

    /// Add, setting C for a following `addxr`/`addxi`.
    pub fn addcr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().adds(phys(dst), phys(a), phys(b));
    }

    /// Add incorporating and propagating C.
    pub fn addxr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().adcs(phys(dst), phys(a), phys(b));
    }

    /// There is no immediate ADC; the value goes through the scratch
    /// register, which the wide-move sequence fills without touching C.
    pub fn addxi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        self.load_imm(SCRATCH, imm as u64);
        self.asm().adcs(phys(dst), phys(a), SCRATCH);
    }

    /// Subtract, setting C (as NOT borrow) for `subxr`/`subxi`.
    pub fn subcr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().subs(phys(dst), phys(a), phys(b));
    }

    /// Subtract incorporating and propagating the borrow.
    pub fn subxr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().sbcs(phys(dst), phys(a), phys(b));
    }

    pub fn subxi(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        self.load_imm(SCRATCH, imm as u64);
        self.asm().sbcs(phys(dst), phys(a), SCRATCH);
    }

    pub fn mulr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().mul(phys(dst), phys(a), phys(b));
    }

    pub fn muli(&mut self, dst: Gpr, a: Gpr, imm: i64) {
        self.load_imm(SCRATCH, imm as u64);
        self.asm().mul(phys(dst), phys(a), SCRATCH);
    }

    pub fn divr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().sdiv(phys(dst), phys(a), phys(b));
    }

    /// Signed remainder: a - (a / b) * b via SDIV + MSUB.
    pub fn remr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        let (dst, a, b) = (phys(dst), phys(a), phys(b));
        self.asm().sdiv(SCRATCH2, a, b);
        self.asm().msub(dst, SCRATCH2, b, a);
    }

    pub fn negr(&mut self, dst: Gpr, src: Gpr) {
        self.asm().neg(phys(dst), phys(src));
    }

    /// Bitwise complement.
    pub fn comr(&mut self, dst: Gpr, src: Gpr) {
        self.asm().mvn(phys(dst), phys(src));
    }

    // ==================== logic ====================

    pub fn andr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().and(phys(dst), phys(a), phys(b));
    }

    pub fn andi(&mut self, dst: Gpr, a: Gpr, imm: u64) {
        if let Some(enc) = LogicalImm::encode(imm) {
            self.asm().and_imm(phys(dst), phys(a), enc);
        } else {
            self.load_imm(SCRATCH, imm);
            self.asm().and(phys(dst), phys(a), SCRATCH);
        }
    }

    pub fn orr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().orr(phys(dst), phys(a), phys(b));
    }

    pub fn ori(&mut self, dst: Gpr, a: Gpr, imm: u64) {
        if let Some(enc) = LogicalImm::encode(imm) {
            self.asm().orr_imm(phys(dst), phys(a), enc);
        } else {
            self.load_imm(SCRATCH, imm);
            self.asm().orr(phys(dst), phys(a), SCRATCH);
        }
    }

    pub fn xorr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().eor(phys(dst), phys(a), phys(b));
    }

    pub fn xori(&mut self, dst: Gpr, a: Gpr, imm: u64) {
        if let Some(enc) = LogicalImm::encode(imm) {
            self.asm().eor_imm(phys(dst), phys(a), enc);
        } else {
            self.load_imm(SCRATCH, imm);
            self.asm().eor(phys(dst), phys(a), SCRATCH);
        }
    }

    // ==================== shifts ====================

    pub fn lshr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().lslv(phys(dst), phys(a), phys(b));
    }

    pub fn lshi(&mut self, dst: Gpr, a: Gpr, count: u32) {
        debug_assert!(count < 64);
        self.asm().lsl_imm(phys(dst), phys(a), count);
    }

    /// Arithmetic right shift.
    pub fn rshr(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().asrv(phys(dst), phys(a), phys(b));
    }

    pub fn rshi(&mut self, dst: Gpr, a: Gpr, count: u32) {
        debug_assert!(count < 64);
        self.asm().asr_imm(phys(dst), phys(a), count);
    }

    /// Logical right shift.
    pub fn rshr_u(&mut self, dst: Gpr, a: Gpr, b: Gpr) {
        self.asm().lsrv(phys(dst), phys(a), phys(b));
    }

    pub fn rshi_u(&mut self, dst: Gpr, a: Gpr, count: u32) {
        debug_assert!(count < 64);
        self.asm().lsr_imm(phys(dst), phys(a), count);
    }

    // ==================== float arithmetic ====================

    pub fn addr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fadd_s(fphys(dst), fphys(a), fphys(b));
    }

    pub fn subr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fsub_s(fphys(dst), fphys(a), fphys(b));
    }

    pub fn mulr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fmul_s(fphys(dst), fphys(a), fphys(b));
    }

    pub fn divr_f(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fdiv_s(fphys(dst), fphys(a), fphys(b));
    }

    pub fn addr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fadd_d(fphys(dst), fphys(a), fphys(b));
    }

    pub fn subr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fsub_d(fphys(dst), fphys(a), fphys(b));
    }

    pub fn mulr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fmul_d(fphys(dst), fphys(a), fphys(b));
    }

    pub fn divr_d(&mut self, dst: Fpr, a: Fpr, b: Fpr) {
        self.asm().fdiv_d(fphys(dst), fphys(a), fphys(b));
    }

    // ==================== loads and stores ====================

    /// Fold an out-of-range offset into the scratch register so the
    /// encoder always sees a representable addressing mode.
    fn mem(&mut self, scale: u32, base: XReg, offset: i32) -> (XReg, i32) {
        let unit = 1i32 << scale;
        let scaled_ok = offset >= 0 && offset % unit == 0 && (offset >> scale) < 4096;
        if scaled_ok || (-256..256).contains(&offset) {
            (base, offset)
        } else {
            self.load_imm(SCRATCH2, offset as i64 as u64);
            self.asm().add(SCRATCH2, SCRATCH2, base);
            (SCRATCH2, 0)
        }
    }

    pub fn ldr_i8(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(0, phys(base), offset);
        self.asm().ldrsb(phys(dst), b, off);
    }

    pub fn ldr_u8(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(0, phys(base), offset);
        self.asm().ldrb(phys(dst), b, off);
    }

    pub fn ldr_i16(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(1, phys(base), offset);
        self.asm().ldrsh(phys(dst), b, off);
    }

    pub fn ldr_u16(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(1, phys(base), offset);
        self.asm().ldrh(phys(dst), b, off);
    }

    pub fn ldr_i32(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(2, phys(base), offset);
        self.asm().ldrsw(phys(dst), b, off);
    }

    pub fn ldr_u32(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(2, phys(base), offset);
        self.asm().ldr32(phys(dst), b, off);
    }

    pub fn ldr_i64(&mut self, dst: Gpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(3, phys(base), offset);
        self.asm().ldr(phys(dst), b, off);
    }

    pub fn str_8(&mut self, base: Gpr, offset: i32, src: Gpr) {
        let (b, off) = self.mem(0, phys(base), offset);
        self.asm().strb(phys(src), b, off);
    }

    pub fn str_16(&mut self, base: Gpr, offset: i32, src: Gpr) {
        let (b, off) = self.mem(1, phys(base), offset);
        self.asm().strh(phys(src), b, off);
    }

    pub fn str_32(&mut self, base: Gpr, offset: i32, src: Gpr) {
        let (b, off) = self.mem(2, phys(base), offset);
        self.asm().str32(phys(src), b, off);
    }

    pub fn str_64(&mut self, base: Gpr, offset: i32, src: Gpr) {
        let (b, off) = self.mem(3, phys(base), offset);
        self.asm().str(phys(src), b, off);
    }

    pub fn ldr_f(&mut self, dst: Fpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(2, phys(base), offset);
        self.asm().ldr_s(fphys(dst), b, off);
    }

    pub fn str_f(&mut self, base: Gpr, offset: i32, src: Fpr) {
        let (b, off) = self.mem(2, phys(base), offset);
        self.asm().str_s(fphys(src), b, off);
    }

    pub fn ldr_d(&mut self, dst: Fpr, base: Gpr, offset: i32) {
        let (b, off) = self.mem(3, phys(base), offset);
        self.asm().ldr_d(fphys(dst), b, off);
    }

    pub fn str_d(&mut self, base: Gpr, offset: i32, src: Fpr) {
        let (b, off) = self.mem(3, phys(base), offset);
        self.asm().str_d(fphys(src), b, off);
    }

    // ==================== control transfer ====================

    pub fn jmp(&mut self, label: Label) {
        self.asm().b_to(label);
    }

    pub fn jmpr(&mut self, target: Gpr) {
        self.asm().br(phys(target));
    }

    /// Compare and branch.
    pub fn brcmp(&mut self, cond: Cond, a: Gpr, b: Gpr, label: Label) {
        self.asm().cmp(phys(a), phys(b));
        self.asm().bcond_to(cond_of(cond), label);
    }

    pub fn brcmpi(&mut self, cond: Cond, a: Gpr, imm: i64, label: Label) {
        if (0..4096).contains(&imm) {
            self.asm().cmp_imm(phys(a), imm as u32);
        } else {
            self.load_imm(SCRATCH, imm as u64);
            self.asm().cmp(phys(a), SCRATCH);
        }
        self.asm().bcond_to(cond_of(cond), label);
    }

    pub fn call(&mut self, label: Label) {
        self.asm().bl_to(label);
    }

    pub fn callr(&mut self, target: Gpr) {
        self.asm().blr(phys(target));
    }

    /// Call an absolute native address through the scratch register.
    pub fn calli(&mut self, addr: usize) {
        self.load_imm(SCRATCH, addr as u64);
        self.asm().blr(SCRATCH);
    }

    pub fn ret(&mut self) {
        self.asm().ret();
    }

    pub fn retr(&mut self, src: Gpr) {
        self.asm().mov_rr(XReg(0), phys(src));
        self.asm().ret();
    }

    pub fn retr_f(&mut self, src: Fpr) {
        if fphys(src) != VReg(0) {
            self.asm().fmov_s(VReg(0), fphys(src));
        }
        self.asm().ret();
    }

    pub fn retr_d(&mut self, src: Fpr) {
        if fphys(src) != VReg(0) {
            self.asm().fmov_d(VReg(0), fphys(src));
        }
        self.asm().ret();
    }

    /// Capture the word return value of the last call.
    pub fn retval(&mut self, dst: Gpr) {
        self.asm().mov_rr(phys(dst), XReg(0));
    }

    pub fn retval_f(&mut self, dst: Fpr) {
        if fphys(dst) != VReg(0) {
            self.asm().fmov_s(fphys(dst), VReg(0));
        }
    }

    pub fn retval_d(&mut self, dst: Fpr) {
        if fphys(dst) != VReg(0) {
            self.asm().fmov_d(fphys(dst), VReg(0));
        }
    }

    /// Call a runtime intrinsic through its installed table entry.
    pub fn call_intrinsic(&mut self, table: &IntrinsicTable, which: Intrinsic) {
        self.calli(table.address(which));
    }

    // ==================== ABI adaptor ====================

    /// Native-ABI prologue: FP/LR pair, callee-saved spill area, 16-byte
    /// aligned local area. Returns the local-area adjustment that
    /// `leave_abi_frame` must undo.
    pub fn enter_abi_frame(
        &mut self,
        saved_gprs: &[Gpr],
        saved_fprs: &[Fpr],
        frame_size: usize,
    ) -> usize {
        let save_bytes = Self::save_area(saved_gprs, saved_fprs);
        let adjustment = (frame_size + 15) & !15;
        let mut asm = self.asm();
        asm.stp_pre(FP, LR, SP, -16);
        asm.mov_sp(FP, SP);
        if save_bytes > 0 {
            asm.sub_imm(SP, SP, save_bytes as u32);
            let mut slot = 0;
            for g in saved_gprs {
                asm.str(phys(*g), SP, slot);
                slot += 8;
            }
            for f in saved_fprs {
                asm.str_d(fphys(*f), SP, slot);
                slot += 8;
            }
        }
        if adjustment > 0 {
            let (hi, lo) = ((adjustment >> 12) as u32, (adjustment & 0xFFF) as u32);
            if hi > 0 {
                // wider frames in 4 KiB steps keep the imm12 field
                for _ in 0..hi {
                    asm.sub_imm(SP, SP, 4096 - 1);
                    asm.sub_imm(SP, SP, 1);
                }
            }
            if lo > 0 {
                asm.sub_imm(SP, SP, lo);
            }
        }
        adjustment
    }

    /// Exact inverse of `enter_abi_frame`.
    pub fn leave_abi_frame(&mut self, saved_gprs: &[Gpr], saved_fprs: &[Fpr], adjustment: usize) {
        let save_bytes = Self::save_area(saved_gprs, saved_fprs);
        let mut asm = self.asm();
        if adjustment > 0 {
            let (hi, lo) = ((adjustment >> 12) as u32, (adjustment & 0xFFF) as u32);
            if lo > 0 {
                asm.add_imm(SP, SP, lo);
            }
            for _ in 0..hi {
                asm.add_imm(SP, SP, 1);
                asm.add_imm(SP, SP, 4096 - 1);
            }
        }
        if save_bytes > 0 {
            let mut slot = 0;
            for g in saved_gprs {
                asm.ldr(phys(*g), SP, slot);
                slot += 8;
            }
            for f in saved_fprs {
                asm.ldr_d(fphys(*f), SP, slot);
                slot += 8;
            }
            asm.add_imm(SP, SP, save_bytes as u32);
        }
        asm.ldp_post(FP, LR, SP, 16);
    }

    fn save_area(saved_gprs: &[Gpr], saved_fprs: &[Fpr]) -> usize {
        ((saved_gprs.len() + saved_fprs.len()) * 8 + 15) & !15
    }

    /// Where the native convention put the given incoming parameters.
    pub fn receive_args(&self, params: &[AbiParam]) -> Vec<ArgLoc> {
        CALL_CONV.place_incoming(params)
    }

    /// Copy incoming arguments into the named logical registers. Stack
    /// arguments are frame-pointer relative, so this must run after
    /// `enter_abi_frame`.
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
                    words.push(PlannedMove::reg(*src, phys(*dst).0));
                }
                (Operand::AbiWord(dst), ArgLoc::Stack(off)) => {
                    words.push(PlannedMove::load(FP.0, *off, phys(*dst).0));
                }
                (Operand::AbiFloat(dst), ArgLoc::FloatReg(src)) => {
                    floats.push(PlannedMove::reg(*src, fphys(*dst).0));
                }
                (Operand::AbiFloat(dst), ArgLoc::Stack(off)) => {
                    floats.push(PlannedMove::load_foreign(FP.0, *off, fphys(*dst).0));
                }
                _ => debug_assert!(false, "operand/placement class mismatch"),
            }
        }
        self.run_float_plan(floats);
        self.run_word_plan(words);
    }

    fn run_word_plan(&mut self, moves: Vec<PlannedMove>) {
        for m in sequence_moves(moves, SCRATCH2.0) {
            let dst = XReg(m.dst);
            match (m.op, m.src) {
                (MoveOp::Reg, Some(src)) => self.asm().mov_rr(dst, XReg(src)),
                (MoveOp::Load { base, offset }, _) => self.asm().ldr(dst, XReg(base), offset),
                (MoveOp::Imm(value), _) => self.load_imm(dst, value as u64),
                _ => debug_assert!(false, "register move without source"),
            }
        }
    }

    fn run_float_plan(&mut self, moves: Vec<PlannedMove>) {
        for m in sequence_moves(moves, FSCRATCH.0) {
            let dst = VReg(m.dst);
            match (m.op, m.src) {
                (MoveOp::Reg, Some(src)) => self.asm().fmov_d(dst, VReg(src)),
                (MoveOp::Load { base, offset }, _) => self.asm().ldr_d(dst, XReg(base), offset),
                (MoveOp::Imm(bits), _) => {
                    self.load_imm(SCRATCH2, bits as u64);
                    self.asm().fmov_d_from_x(dst, SCRATCH2);
                }
                _ => debug_assert!(false, "register move without source"),
            }
        }
    }

    /// Marshal outgoing arguments and call a native function.
    pub fn call_native(&mut self, target: CallTarget, args: &[(AbiParam, Operand)]) {
        let params: Vec<AbiParam> = args.iter().map(|(p, _)| *p).collect();
        let locs = CALL_CONV.place_outgoing(&params);
        let stack_bytes = CALL_CONV.outgoing_stack_bytes(&params) as u32;

        // The target register could itself be an argument home.
        if let CallTarget::Reg(g) = target {
            self.asm().mov_rr(SCRATCH, phys(g));
        }
        if stack_bytes > 0 {
            self.asm().sub_imm(SP, SP, stack_bytes);
        }

        // Stack slots first, while every source register is still intact.
        for ((_, op), loc) in args.iter().zip(&locs) {
            let ArgLoc::Stack(off) = loc else { continue };
            match op {
                Operand::Gpr(g) => self.asm().str(phys(*g), SP, *off),
                Operand::Fpr(f) => self.asm().str_d(fphys(*f), SP, *off),
                Operand::Imm(v) => {
                    self.load_imm(SCRATCH2, *v as u64);
                    self.asm().str(SCRATCH2, SP, *off);
                }
                Operand::Uimm(v) => {
                    self.load_imm(SCRATCH2, *v);
                    self.asm().str(SCRATCH2, SP, *off);
                }
                Operand::FImm(v) => {
                    self.load_imm(SCRATCH2, v.to_bits());
                    self.asm().str(SCRATCH2, SP, *off);
                }
                Operand::Mem { base, offset } => {
                    let (b, o) = self.mem(3, phys(*base), *offset);
                    self.asm().ldr(SCRATCH2, b, o);
                    self.asm().str(SCRATCH2, SP, *off);
                }
                _ => debug_assert!(false, "ABI operands are not call arguments"),
            }
        }

        // Float registers before word registers: float loads read GPR
        // bases the word pass is still free to clobber afterwards.
        let mut floats = Vec::new();
        let mut words = Vec::new();
        for ((_, op), loc) in args.iter().zip(&locs) {
            match loc {
                ArgLoc::FloatReg(dst) => match op {
                    Operand::Fpr(f) => floats.push(PlannedMove::reg(fphys(*f).0, *dst)),
                    Operand::FImm(v) => floats.push(PlannedMove::imm(v.to_bits() as i64, *dst)),
                    Operand::Mem { base, offset } => {
                        floats.push(PlannedMove::load_foreign(phys(*base).0, *offset, *dst));
                    }
                    _ => debug_assert!(false, "float argument from a word operand"),
                },
                ArgLoc::WordReg(dst) => match op {
                    Operand::Gpr(g) => words.push(PlannedMove::reg(phys(*g).0, *dst)),
                    Operand::Imm(v) => words.push(PlannedMove::imm(*v, *dst)),
                    Operand::Uimm(v) => words.push(PlannedMove::imm(*v as i64, *dst)),
                    Operand::Mem { base, offset } => {
                        words.push(PlannedMove::load(phys(*base).0, *offset, *dst));
                    }
                    _ => debug_assert!(false, "word argument from a float operand"),
                },
                ArgLoc::Stack(_) => {}
            }
        }
        self.run_float_plan(floats);
        self.run_word_plan(words);

        match target {
            CallTarget::Addr(addr) => self.calli(addr),
            CallTarget::Reg(_) => self.asm().blr(SCRATCH),
        }
        if stack_bytes > 0 {
            self.asm().add_imm(SP, SP, stack_bytes);
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
    use crate::operand::{F0, F1, R0, R1, R2};

    fn words(e: &Emitter) -> Vec<u32> {
        e.code()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn movi_seeds_and_fills() {
        // 42: single movz x9, #42
        let mut e = Emitter::new();
        e.movi(R0, 42);
        assert_eq!(words(&e), vec![0xD280_0549]);

        // 0: movz x9, #0
        let mut e = Emitter::new();
        e.movi(R0, 0);
        assert_eq!(words(&e), vec![0xD280_0009]);

        // -1: movn x9, #0
        let mut e = Emitter::new();
        e.movi(R0, -1);
        assert_eq!(words(&e), vec![0x9280_0009]);

        // -2: one movn, no fills
        let mut e = Emitter::new();
        e.movi(R0, -2);
        assert_eq!(words(&e), vec![0x9280_0029]);

        // two nonzero halves: movz + movk
        let mut e = Emitter::new();
        e.movi(R0, 0x0001_0000_0000_002A);
        assert_eq!(words(&e), vec![0xD280_0549, 0xF2E0_0029]);
    }

    #[test]
    fn addi_folds_small_negatives_into_sub() {
        let mut e = Emitter::new();
        e.addi(R0, R1, -16);
        // sub x9, x10, #16
        assert_eq!(words(&e), vec![0xD100_4149]);
    }

    #[test]
    fn large_immediates_go_through_scratch() {
        let mut e = Emitter::new();
        e.addi(R0, R0, 123_456_789);
        let w = words(&e);
        // movz+movk into x16, then add x9, x9, x16
        assert_eq!(w.len(), 3);
        assert_eq!(w[2], 0x8B10_0129);
    }

    #[test]
    fn borrow_chain_materializes_flag_safe() {
        let mut e = Emitter::new();
        e.subcr(R0, R0, R1);
        e.subxi(R2, R2, 0);
        assert_eq!(
            words(&e),
            vec![
                0xEB0A_0129, // subs x9, x9, x10
                0xD280_0010, // movz x16, #0
                0xFA10_016B, // sbcs x11, x11, x16
            ]
        );
    }

    #[test]
    fn remainder_is_div_then_msub() {
        let mut e = Emitter::new();
        e.remr(R0, R1, R2);
        assert_eq!(
            words(&e),
            vec![
                0x9ACB_0D51, // sdiv x17, x10, x11
                0x9B0B_AA29, // msub x9, x17, x11, x10
            ]
        );
    }

    #[test]
    fn bitmask_and_falls_back_for_odd_masks() {
        let mut e = Emitter::new();
        e.andi(R0, R0, 0xFF);
        assert_eq!(words(&e).len(), 1);

        let mut e = Emitter::new();
        e.andi(R0, R0, 0xDEAD_BEEF);
        // not a bitmask: wide-move sequence plus register AND
        let w = words(&e);
        assert_eq!(*w.last().unwrap(), 0x8A10_0129);
    }

    #[test]
    fn out_of_range_offset_builds_address_in_scratch() {
        let mut e = Emitter::new();
        e.ldr_i64(R0, R1, 0x12345);
        let w = words(&e);
        // imm, add x17, x17, x10, then ldr x9, [x17]
        assert_eq!(*w.last().unwrap(), 0xF940_0229);
        assert_eq!(w[w.len() - 2], 0x8B0A_0231);
    }

    #[test]
    fn frame_round_trip_is_symmetric() {
        use crate::operand::{V0, V1};
        let mut e = Emitter::new();
        let adj = e.enter_abi_frame(&[V0, V1], &[], 24);
        assert_eq!(adj, 32);
        let before = e.code().len();
        e.leave_abi_frame(&[V0, V1], &[], adj);
        e.ret();
        assert!(e.code().len() > before);
        let w = words(&e);
        assert_eq!(w[0], 0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
        assert_eq!(w[w.len() - 2], 0xA8C1_7BFD); // ldp x29, x30, [sp], #16
        assert_eq!(*w.last().unwrap(), 0xD65F_03C0);
    }

    #[test]
    fn load_args_moves_from_abi_registers() {
        let mut e = Emitter::new();
        e.load_args(&[Operand::AbiWord(R0), Operand::AbiFloat(F0)]);
        let w = words(&e);
        // fmov d0, d0 is dropped by the planner; only x0 -> x9 remains
        assert_eq!(w, vec![0xAA00_03E9]);
    }

    #[test]
    fn float_argument_swap_routes_through_scratch() {
        let mut e = Emitter::new();
        e.call_native(
            CallTarget::Addr(0x1000),
            &[
                (AbiParam::Float, Operand::Fpr(F1)),
                (AbiParam::Float, Operand::Fpr(F0)),
            ],
        );
        let w = words(&e);
        assert_eq!(w[0], 0x1E60_4030); // fmov d16, d1
        assert_eq!(w[1], 0x1E60_4001); // fmov d1, d0
        assert_eq!(w[2], 0x1E60_4200); // fmov d0, d16
    }
}
