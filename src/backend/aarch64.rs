//! AArch64 (A64) instruction encoding.
//!
//! Every instruction is one little-endian 32-bit word. The encoders here
//! are byte-level only; operand synthesis (immediate expansion, offset
//! range splitting) happens in the emitter layer.

use crate::buffer::{CodeBuffer, Label, PatchKind};

/// A general-purpose register number. 31 encodes XZR or SP depending on
/// the instruction; the named constants below keep call sites readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XReg(pub u8);

/// A SIMD/FP register number (V0-V31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VReg(pub u8);

pub const FP: XReg = XReg(29);
pub const LR: XReg = XReg(30);
pub const SP: XReg = XReg(31);
pub const XZR: XReg = XReg(31);

impl XReg {
    fn field(self, shift: u32) -> u32 {
        ((self.0 & 0x1F) as u32) << shift
    }
}

impl VReg {
    fn field(self, shift: u32) -> u32 {
        ((self.0 & 0x1F) as u32) << shift
    }
}

/// A64 condition codes (for B.cond).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum A64Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
}

/// An encoded logical (bitmask) immediate: a run of ones of one element
/// size, rotated, replicated to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalImm {
    n: u32,
    immr: u32,
    imms: u32,
}

impl LogicalImm {
    /// Encode `value` as a 64-bit bitmask immediate, if representable.
    /// All-zero and all-one values have no encoding.
    pub fn encode(value: u64) -> Option<LogicalImm> {
        if value == 0 || value == u64::MAX {
            return None;
        }
        // Shrink to the smallest element size whose replication gives the
        // full value.
        let mut size = 64u32;
        while size > 2 {
            let half = size / 2;
            let mask = (1u64 << half) - 1;
            if (value & mask) != ((value >> half) & mask) {
                break;
            }
            size = half;
        }
        let mask = if size == 64 {
            u64::MAX
        } else {
            (1u64 << size) - 1
        };
        let elem = value & mask;
        let ones = elem.count_ones();
        if ones == 0 || ones == size {
            return None;
        }
        let run = (1u64 << ones) - 1;
        let ror = |v: u64, r: u32| {
            if r == 0 {
                v
            } else {
                ((v >> r) | (v << (size - r))) & mask
            }
        };
        for r in 0..size {
            if ror(run, r) == elem {
                return Some(LogicalImm {
                    n: (size == 64) as u32,
                    immr: r,
                    imms: (!(2 * size - 1) & 0x3F) | (ones - 1),
                });
            }
        }
        None
    }

    fn fields(self) -> u32 {
        (self.n << 22) | (self.immr << 16) | (self.imms << 10)
    }
}

/// A64 assembler over a code buffer.
pub struct Asm<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Asm<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn emit(&mut self, word: u32) {
        self.buf.emit_u32(word);
    }

    // ==================== wide moves ====================

    fn movewide(&mut self, opcode: u32, dst: XReg, imm16: u16, shift: u32) {
        debug_assert!(shift % 16 == 0 && shift < 64);
        self.emit(opcode | ((shift / 16) << 21) | ((imm16 as u32) << 5) | dst.field(0));
    }

    /// MOVZ Xd, #imm16, LSL #shift
    pub fn movz(&mut self, dst: XReg, imm16: u16, shift: u32) {
        self.movewide(0xD280_0000, dst, imm16, shift);
    }

    /// MOVN Xd, #imm16, LSL #shift
    pub fn movn(&mut self, dst: XReg, imm16: u16, shift: u32) {
        self.movewide(0x9280_0000, dst, imm16, shift);
    }

    /// MOVK Xd, #imm16, LSL #shift
    pub fn movk(&mut self, dst: XReg, imm16: u16, shift: u32) {
        self.movewide(0xF280_0000, dst, imm16, shift);
    }

    /// MOV Xd, Xm (alias of ORR with XZR)
    pub fn mov_rr(&mut self, dst: XReg, src: XReg) {
        self.emit(0xAA00_03E0 | src.field(16) | dst.field(0));
    }

    /// MOV to/from SP (alias of ADD #0, which treats 31 as SP)
    pub fn mov_sp(&mut self, dst: XReg, src: XReg) {
        self.emit(0x9100_0000 | src.field(5) | dst.field(0));
    }

    // ==================== register ALU ====================

    fn alu_rrr(&mut self, opcode: u32, dst: XReg, lhs: XReg, rhs: XReg) {
        self.emit(opcode | rhs.field(16) | lhs.field(5) | dst.field(0));
    }

    pub fn add(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x8B00_0000, dst, lhs, rhs);
    }

    pub fn adds(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xAB00_0000, dst, lhs, rhs);
    }

    pub fn sub(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xCB00_0000, dst, lhs, rhs);
    }

    pub fn subs(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xEB00_0000, dst, lhs, rhs);
    }

    /// ADC: dst = lhs + rhs + C
    pub fn adc(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x9A00_0000, dst, lhs, rhs);
    }

    pub fn adcs(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xBA00_0000, dst, lhs, rhs);
    }

    /// SBC: dst = lhs - rhs - NOT(C)
    pub fn sbc(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xDA00_0000, dst, lhs, rhs);
    }

    pub fn sbcs(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xFA00_0000, dst, lhs, rhs);
    }

    pub fn and(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x8A00_0000, dst, lhs, rhs);
    }

    pub fn ands(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xEA00_0000, dst, lhs, rhs);
    }

    pub fn orr(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xAA00_0000, dst, lhs, rhs);
    }

    pub fn eor(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0xCA00_0000, dst, lhs, rhs);
    }

    /// MVN Xd, Xm (alias of ORN with XZR)
    pub fn mvn(&mut self, dst: XReg, src: XReg) {
        self.emit(0xAA20_03E0 | src.field(16) | dst.field(0));
    }

    /// NEG Xd, Xm (alias of SUB from XZR)
    pub fn neg(&mut self, dst: XReg, src: XReg) {
        self.emit(0xCB00_03E0 | src.field(16) | dst.field(0));
    }

    /// MUL (alias of MADD with XZR accumulator)
    pub fn mul(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.emit(0x9B00_7C00 | rhs.field(16) | lhs.field(5) | dst.field(0));
    }

    /// MSUB: dst = acc - lhs * rhs
    pub fn msub(&mut self, dst: XReg, lhs: XReg, rhs: XReg, acc: XReg) {
        self.emit(0x9B00_8000 | rhs.field(16) | acc.field(10) | lhs.field(5) | dst.field(0));
    }

    pub fn sdiv(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x9AC0_0C00, dst, lhs, rhs);
    }

    pub fn udiv(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x9AC0_0800, dst, lhs, rhs);
    }

    /// CMP Xn, Xm (alias of SUBS into XZR)
    pub fn cmp(&mut self, lhs: XReg, rhs: XReg) {
        self.subs(XZR, lhs, rhs);
    }

    // ==================== immediate ALU ====================

    fn addsub_imm(&mut self, opcode: u32, dst: XReg, src: XReg, imm: u32) {
        debug_assert!(imm < 4096);
        self.emit(opcode | (imm << 10) | src.field(5) | dst.field(0));
    }

    /// ADD Xd, Xn, #imm12 (treats register 31 as SP)
    pub fn add_imm(&mut self, dst: XReg, src: XReg, imm: u32) {
        self.addsub_imm(0x9100_0000, dst, src, imm);
    }

    pub fn adds_imm(&mut self, dst: XReg, src: XReg, imm: u32) {
        self.addsub_imm(0xB100_0000, dst, src, imm);
    }

    /// SUB Xd, Xn, #imm12 (treats register 31 as SP)
    pub fn sub_imm(&mut self, dst: XReg, src: XReg, imm: u32) {
        self.addsub_imm(0xD100_0000, dst, src, imm);
    }

    pub fn subs_imm(&mut self, dst: XReg, src: XReg, imm: u32) {
        self.addsub_imm(0xF100_0000, dst, src, imm);
    }

    pub fn cmp_imm(&mut self, lhs: XReg, imm: u32) {
        self.subs_imm(XZR, lhs, imm);
    }

    fn logical_imm(&mut self, opcode: u32, dst: XReg, src: XReg, imm: LogicalImm) {
        self.emit(opcode | imm.fields() | src.field(5) | dst.field(0));
    }

    pub fn and_imm(&mut self, dst: XReg, src: XReg, imm: LogicalImm) {
        self.logical_imm(0x9200_0000, dst, src, imm);
    }

    pub fn orr_imm(&mut self, dst: XReg, src: XReg, imm: LogicalImm) {
        self.logical_imm(0xB200_0000, dst, src, imm);
    }

    pub fn eor_imm(&mut self, dst: XReg, src: XReg, imm: LogicalImm) {
        self.logical_imm(0xD200_0000, dst, src, imm);
    }

    pub fn ands_imm(&mut self, dst: XReg, src: XReg, imm: LogicalImm) {
        self.logical_imm(0xF200_0000, dst, src, imm);
    }

    // ==================== shifts ====================

    pub fn lslv(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x9AC0_2000, dst, lhs, rhs);
    }

    pub fn lsrv(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x9AC0_2400, dst, lhs, rhs);
    }

    pub fn asrv(&mut self, dst: XReg, lhs: XReg, rhs: XReg) {
        self.alu_rrr(0x9AC0_2800, dst, lhs, rhs);
    }

    fn bitfield(&mut self, opcode: u32, dst: XReg, src: XReg, immr: u32, imms: u32) {
        self.emit(opcode | (immr << 16) | (imms << 10) | src.field(5) | dst.field(0));
    }

    /// LSL Xd, Xn, #shift (alias of UBFM)
    pub fn lsl_imm(&mut self, dst: XReg, src: XReg, shift: u32) {
        debug_assert!(shift < 64);
        self.bitfield(0xD340_0000, dst, src, (64 - shift) % 64, 63 - shift);
    }

    /// LSR Xd, Xn, #shift (alias of UBFM)
    pub fn lsr_imm(&mut self, dst: XReg, src: XReg, shift: u32) {
        debug_assert!(shift < 64);
        self.bitfield(0xD340_0000, dst, src, shift, 63);
    }

    /// ASR Xd, Xn, #shift (alias of SBFM)
    pub fn asr_imm(&mut self, dst: XReg, src: XReg, shift: u32) {
        debug_assert!(shift < 64);
        self.bitfield(0x9340_0000, dst, src, shift, 63);
    }

    // ==================== loads and stores ====================

    /// Scaled unsigned-offset form when the offset allows it, otherwise the
    /// unscaled signed-9-bit form. The emitter keeps offsets within the
    /// combined range.
    fn ldst(&mut self, scaled: u32, unscaled: u32, scale: u32, rt: u32, rn: XReg, offset: i32) {
        let unit = 1i32 << scale;
        if offset >= 0 && offset % unit == 0 && (offset >> scale) < 4096 {
            self.emit(scaled | (((offset >> scale) as u32) << 10) | rn.field(5) | rt);
        } else {
            debug_assert!((-256..256).contains(&offset), "unscaled offset out of range");
            self.emit(unscaled | (((offset as u32) & 0x1FF) << 12) | rn.field(5) | rt);
        }
    }

    /// LDR Xt, [Xn, #offset]
    pub fn ldr(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0xF940_0000, 0xF840_0000, 3, rt.field(0), rn, offset);
    }

    /// STR Xt, [Xn, #offset]
    pub fn str(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0xF900_0000, 0xF800_0000, 3, rt.field(0), rn, offset);
    }

    /// LDR Wt (32-bit zero-extending load)
    pub fn ldr32(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0xB940_0000, 0xB840_0000, 2, rt.field(0), rn, offset);
    }

    /// LDRSW Xt (32-bit sign-extending load)
    pub fn ldrsw(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0xB980_0000, 0xB880_0000, 2, rt.field(0), rn, offset);
    }

    /// STR Wt
    pub fn str32(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0xB900_0000, 0xB800_0000, 2, rt.field(0), rn, offset);
    }

    /// LDRH Wt (16-bit zero-extending load)
    pub fn ldrh(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0x7940_0000, 0x7840_0000, 1, rt.field(0), rn, offset);
    }

    /// LDRSH Xt (16-bit sign-extending load)
    pub fn ldrsh(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0x7980_0000, 0x7880_0000, 1, rt.field(0), rn, offset);
    }

    /// STRH Wt
    pub fn strh(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0x7900_0000, 0x7800_0000, 1, rt.field(0), rn, offset);
    }

    /// LDRB Wt (8-bit zero-extending load)
    pub fn ldrb(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0x3940_0000, 0x3840_0000, 0, rt.field(0), rn, offset);
    }

    /// LDRSB Xt (8-bit sign-extending load)
    pub fn ldrsb(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0x3980_0000, 0x3880_0000, 0, rt.field(0), rn, offset);
    }

    /// STRB Wt
    pub fn strb(&mut self, rt: XReg, rn: XReg, offset: i32) {
        self.ldst(0x3900_0000, 0x3800_0000, 0, rt.field(0), rn, offset);
    }

    /// LDR St (32-bit float load)
    pub fn ldr_s(&mut self, vt: VReg, rn: XReg, offset: i32) {
        self.ldst(0xBD40_0000, 0xBC40_0000, 2, vt.field(0), rn, offset);
    }

    /// STR St
    pub fn str_s(&mut self, vt: VReg, rn: XReg, offset: i32) {
        self.ldst(0xBD00_0000, 0xBC00_0000, 2, vt.field(0), rn, offset);
    }

    /// LDR Dt (64-bit float load)
    pub fn ldr_d(&mut self, vt: VReg, rn: XReg, offset: i32) {
        self.ldst(0xFD40_0000, 0xFC40_0000, 3, vt.field(0), rn, offset);
    }

    /// STR Dt
    pub fn str_d(&mut self, vt: VReg, rn: XReg, offset: i32) {
        self.ldst(0xFD00_0000, 0xFC00_0000, 3, vt.field(0), rn, offset);
    }

    /// STP Xt1, Xt2, [Xn, #offset]! (pre-index)
    pub fn stp_pre(&mut self, rt1: XReg, rt2: XReg, rn: XReg, offset: i32) {
        debug_assert!(offset % 8 == 0 && (-512..512).contains(&offset));
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.emit(0xA980_0000 | (imm7 << 15) | rt2.field(10) | rn.field(5) | rt1.field(0));
    }

    /// LDP Xt1, Xt2, [Xn], #offset (post-index)
    pub fn ldp_post(&mut self, rt1: XReg, rt2: XReg, rn: XReg, offset: i32) {
        debug_assert!(offset % 8 == 0 && (-512..512).contains(&offset));
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.emit(0xA8C0_0000 | (imm7 << 15) | rt2.field(10) | rn.field(5) | rt1.field(0));
    }

    // ==================== branches ====================

    /// B to a label (26-bit word-scaled field, patched at finalization).
    pub fn b_to(&mut self, label: Label) {
        self.buf
            .emit_patchable(PatchKind::A64Branch26, label, 0x1400_0000);
    }

    /// BL to a label.
    pub fn bl_to(&mut self, label: Label) {
        self.buf
            .emit_patchable(PatchKind::A64Branch26, label, 0x9400_0000);
    }

    /// B.cond to a label (19-bit word-scaled field).
    pub fn bcond_to(&mut self, cond: A64Cond, label: Label) {
        self.buf
            .emit_patchable(PatchKind::A64Branch19, label, 0x5400_0000 | cond as u32);
    }

    /// CBZ Xt, label
    pub fn cbz_to(&mut self, rt: XReg, label: Label) {
        self.buf
            .emit_patchable(PatchKind::A64Branch19, label, 0xB400_0000 | rt.field(0));
    }

    /// CBNZ Xt, label
    pub fn cbnz_to(&mut self, rt: XReg, label: Label) {
        self.buf
            .emit_patchable(PatchKind::A64Branch19, label, 0xB500_0000 | rt.field(0));
    }

    /// BR Xn
    pub fn br(&mut self, rn: XReg) {
        self.emit(0xD61F_0000 | rn.field(5));
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: XReg) {
        self.emit(0xD63F_0000 | rn.field(5));
    }

    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }

    pub fn nop(&mut self) {
        self.emit(0xD503_201F);
    }

    // ==================== scalar float ====================

    fn fp_rrr(&mut self, opcode: u32, dst: VReg, lhs: VReg, rhs: VReg) {
        self.emit(opcode | rhs.field(16) | lhs.field(5) | dst.field(0));
    }

    pub fn fmov_s(&mut self, dst: VReg, src: VReg) {
        self.emit(0x1E20_4000 | src.field(5) | dst.field(0));
    }

    pub fn fmov_d(&mut self, dst: VReg, src: VReg) {
        self.emit(0x1E60_4000 | src.field(5) | dst.field(0));
    }

    pub fn fadd_s(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E20_2800, dst, lhs, rhs);
    }

    pub fn fsub_s(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E20_3800, dst, lhs, rhs);
    }

    pub fn fmul_s(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E20_0800, dst, lhs, rhs);
    }

    pub fn fdiv_s(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E20_1800, dst, lhs, rhs);
    }

    pub fn fadd_d(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E60_2800, dst, lhs, rhs);
    }

    pub fn fsub_d(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E60_3800, dst, lhs, rhs);
    }

    pub fn fmul_d(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E60_0800, dst, lhs, rhs);
    }

    pub fn fdiv_d(&mut self, dst: VReg, lhs: VReg, rhs: VReg) {
        self.fp_rrr(0x1E60_1800, dst, lhs, rhs);
    }

    /// FMOV Xd, Dn (move the raw 64 bits out of a float register)
    pub fn fmov_x_from_d(&mut self, dst: XReg, src: VReg) {
        self.emit(0x9E66_0000 | src.field(5) | dst.field(0));
    }

    /// FMOV Dd, Xn
    pub fn fmov_d_from_x(&mut self, dst: VReg, src: XReg) {
        self.emit(0x9E67_0000 | src.field(5) | dst.field(0));
    }

    /// FMOV Wd, Sn
    pub fn fmov_w_from_s(&mut self, dst: XReg, src: VReg) {
        self.emit(0x1E26_0000 | src.field(5) | dst.field(0));
    }

    /// FMOV Sd, Wn
    pub fn fmov_s_from_w(&mut self, dst: VReg, src: XReg) {
        self.emit(0x1E27_0000 | src.field(5) | dst.field(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(f: impl FnOnce(&mut Asm)) -> u32 {
        let mut buf = CodeBuffer::new();
        let mut asm = Asm::new(&mut buf);
        f(&mut asm);
        assert_eq!(buf.len(), 4);
        u32::from_le_bytes(buf.code()[0..4].try_into().unwrap())
    }

    #[test]
    fn wide_moves() {
        // movz x0, #42
        assert_eq!(word(|a| a.movz(XReg(0), 42, 0)), 0xD280_0540);
        // movk x0, #1, lsl #16
        assert_eq!(word(|a| a.movk(XReg(0), 1, 16)), 0xF2A0_0020);
        // movn x0, #0
        assert_eq!(word(|a| a.movn(XReg(0), 0, 0)), 0x9280_0000);
    }

    #[test]
    fn register_moves() {
        // mov x0, x1
        assert_eq!(word(|a| a.mov_rr(XReg(0), XReg(1))), 0xAA01_03E0);
        // mov x29, sp
        assert_eq!(word(|a| a.mov_sp(FP, SP)), 0x9100_03FD);
    }

    #[test]
    fn register_alu() {
        // add x0, x1, x2
        assert_eq!(word(|a| a.add(XReg(0), XReg(1), XReg(2))), 0x8B02_0020);
        // subs x0, x1, x2
        assert_eq!(word(|a| a.subs(XReg(0), XReg(1), XReg(2))), 0xEB02_0020);
        // cmp x0, x1
        assert_eq!(word(|a| a.cmp(XReg(0), XReg(1))), 0xEB01_001F);
        // mul x0, x1, x2
        assert_eq!(word(|a| a.mul(XReg(0), XReg(1), XReg(2))), 0x9B02_7C20);
        // sdiv x0, x1, x2
        assert_eq!(word(|a| a.sdiv(XReg(0), XReg(1), XReg(2))), 0x9AC2_0C20);
        // msub x0, x1, x2, x3
        assert_eq!(
            word(|a| a.msub(XReg(0), XReg(1), XReg(2), XReg(3))),
            0x9B02_8C20
        );
        // neg x0, x1
        assert_eq!(word(|a| a.neg(XReg(0), XReg(1))), 0xCB01_03E0);
    }

    #[test]
    fn carry_chain() {
        // adc x0, x1, x2
        assert_eq!(word(|a| a.adc(XReg(0), XReg(1), XReg(2))), 0x9A02_0020);
        // sbcs x0, x1, x2
        assert_eq!(word(|a| a.sbcs(XReg(0), XReg(1), XReg(2))), 0xFA02_0020);
    }

    #[test]
    fn immediate_addsub() {
        // sub sp, sp, #32
        assert_eq!(word(|a| a.sub_imm(SP, SP, 32)), 0xD100_83FF);
        // add x0, x1, #1
        assert_eq!(word(|a| a.add_imm(XReg(0), XReg(1), 1)), 0x9100_0420);
    }

    #[test]
    fn bitmask_immediates() {
        // and x0, x0, #0xff
        let imm = LogicalImm::encode(0xFF).unwrap();
        assert_eq!(word(|a| a.and_imm(XReg(0), XReg(0), imm)), 0x9240_1C00);
        // 0x7fffffff: run of 31 ones, rotation 0
        assert!(LogicalImm::encode(0x7FFF_FFFF).is_some());
        // alternating bits replicate down to a 2-bit element
        assert!(LogicalImm::encode(0xAAAA_AAAA_AAAA_AAAA).is_some());
        // not encodable
        assert!(LogicalImm::encode(0).is_none());
        assert!(LogicalImm::encode(u64::MAX).is_none());
        assert!(LogicalImm::encode(0xDEAD_BEEF).is_none());
    }

    #[test]
    fn shifts() {
        // lsl x0, x1, #4
        assert_eq!(word(|a| a.lsl_imm(XReg(0), XReg(1), 4)), 0xD37C_EC20);
        // lsr x0, x1, #4
        assert_eq!(word(|a| a.lsr_imm(XReg(0), XReg(1), 4)), 0xD344_FC20);
        // asr x0, x1, #4
        assert_eq!(word(|a| a.asr_imm(XReg(0), XReg(1), 4)), 0x9344_FC20);
    }

    #[test]
    fn scaled_and_unscaled_offsets() {
        // ldr x0, [x1, #8]
        assert_eq!(word(|a| a.ldr(XReg(0), XReg(1), 8)), 0xF940_0420);
        // str x0, [x1]
        assert_eq!(word(|a| a.str(XReg(0), XReg(1), 0)), 0xF900_0020);
        // ldur x0, [x1, #-8]
        assert_eq!(word(|a| a.ldr(XReg(0), XReg(1), -8)), 0xF85F_8020);
        // unaligned offset falls back to the unscaled form
        assert_eq!(word(|a| a.ldr(XReg(0), XReg(1), 9)), 0xF840_9020);
    }

    #[test]
    fn narrow_loads_extend() {
        // ldrb w0, [x1]
        assert_eq!(word(|a| a.ldrb(XReg(0), XReg(1), 0)), 0x3940_0020);
        // ldrsb x0, [x1]
        assert_eq!(word(|a| a.ldrsb(XReg(0), XReg(1), 0)), 0x3980_0020);
        // ldrsw x0, [x1]
        assert_eq!(word(|a| a.ldrsw(XReg(0), XReg(1), 0)), 0xB980_0020);
        // strh w0, [x1]
        assert_eq!(word(|a| a.strh(XReg(0), XReg(1), 0)), 0x7900_0020);
    }

    #[test]
    fn float_loads_scale_by_width() {
        // ldr s0, [x1, #4]
        assert_eq!(word(|a| a.ldr_s(VReg(0), XReg(1), 4)), 0xBD40_0420);
        // str d0, [x1, #8]
        assert_eq!(word(|a| a.str_d(VReg(0), XReg(1), 8)), 0xFD00_0420);
    }

    #[test]
    fn frame_pairs() {
        // stp x29, x30, [sp, #-16]!
        assert_eq!(word(|a| a.stp_pre(FP, LR, SP, -16)), 0xA9BF_7BFD);
        // ldp x29, x30, [sp], #16
        assert_eq!(word(|a| a.ldp_post(FP, LR, SP, 16)), 0xA8C1_7BFD);
    }

    #[test]
    fn branches() {
        assert_eq!(word(|a| a.br(XReg(16))), 0xD61F_0200);
        assert_eq!(word(|a| a.blr(XReg(16))), 0xD63F_0200);
        assert_eq!(word(|a| a.ret()), 0xD65F_03C0);
        assert_eq!(word(|a| a.nop()), 0xD503_201F);
    }

    #[test]
    fn branch_fields_patch_word_scaled() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        {
            let mut asm = Asm::new(&mut buf);
            asm.b_to(l);
            asm.nop();
        }
        buf.bind(l);
        buf.resolve_patches().unwrap();
        let b = u32::from_le_bytes(buf.code()[0..4].try_into().unwrap());
        assert_eq!(b, 0x1400_0000 | 2);

        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.bind(l);
        {
            let mut asm = Asm::new(&mut buf);
            asm.nop();
            asm.bcond_to(A64Cond::Ne, l);
        }
        buf.resolve_patches().unwrap();
        let bc = u32::from_le_bytes(buf.code()[4..8].try_into().unwrap());
        assert_eq!(bc, 0x5400_0000 | ((-1i32 as u32 & 0x7FFFF) << 5) | 1);
    }

    #[test]
    fn float_arithmetic() {
        // fadd d0, d1, d2
        assert_eq!(word(|a| a.fadd_d(VReg(0), VReg(1), VReg(2))), 0x1E62_2820);
        // fmul s0, s1, s2
        assert_eq!(word(|a| a.fmul_s(VReg(0), VReg(1), VReg(2))), 0x1E22_0820);
        // fmov d0, d1
        assert_eq!(word(|a| a.fmov_d(VReg(0), VReg(1))), 0x1E60_4020);
    }

    #[test]
    fn gpr_fpr_transfers() {
        // fmov x0, d0
        assert_eq!(word(|a| a.fmov_x_from_d(XReg(0), VReg(0))), 0x9E66_0000);
        // fmov d0, x0
        assert_eq!(word(|a| a.fmov_d_from_x(VReg(0), XReg(0))), 0x9E67_0000);
        // fmov s0, w0
        assert_eq!(word(|a| a.fmov_s_from_w(VReg(0), XReg(0))), 0x1E27_0000);
    }
}
