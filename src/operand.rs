//! Architecture-neutral operands and logical registers.
//!
//! Call sites describe registers by logical index; the active backend maps
//! them to physical encodings at emission time, so emission sequences are
//! portable across backends.

/// A logical general-purpose register.
///
/// `R0`..`R2` are temporaries (caller-saved in every backend's mapping);
/// `V0`..`V2` are preserved across native calls when spilled by
/// `enter_abi_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(pub(crate) u8);

/// A logical floating-point register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fpr(pub(crate) u8);

pub const R0: Gpr = Gpr(0);
pub const R1: Gpr = Gpr(1);
pub const R2: Gpr = Gpr(2);
pub const V0: Gpr = Gpr(3);
pub const V1: Gpr = Gpr(4);
pub const V2: Gpr = Gpr(5);

pub const F0: Fpr = Fpr(0);
pub const F1: Fpr = Fpr(1);
pub const F2: Fpr = Fpr(2);
pub const F3: Fpr = Fpr(3);
pub const F4: Fpr = Fpr(4);
pub const F5: Fpr = Fpr(5);

/// Number of logical general-purpose registers.
pub const NUM_GPRS: usize = 6;
/// Number of logical floating-point registers.
pub const NUM_FPRS: usize = 6;

impl Gpr {
    /// The logical index, `0..NUM_GPRS`.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Fpr {
    /// The logical index, `0..NUM_FPRS`.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A tagged operand for the emission API.
///
/// Each mnemonic accepts only specific kind combinations; passing the wrong
/// kind is a bug in the emitting caller and is checked with debug
/// assertions, not runtime errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// A general-purpose register value.
    Gpr(Gpr),
    /// A floating-point register value.
    Fpr(Fpr),
    /// A signed immediate.
    Imm(i64),
    /// An unsigned immediate.
    Uimm(u64),
    /// A floating immediate.
    FImm(f64),
    /// A memory location addressed as base register plus signed offset.
    Mem { base: Gpr, offset: i32 },
    /// An ABI word-class argument, naming the logical destination register.
    AbiWord(Gpr),
    /// An ABI float-class argument, naming the logical destination register.
    AbiFloat(Fpr),
}

/// A call target for indirect control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// An absolute native address (an intrinsic, a loaded symbol, or a
    /// previously finalized entry point).
    Addr(usize),
    /// An address held in a logical register.
    Reg(Gpr),
}

/// Portable comparison conditions for `brcmp`/`brcmpi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed less-than.
    Lt,
    /// Signed less-or-equal.
    Le,
    /// Signed greater-than.
    Gt,
    /// Signed greater-or-equal.
    Ge,
    /// Unsigned less-than.
    Ult,
    /// Unsigned less-or-equal.
    Ule,
    /// Unsigned greater-than.
    Ugt,
    /// Unsigned greater-or-equal.
    Uge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_indices_are_dense() {
        assert_eq!(R0.index(), 0);
        assert_eq!(V2.index(), NUM_GPRS - 1);
        assert_eq!(F0.index(), 0);
        assert_eq!(F5.index(), NUM_FPRS - 1);
    }
}
