//! Error types for code emission and finalization.

use thiserror::Error;

use crate::buffer::Label;

/// Errors surfaced while building or finalizing a code buffer.
///
/// Operand-kind misuse (for example handing a float register to an integer
/// mnemonic) is a programmer error checked with debug assertions, not a
/// variant here.
#[derive(Debug, Error)]
pub enum JitError {
    /// A label was used as a branch or call target but never bound to an
    /// offset before finalization.
    #[error("label {0:?} was used but never bound")]
    UnboundLabel(Label),

    /// A resolved displacement does not fit the field reserved for it.
    #[error("branch displacement out of range for patch at offset {at:#x}")]
    BranchOutOfRange { at: usize },

    /// Finalizing a buffer with no emitted code.
    #[error("cannot finalize an empty code buffer")]
    EmptyBuffer,

    /// The executable region could not be allocated.
    #[error("executable memory allocation failed")]
    AllocationFailed,

    /// The writable-to-executable protection flip failed.
    #[error("memory protection change failed")]
    ProtectionFailed,
}
