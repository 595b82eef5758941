//! lumojit - retargetable machine-code emission for an embedding runtime.
//!
//! Callers drive an architecture-neutral [`Emitter`] that maps logical
//! registers and portable mnemonics onto the host instruction set,
//! accumulates bytes in a [`CodeBuffer`], and finalizes into immutable
//! executable memory. The ABI adaptor marshals arguments between
//! generated code and native functions, including runtime intrinsics and
//! dynamically loaded symbols.

pub mod abi;
pub mod backend;
pub mod buffer;
pub mod emitter;
pub mod error;
pub mod intrinsics;
pub mod loader;
pub mod memory;
pub mod operand;

pub use abi::{AbiParam, ArgLoc};
pub use buffer::{CodeBuffer, Label};
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use emitter::Emitter;
pub use error::JitError;
pub use intrinsics::{Intrinsic, IntrinsicTable};
pub use loader::{LoaderError, NativeLibrary};
pub use memory::{ExecutableCode, ExecutableMemory};
pub use operand::{
    CallTarget, Cond, F0, F1, F2, F3, F4, F5, Fpr, Gpr, NUM_FPRS, NUM_GPRS, Operand, R0, R1, R2,
    V0, V1, V2,
};
