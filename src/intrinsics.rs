//! Runtime intrinsics table.
//!
//! Generated code calls back into runtime services through a fixed table
//! of native addresses. The variant list below is the single source of
//! truth for indices and names; it is append-only so indices embedded in
//! already-emitted code stay valid across releases.

use std::ffi::c_void;

use log::debug;

macro_rules! intrinsics {
    ($(($variant:ident, $name:literal)),* $(,)?) => {
        /// A runtime service callable from generated code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(usize)]
        pub enum Intrinsic {
            $($variant),*
        }

        impl Intrinsic {
            pub const COUNT: usize = [$(Intrinsic::$variant),*].len();
            pub const ALL: [Intrinsic; Self::COUNT] = [$(Intrinsic::$variant),*];

            /// The stable table index.
            pub fn index(self) -> usize {
                self as usize
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Intrinsic::$variant => $name),*
                }
            }
        }
    };
}

intrinsics! {
    (Add, "add"),
    (Sub, "sub"),
    (Mul, "mul"),
    (Div, "div"),
    (Quo, "quo"),
    (Rem, "rem"),
    (Mod, "mod"),
    (LogAnd, "logand"),
    (LogIor, "logior"),
    (LogXor, "logxor"),
    (LogSub, "logsub"),
    (Lsh, "lsh"),
    (Rsh, "rsh"),
    (NumberToFloat, "number-to-float"),
    (FloatToNumber, "float-to-number"),
    (NumberToUword, "number-to-uword"),
    (UwordToNumber, "uword-to-number"),
    (NumberToSword, "number-to-sword"),
    (SwordToNumber, "sword-to-number"),
    (PushFluid, "push-fluid"),
    (PopFluid, "pop-fluid"),
    (FluidRef, "fluid-ref"),
    (FluidSet, "fluid-set"),
    (PushDynamicState, "push-dynamic-state"),
    (PopDynamicState, "pop-dynamic-state"),
    (Wind, "wind"),
    (Unwind, "unwind"),
    (CaptureContinuation, "capture-continuation"),
    (ReinstateContinuation, "reinstate-continuation"),
    (ComposeContinuation, "compose-continuation"),
}

/// Addresses of the runtime services, indexed by [`Intrinsic`].
///
/// Populated once during runtime startup and read-only thereafter; the
/// emission core only ever reads it.
pub struct IntrinsicTable {
    entries: [usize; Intrinsic::COUNT],
}

impl IntrinsicTable {
    pub const fn new() -> Self {
        Self {
            entries: [0; Intrinsic::COUNT],
        }
    }

    /// Register the native address of one intrinsic.
    pub fn install(&mut self, which: Intrinsic, addr: *const c_void) {
        debug!("intrinsic {} at {:p}", which.name(), addr);
        self.entries[which.index()] = addr as usize;
    }

    /// The installed address. Zero means the runtime never installed the
    /// entry; calling through it is the installer's bug, not checked here.
    pub fn address(&self, which: Intrinsic) -> usize {
        self.entries[which.index()]
    }

    /// Base of the table, for code that indexes it at run time.
    pub fn base_ptr(&self) -> *const usize {
        self.entries.as_ptr()
    }
}

impl Default for IntrinsicTable {
    fn default() -> Self {
        Self::new()
    }
}
