//! Growable code buffer with labels and pending patches.
//!
//! The buffer owns the bytes of a function under construction. Positions
//! inside it are identified by logical offsets, never raw addresses: growth
//! may relocate the backing storage at any time, and only `finalize` pins
//! the bytes to an executable address.

use log::{debug, trace};

use crate::error::JitError;
use crate::memory::{ExecutableCode, ExecutableMemory};

/// An opaque handle for a deferred position in the output.
///
/// Lifecycle: declared by [`CodeBuffer::new_label`], referenced by any
/// number of pending patches, then bound to a concrete offset with
/// [`CodeBuffer::bind`]. Every referenced label must be bound before
/// finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

/// Relocation kinds understood by the patch manager.
///
/// Forward references always reserve the widest form their kind allows, so
/// instruction addresses are fixed from the moment of emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchKind {
    /// 32-bit displacement relative to the end of the field (x86-64).
    Rel32,
    /// 26-bit word-scaled branch field in bits 25:0 (AArch64 B/BL).
    A64Branch26,
    /// 19-bit word-scaled branch field in bits 23:5 (AArch64 B.cond/CBZ).
    A64Branch19,
}

#[derive(Debug, Clone, Copy)]
struct Patch {
    /// Offset of the patched field (`Rel32`) or instruction word (AArch64).
    at: usize,
    kind: PatchKind,
    target: Label,
}

/// A byte buffer for machine code under construction.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Bound offset per label index; `None` while only declared.
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Open a buffer with a capacity hint. The hint is advisory; emission
    /// grows the region as needed.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// The current write cursor as a stable logical offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Guarantee space for `n` more bytes, growing (and possibly
    /// relocating) the backing region first.
    pub fn reserve(&mut self, n: usize) {
        self.code.reserve(n);
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Pad with `fill` bytes up to the given power-of-two boundary.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        debug_assert!(alignment.is_power_of_two());
        while self.code.len() & (alignment - 1) != 0 {
            self.code.push(fill);
        }
    }

    /// Declare a label with no offset yet.
    pub fn new_label(&mut self) -> Label {
        let handle = Label(self.labels.len() as u32);
        self.labels.push(None);
        handle
    }

    /// Bind a label to the current offset.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        debug_assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.code.len());
    }

    /// The bound offset of a label, if it has one.
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels[label.0 as usize]
    }

    /// Record a pending patch at the current offset and emit its
    /// placeholder word. For `Rel32` the placeholder is the 4-byte field
    /// itself; for the AArch64 kinds it is the full instruction with a
    /// zeroed immediate field.
    pub(crate) fn emit_patchable(&mut self, kind: PatchKind, target: Label, placeholder: u32) {
        self.patches.push(Patch {
            at: self.code.len(),
            kind,
            target,
        });
        self.emit_u32(placeholder);
    }

    fn read_u32_at(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.code[at..at + 4].try_into().unwrap())
    }

    /// Raw field rewrite for the patch manager.
    fn patch_u32_at(&mut self, at: usize, value: u32) {
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Resolve all pending patches to their final field values.
    ///
    /// Runs as an explicit fixed-point loop: instruction addresses were
    /// fixed at emission time (forward references reserved their widest
    /// form), so field widths cannot change and the loop converges after a
    /// single writing pass; the bound of `patches + 1` passes is the
    /// termination guarantee, not an expected iteration count.
    pub(crate) fn resolve_patches(&mut self) -> Result<(), JitError> {
        let mut passes = 0usize;
        loop {
            let mut changed = false;
            for i in 0..self.patches.len() {
                let Patch { at, kind, target } = self.patches[i];
                let target_off = self
                    .label_offset(target)
                    .ok_or(JitError::UnboundLabel(target))?;
                let old = self.read_u32_at(at);
                let new = match kind {
                    PatchKind::Rel32 => {
                        let disp = target_off as i64 - (at as i64 + 4);
                        if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
                            return Err(JitError::BranchOutOfRange { at });
                        }
                        disp as i32 as u32
                    }
                    PatchKind::A64Branch26 => {
                        let words = (target_off as i64 - at as i64) / 4;
                        if !(-(1 << 25)..(1 << 25)).contains(&words) {
                            return Err(JitError::BranchOutOfRange { at });
                        }
                        (old & 0xFC00_0000) | (words as u32 & 0x03FF_FFFF)
                    }
                    PatchKind::A64Branch19 => {
                        let words = (target_off as i64 - at as i64) / 4;
                        if !(-(1 << 18)..(1 << 18)).contains(&words) {
                            return Err(JitError::BranchOutOfRange { at });
                        }
                        (old & 0xFF00_001F) | ((words as u32 & 0x7FFFF) << 5)
                    }
                };
                if new != old {
                    self.patch_u32_at(at, new);
                    changed = true;
                }
            }
            passes += 1;
            if !changed {
                break;
            }
            debug_assert!(
                passes <= self.patches.len() + 1,
                "patch resolution failed to reach a fixed point"
            );
        }
        trace!(
            "resolved {} patches in {} pass(es)",
            self.patches.len(),
            passes
        );
        Ok(())
    }

    /// One-way transition from writable to executable.
    ///
    /// Resolves all pending patches, copies the bytes into an executable
    /// region, flips its protection, and synchronizes the instruction
    /// cache where the architecture requires it. A used-but-unbound label
    /// is a consistency violation reported as [`JitError::UnboundLabel`].
    pub fn finalize(mut self) -> Result<ExecutableCode, JitError> {
        self.resolve_patches()?;
        if self.code.is_empty() {
            return Err(JitError::EmptyBuffer);
        }
        let mut mem = ExecutableMemory::new(self.code.len())?;
        mem.write(0, &self.code);
        mem.protect_exec()?;
        debug!("finalized {} bytes at {:p}", self.code.len(), mem.as_ptr());
        Ok(ExecutableCode::new(mem, self.code.len()))
    }

    /// The raw bytes emitted so far (for encoder tests and inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_widths() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(buf.offset(), 7);
    }

    #[test]
    fn labels_bind_at_cursor() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.emit_u8(0x90);
        buf.bind(l);
        buf.emit_u8(0x90);
        assert_eq!(buf.label_offset(l), Some(1));
    }

    #[test]
    fn align_pads_to_boundary() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.align(4, 0x00);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn rel32_forward_patch() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.emit_u8(0xE9);
        buf.emit_patchable(PatchKind::Rel32, l, 0);
        buf.emit_bytes(&[0x90, 0x90, 0x90]);
        buf.bind(l);
        buf.resolve_patches().unwrap();
        // field at offset 1, next instruction at 5, target at 8 -> disp 3
        assert_eq!(&buf.code()[1..5], &3i32.to_le_bytes());
    }

    #[test]
    fn rel32_backward_patch() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.bind(l);
        buf.emit_bytes(&[0x90, 0x90]);
        buf.emit_u8(0xE9);
        buf.emit_patchable(PatchKind::Rel32, l, 0);
        buf.resolve_patches().unwrap();
        // field at 3, next instruction at 7, target 0 -> disp -7
        assert_eq!(&buf.code()[3..7], &(-7i32).to_le_bytes());
    }

    #[test]
    fn branch26_field_is_word_scaled() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.emit_patchable(PatchKind::A64Branch26, l, 0x14000000);
        buf.emit_u32(0xD503201F);
        buf.bind(l);
        buf.resolve_patches().unwrap();
        let word = u32::from_le_bytes(buf.code()[0..4].try_into().unwrap());
        assert_eq!(word, 0x14000000 | 2);
    }

    #[test]
    fn unbound_label_is_detected() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.emit_u8(0xE9);
        buf.emit_patchable(PatchKind::Rel32, l, 0);
        assert!(matches!(
            buf.resolve_patches(),
            Err(JitError::UnboundLabel(_))
        ));
    }
}
