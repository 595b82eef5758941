//! ABI call descriptors and marshaling plans.
//!
//! The placement rules here are architecture-neutral over a per-backend
//! [`CallConv`] constant; the emitters execute the resulting plans.
//! Marshaling is placement only, never conversion.

/// One parameter of an ABI call, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiParam {
    /// Integer/pointer class, passed in the word register file.
    Word,
    /// Floating class, passed in the float register file.
    Float,
}

/// Where the native convention placed (or expects) an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLoc {
    /// A word-class argument register, by physical encoding.
    WordReg(u8),
    /// A float-class argument register, by physical encoding.
    FloatReg(u8),
    /// A stack slot, as a byte offset from the convention's stack base
    /// (frame pointer for incoming arguments, stack pointer for outgoing).
    Stack(i32),
}

/// The fixed argument-passing convention of one backend.
pub struct CallConv {
    /// Word-class argument registers in convention order.
    pub word_regs: &'static [u8],
    /// Float-class argument registers in convention order.
    pub float_regs: &'static [u8],
    /// Frame-pointer-relative offset of the first incoming stack argument.
    pub incoming_stack_base: i32,
}

impl CallConv {
    /// Resolve an ordered parameter list into placements. The two register
    /// files are budgeted independently; overflow of either spills to
    /// consecutive 8-byte stack slots starting at `stack_base`.
    pub fn place_args(&self, params: &[AbiParam], stack_base: i32) -> Vec<ArgLoc> {
        let mut next_word = 0usize;
        let mut next_float = 0usize;
        let mut next_stack = stack_base;
        params
            .iter()
            .map(|param| match param {
                AbiParam::Word if next_word < self.word_regs.len() => {
                    next_word += 1;
                    ArgLoc::WordReg(self.word_regs[next_word - 1])
                }
                AbiParam::Float if next_float < self.float_regs.len() => {
                    next_float += 1;
                    ArgLoc::FloatReg(self.float_regs[next_float - 1])
                }
                _ => {
                    let slot = next_stack;
                    next_stack += 8;
                    ArgLoc::Stack(slot)
                }
            })
            .collect()
    }

    /// Placements for arguments received by the current function.
    pub fn place_incoming(&self, params: &[AbiParam]) -> Vec<ArgLoc> {
        self.place_args(params, self.incoming_stack_base)
    }

    /// Placements for arguments passed to a callee; stack slots are
    /// relative to the stack pointer at the call site.
    pub fn place_outgoing(&self, params: &[AbiParam]) -> Vec<ArgLoc> {
        self.place_args(params, 0)
    }

    /// Bytes of outgoing stack-argument area a call needs, rounded to the
    /// universal 16-byte call alignment.
    pub fn outgoing_stack_bytes(&self, params: &[AbiParam]) -> usize {
        let slots = self
            .place_outgoing(params)
            .iter()
            .filter(|loc| matches!(loc, ArgLoc::Stack(_)))
            .count();
        (slots * 8 + 15) & !15
    }
}

/// What a single planned transfer does once ordered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum MoveOp {
    /// Register-to-register copy within one register file.
    Reg,
    /// Load from memory at `base` register plus offset.
    Load { base: u8, offset: i32 },
    /// Materialize an immediate bit pattern.
    Imm(i64),
}

/// One transfer into a destination register of a single register file.
/// `src` is the physical register the transfer reads, if any; the planner
/// uses it to order transfers so no destination write clobbers a source
/// that a later transfer still needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PlannedMove {
    pub src: Option<u8>,
    pub dst: u8,
    pub op: MoveOp,
}

impl PlannedMove {
    pub fn reg(src: u8, dst: u8) -> Self {
        Self {
            src: Some(src),
            dst,
            op: MoveOp::Reg,
        }
    }

    /// Load whose base register lives in the same register file as `dst`;
    /// the base participates in hazard ordering.
    pub fn load(base: u8, offset: i32, dst: u8) -> Self {
        Self {
            src: Some(base),
            dst,
            op: MoveOp::Load { base, offset },
        }
    }

    /// Load whose base register lives in a different register file; no
    /// transfer in this plan can clobber it.
    pub fn load_foreign(base: u8, offset: i32, dst: u8) -> Self {
        Self {
            src: None,
            dst,
            op: MoveOp::Load { base, offset },
        }
    }

    pub fn imm(value: i64, dst: u8) -> Self {
        Self {
            src: None,
            dst,
            op: MoveOp::Imm(value),
        }
    }
}

/// Order a set of parallel transfers so that every source is read before
/// its register is overwritten, routing through `scratch` to break cycles.
/// `scratch` must not appear as a destination.
pub(crate) fn sequence_moves(moves: Vec<PlannedMove>, scratch: u8) -> Vec<PlannedMove> {
    debug_assert!(moves.iter().all(|m| m.dst != scratch));
    let mut pending: Vec<PlannedMove> = moves
        .into_iter()
        .filter(|m| !(m.op == MoveOp::Reg && m.src == Some(m.dst)))
        .collect();
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let free = pending
            .iter()
            .position(|m| !pending.iter().any(|other| other.src == Some(m.dst)));
        match free {
            Some(i) => ordered.push(pending.remove(i)),
            None => {
                // Every pending destination is still a live source, so the
                // remaining transfers form cycles. Park one source in the
                // scratch register and redirect its readers.
                let parked = pending[0].src.expect("cycle implies register sources");
                ordered.push(PlannedMove::reg(parked, scratch));
                for m in pending.iter_mut() {
                    if m.src == Some(parked) {
                        m.src = Some(scratch);
                    }
                }
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONV: CallConv = CallConv {
        word_regs: &[7, 6, 2],
        float_regs: &[0, 1],
        incoming_stack_base: 16,
    };

    #[test]
    fn classes_are_budgeted_independently() {
        let locs = CONV.place_incoming(&[
            AbiParam::Word,
            AbiParam::Float,
            AbiParam::Word,
            AbiParam::Float,
        ]);
        assert_eq!(
            locs,
            vec![
                ArgLoc::WordReg(7),
                ArgLoc::FloatReg(0),
                ArgLoc::WordReg(6),
                ArgLoc::FloatReg(1),
            ]
        );
    }

    #[test]
    fn overflow_spills_to_shared_stack_slots() {
        let params = [
            AbiParam::Word,
            AbiParam::Word,
            AbiParam::Word,
            AbiParam::Word,
            AbiParam::Float,
            AbiParam::Float,
            AbiParam::Float,
        ];
        let locs = CONV.place_incoming(&params);
        assert_eq!(locs[3], ArgLoc::Stack(16));
        assert_eq!(locs[6], ArgLoc::Stack(24));
        assert_eq!(CONV.outgoing_stack_bytes(&params), 16);
    }

    #[test]
    fn chain_is_ordered_without_scratch() {
        // 1 -> 2, 2 -> 3: the 2 -> 3 copy must run first.
        let plan = sequence_moves(vec![PlannedMove::reg(1, 2), PlannedMove::reg(2, 3)], 9);
        assert_eq!(plan, vec![PlannedMove::reg(2, 3), PlannedMove::reg(1, 2)]);
    }

    #[test]
    fn swap_routes_through_scratch() {
        let plan = sequence_moves(vec![PlannedMove::reg(1, 2), PlannedMove::reg(2, 1)], 9);
        assert_eq!(
            plan,
            vec![
                PlannedMove::reg(1, 9),
                PlannedMove::reg(2, 1),
                PlannedMove::reg(9, 2),
            ]
        );
    }

    #[test]
    fn identity_moves_are_dropped() {
        assert!(sequence_moves(vec![PlannedMove::reg(4, 4)], 9).is_empty());
    }

    #[test]
    fn loads_wait_for_reads_of_their_destination() {
        // dst 2 is read by the 2 -> 3 copy, so the load into 2 runs after.
        let plan = sequence_moves(
            vec![PlannedMove::load(5, 8, 2), PlannedMove::reg(2, 3)],
            9,
        );
        assert_eq!(
            plan,
            vec![PlannedMove::reg(2, 3), PlannedMove::load(5, 8, 2)]
        );
    }
}
