//! The linear, typed SSA intermediate representation (§3: "IR").
//!
//! The decode tables that produce this IR and the AArch64 lowering that consumes it are both
//! external collaborators (§1); this module only defines the IR itself, the invariants §3 and §9
//! ("Dynamic dispatch over IR ops") ask for, and a binary encode/decode pair used by the on-disk
//! IR cache (C3) and exercised by the round-trip law in §8.

mod codec;

pub use codec::{decode, encode};

/// Identifies an SSA value by definition order.
pub type ValueId = u32;
/// Identifies a block within an [`IrList`].
pub type BlockId = u32;

/// The size, in bits, an op's result or operands are defined over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum OpSize {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    I128 = 4,
    I256 = 5,
}

/// The per-lane size of a vector op's operands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ElementSize {
    E8 = 0,
    E16 = 1,
    E32 = 2,
    E64 = 3,
}

/// The register class a value must be colored into by the register allocator (§4.6.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RegisterClass {
    Gpr = 0,
    Fpr = 1,
    GprPair = 2,
    Complex = 3,
}

/// A condition tested by `CondJump`, either derived from the flags register (NZCV-style) or from
/// an explicit comparison of two values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cond {
    FromNzcv(u8),
    Cmp(ValueId, ValueId),
}

/// The exit hint attached to `ExitFunction`, classifying how the dispatcher should resume (§3,
/// §4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExitHint {
    Jump = 0,
    Call = 1,
    Return = 2,
    CheckTf = 3,
}

/// A single SSA op. Every op that produces a value carries its own destination [`ValueId`];
/// terminators do not produce values.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Lists every block in the function, in program order; exactly one per [`IrList`].
    Header { blocks: Vec<BlockId> },
    BeginBlock,
    EndBlock,
    /// Delimits a block's extent and links to the next block in program order.
    CodeBlock { begin: BlockId, last: BlockId, next: Option<BlockId> },
    Jump { target: BlockId },
    CondJump { true_block: BlockId, false_block: BlockId, cond: Cond },
    ExitFunction {
        new_rip: ValueId,
        hint: ExitHint,
        call_return_block: Option<BlockId>,
        call_return_address: Option<ValueId>,
    },
    Const { dest: ValueId, size: OpSize, value: u64 },
    Load { dest: ValueId, size: OpSize, addr: ValueId },
    Store { size: OpSize, addr: ValueId, value: ValueId },
    Add { dest: ValueId, size: OpSize, lhs: ValueId, rhs: ValueId },
    Sub { dest: ValueId, size: OpSize, lhs: ValueId, rhs: ValueId },
    /// Emitted by the register allocator: spill `value` to stack `slot`.
    SpillRegister { value: ValueId, slot: u32 },
    /// Emitted by the register allocator: reload stack `slot` into a fresh value.
    FillRegister { dest: ValueId, slot: u32 },
}

impl Op {
    /// The value this op defines, if any.
    pub fn def(&self) -> Option<ValueId> {
        match *self {
            Op::Const { dest, .. }
            | Op::Load { dest, .. }
            | Op::Add { dest, .. }
            | Op::Sub { dest, .. }
            | Op::FillRegister { dest, .. } => Some(dest),
            _ => None,
        }
    }

    /// The values this op uses, in no particular order.
    pub fn uses(&self) -> Vec<ValueId> {
        match *self {
            Op::CondJump { cond: Cond::Cmp(a, b), .. } => vec![a, b],
            Op::ExitFunction { new_rip, call_return_address, .. } => {
                let mut uses = vec![new_rip];
                uses.extend(call_return_address);
                uses
            }
            Op::Load { addr, .. } => vec![addr],
            Op::Store { addr, value, .. } => vec![addr, value],
            Op::Add { lhs, rhs, .. } | Op::Sub { lhs, rhs, .. } => vec![lhs, rhs],
            Op::SpillRegister { value, .. } => vec![value],
            _ => vec![],
        }
    }

    /// True if this op ends a block (§3: "every block ends in exactly one terminator").
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Jump { .. } | Op::CondJump { .. } | Op::ExitFunction { .. })
    }

    /// The register class a defining op's result must be colored into.
    pub fn register_class(&self) -> Option<RegisterClass> {
        self.def().map(|_| RegisterClass::Gpr)
    }

    /// The cost of rematerializing this value instead of spilling it (§4.6.1): constants are
    /// cheapest, loads are moderate, fills are expensive, everything else defaults to 1000.
    pub fn remat_cost(&self) -> u32 {
        match self {
            Op::Const { .. } => 1,
            Op::Load { .. } => 50,
            Op::FillRegister { .. } => 1001,
            _ => 1000,
        }
    }
}

/// A single instruction: an SSA value id paired with the op that (optionally) defines it.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Op,
}

/// A basic block: a straight-line sequence of ops ending in exactly one terminator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub instructions: Vec<Instruction>,
}

/// A complete function-level IR list, as stored in the IR cache (C3) and built by the translator
/// driver (C6).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IrList {
    pub blocks: Vec<Block>,
}

/// Errors raised while validating an [`IrList`] against the invariants of §3.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("block {0} does not end in exactly one terminator")]
    MissingTerminator(BlockId),
    #[error("block {0} uses value {1} before it is defined")]
    UseBeforeDef(BlockId, ValueId),
}

impl IrList {
    /// Checks the invariants named in §3: every block ends in exactly one terminator, and every
    /// use is dominated by its def. Dominance is approximated here by "defined earlier in the
    /// same block's program order", which holds for straight-line blocks; cross-block dominance
    /// is the register allocator's job to preserve via live ranges, not this module's to verify.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for block in &self.blocks {
            let mut defined = std::collections::HashSet::new();

            for (index, instruction) in block.instructions.iter().enumerate() {
                for used in instruction.op.uses() {
                    if !defined.contains(&used) {
                        return Err(ValidationError::UseBeforeDef(block.id, used));
                    }
                }

                if let Some(def) = instruction.op.def() {
                    defined.insert(def);
                }

                let is_last = index + 1 == block.instructions.len();

                if instruction.op.is_terminator() != is_last {
                    if instruction.op.is_terminator() && !is_last {
                        return Err(ValidationError::MissingTerminator(block.id));
                    }
                }
            }

            match block.instructions.last() {
                Some(instruction) if instruction.op.is_terminator() => {}
                _ => return Err(ValidationError::MissingTerminator(block.id)),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block {
            id: 0,
            instructions: vec![
                Instruction { id: 0, op: Op::Const { dest: 0, size: OpSize::I64, value: 42 } },
                Instruction { id: 1, op: Op::Add { dest: 1, size: OpSize::I64, lhs: 0, rhs: 0 } },
                Instruction {
                    id: 2,
                    op: Op::ExitFunction {
                        new_rip: 1,
                        hint: ExitHint::Jump,
                        call_return_block: None,
                        call_return_address: None,
                    },
                },
            ],
        }
    }

    #[test]
    fn well_formed_block_validates() {
        let ir = IrList { blocks: vec![sample_block()] };
        assert!(ir.validate().is_ok());
    }

    #[test]
    fn use_before_def_is_rejected() {
        let block = Block {
            id: 0,
            instructions: vec![
                Instruction { id: 0, op: Op::Add { dest: 0, size: OpSize::I64, lhs: 5, rhs: 5 } },
                Instruction {
                    id: 1,
                    op: Op::ExitFunction {
                        new_rip: 0,
                        hint: ExitHint::Jump,
                        call_return_block: None,
                        call_return_address: None,
                    },
                },
            ],
        };
        let ir = IrList { blocks: vec![block] };
        assert!(ir.validate().is_err());
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let block = Block {
            id: 0,
            instructions: vec![Instruction {
                id: 0,
                op: Op::Const { dest: 0, size: OpSize::I64, value: 1 },
            }],
        };
        let ir = IrList { blocks: vec![block] };
        assert!(ir.validate().is_err());
    }
}
