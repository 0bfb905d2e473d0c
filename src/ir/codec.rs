//! A small binary encoding for [`IrList`] so it can be stored inline in an IR [`CacheEntry`]
//! (§3) and so the round-trip law in §8 ("Encoding an IR list and decoding it yields identical
//! opcode sequences") is testable.

use super::{Block, Cond, ExitHint, Instruction, IrList, Op, OpSize};
use std::convert::TryInto;

const TAG_HEADER: u8 = 0;
const TAG_BEGIN_BLOCK: u8 = 1;
const TAG_END_BLOCK: u8 = 2;
const TAG_CODE_BLOCK: u8 = 3;
const TAG_JUMP: u8 = 4;
const TAG_COND_JUMP_NZCV: u8 = 5;
const TAG_COND_JUMP_CMP: u8 = 6;
const TAG_EXIT_FUNCTION: u8 = 7;
const TAG_CONST: u8 = 8;
const TAG_LOAD: u8 = 9;
const TAG_STORE: u8 = 10;
const TAG_ADD: u8 = 11;
const TAG_SUB: u8 = 12;
const TAG_SPILL: u8 = 13;
const TAG_FILL: u8 = 14;

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_opt_u32(buf: &mut Vec<u8>, value: Option<u32>) {
    match value {
        Some(v) => {
            buf.push(1);
            put_u32(buf, v);
        }
        None => buf.push(0),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let v = self.bytes[self.pos];
        self.pos += 1;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.bytes[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    fn opt_u32(&mut self) -> Option<u32> {
        if self.u8() == 1 {
            Some(self.u32())
        } else {
            None
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

fn op_size_to_u8(size: OpSize) -> u8 {
    size as u8
}

fn u8_to_op_size(tag: u8) -> OpSize {
    match tag {
        0 => OpSize::I8,
        1 => OpSize::I16,
        2 => OpSize::I32,
        3 => OpSize::I64,
        4 => OpSize::I128,
        _ => OpSize::I256,
    }
}

fn encode_op(buf: &mut Vec<u8>, op: &Op) {
    match *op {
        Op::Header { ref blocks } => {
            buf.push(TAG_HEADER);
            put_u32(buf, blocks.len() as u32);
            for block in blocks {
                put_u32(buf, *block);
            }
        }
        Op::BeginBlock => buf.push(TAG_BEGIN_BLOCK),
        Op::EndBlock => buf.push(TAG_END_BLOCK),
        Op::CodeBlock { begin, last, next } => {
            buf.push(TAG_CODE_BLOCK);
            put_u32(buf, begin);
            put_u32(buf, last);
            put_opt_u32(buf, next);
        }
        Op::Jump { target } => {
            buf.push(TAG_JUMP);
            put_u32(buf, target);
        }
        Op::CondJump { true_block, false_block, cond } => {
            match cond {
                Cond::FromNzcv(flags) => {
                    buf.push(TAG_COND_JUMP_NZCV);
                    put_u32(buf, true_block);
                    put_u32(buf, false_block);
                    buf.push(flags);
                }
                Cond::Cmp(a, b) => {
                    buf.push(TAG_COND_JUMP_CMP);
                    put_u32(buf, true_block);
                    put_u32(buf, false_block);
                    put_u32(buf, a);
                    put_u32(buf, b);
                }
            }
        }
        Op::ExitFunction { new_rip, hint, call_return_block, call_return_address } => {
            buf.push(TAG_EXIT_FUNCTION);
            put_u32(buf, new_rip);
            buf.push(hint as u8);
            put_opt_u32(buf, call_return_block);
            put_opt_u32(buf, call_return_address);
        }
        Op::Const { dest, size, value } => {
            buf.push(TAG_CONST);
            put_u32(buf, dest);
            buf.push(op_size_to_u8(size));
            put_u64(buf, value);
        }
        Op::Load { dest, size, addr } => {
            buf.push(TAG_LOAD);
            put_u32(buf, dest);
            buf.push(op_size_to_u8(size));
            put_u32(buf, addr);
        }
        Op::Store { size, addr, value } => {
            buf.push(TAG_STORE);
            buf.push(op_size_to_u8(size));
            put_u32(buf, addr);
            put_u32(buf, value);
        }
        Op::Add { dest, size, lhs, rhs } => {
            buf.push(TAG_ADD);
            put_u32(buf, dest);
            buf.push(op_size_to_u8(size));
            put_u32(buf, lhs);
            put_u32(buf, rhs);
        }
        Op::Sub { dest, size, lhs, rhs } => {
            buf.push(TAG_SUB);
            put_u32(buf, dest);
            buf.push(op_size_to_u8(size));
            put_u32(buf, lhs);
            put_u32(buf, rhs);
        }
        Op::SpillRegister { value, slot } => {
            buf.push(TAG_SPILL);
            put_u32(buf, value);
            put_u32(buf, slot);
        }
        Op::FillRegister { dest, slot } => {
            buf.push(TAG_FILL);
            put_u32(buf, dest);
            put_u32(buf, slot);
        }
    }
}

fn decode_op(reader: &mut Reader) -> Op {
    match reader.u8() {
        TAG_HEADER => {
            let count = reader.u32();
            let blocks = (0..count).map(|_| reader.u32()).collect();
            Op::Header { blocks }
        }
        TAG_BEGIN_BLOCK => Op::BeginBlock,
        TAG_END_BLOCK => Op::EndBlock,
        TAG_CODE_BLOCK => {
            let begin = reader.u32();
            let last = reader.u32();
            let next = reader.opt_u32();
            Op::CodeBlock { begin, last, next }
        }
        TAG_JUMP => Op::Jump { target: reader.u32() },
        TAG_COND_JUMP_NZCV => {
            let true_block = reader.u32();
            let false_block = reader.u32();
            let flags = reader.u8();
            Op::CondJump { true_block, false_block, cond: Cond::FromNzcv(flags) }
        }
        TAG_COND_JUMP_CMP => {
            let true_block = reader.u32();
            let false_block = reader.u32();
            let a = reader.u32();
            let b = reader.u32();
            Op::CondJump { true_block, false_block, cond: Cond::Cmp(a, b) }
        }
        TAG_EXIT_FUNCTION => {
            let new_rip = reader.u32();
            let hint = match reader.u8() {
                0 => ExitHint::Jump,
                1 => ExitHint::Call,
                2 => ExitHint::Return,
                _ => ExitHint::CheckTf,
            };
            let call_return_block = reader.opt_u32();
            let call_return_address = reader.opt_u32();
            Op::ExitFunction { new_rip, hint, call_return_block, call_return_address }
        }
        TAG_CONST => {
            let dest = reader.u32();
            let size = u8_to_op_size(reader.u8());
            let value = reader.u64();
            Op::Const { dest, size, value }
        }
        TAG_LOAD => {
            let dest = reader.u32();
            let size = u8_to_op_size(reader.u8());
            let addr = reader.u32();
            Op::Load { dest, size, addr }
        }
        TAG_STORE => {
            let size = u8_to_op_size(reader.u8());
            let addr = reader.u32();
            let value = reader.u32();
            Op::Store { size, addr, value }
        }
        TAG_ADD => {
            let dest = reader.u32();
            let size = u8_to_op_size(reader.u8());
            let lhs = reader.u32();
            let rhs = reader.u32();
            Op::Add { dest, size, lhs, rhs }
        }
        TAG_SUB => {
            let dest = reader.u32();
            let size = u8_to_op_size(reader.u8());
            let lhs = reader.u32();
            let rhs = reader.u32();
            Op::Sub { dest, size, lhs, rhs }
        }
        TAG_SPILL => {
            let value = reader.u32();
            let slot = reader.u32();
            Op::SpillRegister { value, slot }
        }
        TAG_FILL => {
            let dest = reader.u32();
            let slot = reader.u32();
            Op::FillRegister { dest, slot }
        }
        other => panic!("corrupt IR stream: unknown op tag {other}"),
    }
}

/// Encodes an [`IrList`] into the flat byte blob stored inline in an IR cache entry.
pub fn encode(ir: &IrList) -> Vec<u8> {
    let mut buf = Vec::new();

    put_u32(&mut buf, ir.blocks.len() as u32);

    for block in &ir.blocks {
        put_u32(&mut buf, block.id);
        put_u32(&mut buf, block.instructions.len() as u32);

        for instruction in &block.instructions {
            put_u32(&mut buf, instruction.id);
            encode_op(&mut buf, &instruction.op);
        }
    }

    buf
}

/// Decodes a byte blob previously produced by [`encode`]. Panics on malformed input, matching
/// the cache's own crash-safety model: a corrupt IR cache entry is a bug in the writer, not a
/// recoverable guest-facing condition.
pub fn decode(bytes: &[u8]) -> IrList {
    let mut reader = Reader::new(bytes);
    let block_count = reader.u32();
    let mut blocks = Vec::with_capacity(block_count as usize);

    for _ in 0..block_count {
        let id = reader.u32();
        let instruction_count = reader.u32();
        let mut instructions = Vec::with_capacity(instruction_count as usize);

        for _ in 0..instruction_count {
            let inst_id = reader.u32();
            let op = decode_op(&mut reader);
            instructions.push(Instruction { id: inst_id, op });
        }

        blocks.push(Block { id, instructions });
    }

    debug_assert!(reader.at_end());

    IrList { blocks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, ExitHint, Instruction};

    fn roundtrip_fixture() -> IrList {
        IrList {
            blocks: vec![Block {
                id: 7,
                instructions: vec![
                    Instruction { id: 0, op: Op::Const { dest: 0, size: OpSize::I64, value: 0xdead_beef } },
                    Instruction { id: 1, op: Op::Load { dest: 1, size: OpSize::I32, addr: 0 } },
                    Instruction { id: 2, op: Op::Add { dest: 2, size: OpSize::I64, lhs: 0, rhs: 1 } },
                    Instruction { id: 3, op: Op::SpillRegister { value: 2, slot: 4 } },
                    Instruction { id: 4, op: Op::FillRegister { dest: 5, slot: 4 } },
                    Instruction {
                        id: 5,
                        op: Op::ExitFunction {
                            new_rip: 5,
                            hint: ExitHint::CheckTf,
                            call_return_block: Some(9),
                            call_return_address: None,
                        },
                    },
                ],
            }],
        }
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let ir = roundtrip_fixture();
        let bytes = encode(&ir);
        let decoded = decode(&bytes);
        assert_eq!(ir, decoded);
    }

    #[test]
    fn cond_jump_variants_roundtrip() {
        let ir = IrList {
            blocks: vec![Block {
                id: 0,
                instructions: vec![
                    Instruction {
                        id: 0,
                        op: Op::CondJump { true_block: 1, false_block: 2, cond: Cond::FromNzcv(0b0100) },
                    },
                ],
            }],
        };
        let decoded = decode(&encode(&ir));
        assert_eq!(ir, decoded);
    }
}
