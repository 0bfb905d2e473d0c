//! The block translator driver (C6, §4.6).
//!
//! Implements the steps of §4.6 that are pure decision logic — speculative decode bookkeeping,
//! hashing and C3 consultation, `BranchHint` classification, driving the register allocator, and
//! publishing into C4/C3 — against two small trait seams. The literal x86 opcode-to-IR lowering
//! table and the IR-to-AArch64 emitter it names as external collaborators (§1) are represented by
//! [`Decoder`] and [`Emitter`]; this module never guesses at their internals.

use crate::cache::{fingerprint, CacheEntry, CodeCache, GuestRange};
use crate::error::Error;
use crate::ir::{Block, Cond, ExitHint, Instruction, IrList, Op, OpSize, ValueId};
use crate::regalloc::{self, Allocation, Location};
use std::convert::TryInto;

/// How a decoded instruction's control transfer should become an `ExitFunction`/`CondJump`
/// terminator (§4.6 step 4).
#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Call { target: u64, return_address: u64 },
    Return { address_value: ValueId },
    CondJump { cond: Cond, true_target: u64, false_target: u64 },
    Jump { target: u64 },
    /// RIP written via a data value rather than an immediate (§4.6 step 4: "anything modifying
    /// RIP via data → indirect ExitFunction").
    Indirect { new_rip: ValueId },
}

/// One decoded x86 instruction: the non-terminator ops it lowers to (already carrying concrete
/// [`ValueId`]s, allocated by the [`Decoder`] implementation), the source span it consumed, and
/// its terminator if it ends the block.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedInstruction {
    pub range: GuestRange,
    pub ops: Vec<Op>,
    pub terminator: Option<Terminator>,
}

/// The external collaborator that turns x86 bytes into [`DecodedInstruction`]s (§1, §4.6 step 1
/// and the "lift instructions to IR" half of step 4).
pub trait Decoder {
    /// Speculatively decodes forward from `guest_rip`, stopping at `max_instructions` or at the
    /// first instruction with a terminator, whichever comes first.
    fn decode(&self, guest_rip: u64, max_instructions: usize) -> Vec<DecodedInstruction>;
}

/// The external collaborator that lowers IR plus a register allocation into host code bytes
/// (§1, §4.6 step 5's emit half).
pub trait Emitter {
    fn emit(&self, ir: &IrList, allocation: &Allocation) -> Vec<u8>;
}

impl Decoder for Box<dyn Decoder + Send + Sync> {
    fn decode(&self, guest_rip: u64, max_instructions: usize) -> Vec<DecodedInstruction> {
        (**self).decode(guest_rip, max_instructions)
    }
}

impl Emitter for Box<dyn Emitter + Send + Sync> {
    fn emit(&self, ir: &IrList, allocation: &Allocation) -> Vec<u8> {
        (**self).emit(ir, allocation)
    }
}

/// The result of one [`Translator::translate`] call, matching step 6 of §4.6.
#[derive(Debug)]
pub struct TranslatedBlock {
    pub guest_rip: u64,
    pub host_code_base: u64,
    pub ranges: Vec<GuestRange>,
    pub from_cache: bool,
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> u32 {
    let value = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    value
}

/// Serializes an [`Allocation`] followed by the encoded [`IrList`] into the IR cache payload
/// format §3 describes ("the IR cache appends a register allocation blob plus an encoded IrList").
fn encode_payload(ir: &IrList, allocation: &Allocation) -> Vec<u8> {
    let mut buf = Vec::new();

    put_u32(&mut buf, allocation.locations.len() as u32);
    for (&value, location) in &allocation.locations {
        put_u32(&mut buf, value);
        match *location {
            Location::Register(reg) => {
                buf.push(0);
                put_u32(&mut buf, reg);
            }
            Location::Slot(slot) => {
                buf.push(1);
                put_u32(&mut buf, slot);
            }
        }
    }
    put_u32(&mut buf, allocation.spill_slot_count);

    buf.extend_from_slice(&crate::ir::encode(ir));
    buf
}

fn decode_payload(bytes: &[u8]) -> (Allocation, IrList) {
    let mut pos = 0;
    let count = read_u32(bytes, &mut pos);
    let mut locations = std::collections::HashMap::new();

    for _ in 0..count {
        let value = read_u32(bytes, &mut pos);
        let tag = bytes[pos];
        pos += 1;
        let payload = read_u32(bytes, &mut pos);
        let location = if tag == 0 { Location::Register(payload) } else { Location::Slot(payload) };
        locations.insert(value, location);
    }

    let spill_slot_count = read_u32(bytes, &mut pos);
    let ir = crate::ir::decode(&bytes[pos..]);

    (Allocation { locations, spill_slot_count }, ir)
}

/// Builds the single-block [`IrList`] for a freshly decoded instruction stream, classifying its
/// final terminator into the IR shapes §4.6 step 4 names. A conditional jump produces three
/// blocks: the straight-line body, and one small exit block per arm; anything else stays a single
/// block whose last op is the corresponding `ExitFunction`/terminator.
fn build_ir(_guest_rip: u64, instructions: &[DecodedInstruction]) -> IrList {
    let mut body = Vec::new();
    let mut next_id = 0u32;

    for decoded in instructions {
        for op in &decoded.ops {
            let id = match op.def() {
                Some(def) => {
                    next_id = next_id.max(def + 1);
                    def
                }
                None => {
                    let id = next_id;
                    next_id += 1;
                    id
                }
            };
            body.push(Instruction { id, op: op.clone() });
        }
    }

    let mut fresh = || {
        let id = next_id;
        next_id += 1;
        id
    };

    let terminator = instructions.last().and_then(|i| i.terminator.clone());

    match terminator {
        Some(Terminator::Jump { target }) => {
            let dest = fresh();
            body.push(Instruction { id: dest, op: Op::Const { dest, size: OpSize::I64, value: target } });
            body.push(Instruction {
                id: fresh(),
                op: Op::ExitFunction { new_rip: dest, hint: ExitHint::Jump, call_return_block: None, call_return_address: None },
            });
            IrList { blocks: vec![Block { id: 0, instructions: body }] }
        }
        Some(Terminator::Call { target, return_address }) => {
            let dest = fresh();
            let ret = fresh();
            body.push(Instruction { id: dest, op: Op::Const { dest, size: OpSize::I64, value: target } });
            body.push(Instruction { id: ret, op: Op::Const { dest: ret, size: OpSize::I64, value: return_address } });
            body.push(Instruction {
                id: fresh(),
                op: Op::ExitFunction { new_rip: dest, hint: ExitHint::Call, call_return_block: Some(1), call_return_address: Some(ret) },
            });
            IrList { blocks: vec![Block { id: 0, instructions: body }] }
        }
        Some(Terminator::Return { address_value }) => {
            body.push(Instruction {
                id: fresh(),
                op: Op::ExitFunction { new_rip: address_value, hint: ExitHint::Return, call_return_block: None, call_return_address: None },
            });
            IrList { blocks: vec![Block { id: 0, instructions: body }] }
        }
        Some(Terminator::Indirect { new_rip }) => {
            body.push(Instruction {
                id: fresh(),
                op: Op::ExitFunction { new_rip, hint: ExitHint::Jump, call_return_block: None, call_return_address: None },
            });
            IrList { blocks: vec![Block { id: 0, instructions: body }] }
        }
        Some(Terminator::CondJump { cond, true_target, false_target }) => {
            body.push(Instruction { id: fresh(), op: Op::CondJump { true_block: 1, false_block: 2, cond } });

            let true_dest = fresh();
            let true_block = Block {
                id: 1,
                instructions: vec![
                    Instruction { id: true_dest, op: Op::Const { dest: true_dest, size: OpSize::I64, value: true_target } },
                    Instruction {
                        id: fresh(),
                        op: Op::ExitFunction { new_rip: true_dest, hint: ExitHint::Jump, call_return_block: None, call_return_address: None },
                    },
                ],
            };

            let false_dest = fresh();
            let false_block = Block {
                id: 2,
                instructions: vec![
                    Instruction { id: false_dest, op: Op::Const { dest: false_dest, size: OpSize::I64, value: false_target } },
                    Instruction {
                        id: fresh(),
                        op: Op::ExitFunction { new_rip: false_dest, hint: ExitHint::Jump, call_return_block: None, call_return_address: None },
                    },
                ],
            };

            IrList { blocks: vec![Block { id: 0, instructions: body }, true_block, false_block] }
        }
        None => {
            // A speculative decode that ran out of instructions without hitting a terminator is a
            // decoder bug; guarded against by `debug_assert` rather than recovered from, since it
            // can only happen if `Decoder::decode` violates its own contract.
            debug_assert!(false, "decoded block has no terminator");
            IrList { blocks: vec![Block { id: 0, instructions: body }] }
        }
    }
}

/// The block translator driver (C6).
pub struct Translator<D, E> {
    decoder: D,
    emitter: E,
}

impl<D: Decoder, E: Emitter> Translator<D, E> {
    pub fn new(decoder: D, emitter: E) -> Self {
        Self { decoder, emitter }
    }

    /// Runs §4.6 steps 1-6. `read_guest` supplies guest bytes for hashing (step 2); `allocate_code`
    /// places the emitted host bytes and returns the address C4/C3 should record (step 6); `ir_cache`
    /// and `obj_cache` are C3's two pairs.
    pub fn translate(
        &self,
        guest_rip: u64,
        max_instructions: usize,
        mut read_guest: impl FnMut(u64, u64) -> Vec<u8>,
        mut allocate_code: impl FnMut(&[u8]) -> u64,
        ir_cache: &mut CodeCache,
        obj_cache: &mut CodeCache,
    ) -> Result<TranslatedBlock, Error> {
        let decoded = self.decoder.decode(guest_rip, max_instructions);
        let ranges: Vec<GuestRange> = decoded.iter().map(|d| d.range).collect();

        if let Some(cached) = ir_cache.find(guest_rip, guest_rip, &mut read_guest)? {
            let (allocation, ir) = decode_payload(&cached.payload);
            let host_code = self.emitter.emit(&ir, &allocation);
            let host_code_base = allocate_code(&host_code);
            let obj_ranges = ranges.clone();

            obj_cache.insert(guest_rip, guest_rip, || CacheEntry {
                guest_hash: cached.guest_hash,
                guest_ranges: obj_ranges,
                payload: host_code,
            })?;

            return Ok(TranslatedBlock { guest_rip, host_code_base, ranges, from_cache: true });
        }

        let ir = build_ir(guest_rip, &decoded);
        ir.validate().map_err(|_| Error::SraSkew)?;

        let mut allocation = Allocation::default();
        for block in &ir.blocks {
            let block_allocation = regalloc::allocate(block);
            for (value, location) in block_allocation.locations {
                allocation.locations.insert(value, location);
            }
            allocation.spill_slot_count = allocation.spill_slot_count.max(block_allocation.spill_slot_count);
        }

        let host_code = self.emitter.emit(&ir, &allocation);
        let host_code_base = allocate_code(&host_code);
        let hash = fingerprint(guest_rip, &ranges, &mut read_guest);

        let ir_ranges = ranges.clone();
        let ir_payload = encode_payload(&ir, &allocation);
        ir_cache.insert(guest_rip, guest_rip, || CacheEntry { guest_hash: hash, guest_ranges: ir_ranges, payload: ir_payload })?;

        let obj_ranges = ranges.clone();
        obj_cache.insert(guest_rip, guest_rip, || CacheEntry { guest_hash: hash, guest_ranges: obj_ranges, payload: host_code })?;

        Ok(TranslatedBlock { guest_rip, host_code_base, ranges, from_cache: false })
    }
}
