//! The dispatcher trampoline's control logic (C5, §4.5).
//!
//! The real dispatcher is a block of hand-written AArch64 assembly emitted once per process; it is
//! an external collaborator (§1) this crate never generates. What lives here is everything §4.5
//! calls out as the trampoline's *decision logic*: the main loop's L1/L2 consult order, the
//! SRA spill/fill bookkeeping every world boundary performs, the exit-linking patch table and the
//! shadow call-return stack, the `CheckTF` gating rule, and the 128-bit division ABI thunks. Each
//! piece is driven through plain Rust state so it is testable without the assembly it would
//! otherwise sit inside.

use crate::cache::lookup::LookupCache;
use crate::error::Error;
use crate::state::GuestCpuState;
use std::collections::HashMap;

/// One push onto the shadow call-return stack (§4.5: "push `<guest-return-RIP, host-return-addr>`").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ReturnSite {
    guest_rip: u64,
    host_return: u64,
}

/// Accelerates `ExitFunction(Hint=Return)` by remembering the last few call sites, avoiding a full
/// L1/L2 consult when the guest actually returns to where it was called from (§4.5: "the shadow
/// stack `RetSp` accelerates returns").
pub struct ShadowStack {
    entries: Vec<ReturnSite>,
    depth: usize,
}

impl ShadowStack {
    pub fn new(depth: usize) -> Self {
        Self { entries: Vec::with_capacity(depth), depth }
    }

    /// `bl JumpThunk`'s push (§4.5). Drops the oldest entry once `depth` is exceeded, mirroring a
    /// fixed-size shadow stack rather than an unbounded one.
    pub fn push(&mut self, guest_rip: u64, host_return: u64) {
        if self.entries.len() == self.depth {
            self.entries.remove(0);
        }

        self.entries.push(ReturnSite { guest_rip, host_return });
    }

    /// The indirect-return fast path (§4.5): pop the top entry; if its stored guest RIP matches
    /// the live `new_rip`, jump straight to the stored host address. A mismatch (or an empty
    /// stack) falls through to the ordinary L1/L2 lookup; the popped entry is not restored either
    /// way, matching the original's unconditional pop.
    pub fn pop_for_return(&mut self, new_rip: u64) -> Option<u64> {
        let top = self.entries.pop()?;

        if top.guest_rip == new_rip {
            Some(top.host_return)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What `ExitFunctionLinker` has decided about a call target (§4.5: "a small patch target that
/// falls through to the shared linker the first time").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkDecision {
    /// Already linked to a direct branch; the caller can jump straight there.
    Linked { host: u64 },
    /// Not yet compiled; the caller must compile the target and call [`ExitLinker::link`].
    NeedsCompile,
}

/// The exit-linking patch table (§4.5). Models "the linker compiles the target block and rewrites
/// the `bl` to a direct `b`" as a plain map from guest target to host address; this crate doesn't
/// rewrite branch instructions itself (that's the out-of-scope assembly), only tracks which
/// targets have been linked.
#[derive(Default)]
pub struct ExitLinker {
    patches: HashMap<u64, u64>,
}

impl ExitLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&self, target_rip: u64) -> LinkDecision {
        match self.patches.get(&target_rip) {
            Some(&host) => LinkDecision::Linked { host },
            None => LinkDecision::NeedsCompile,
        }
    }

    pub fn link(&mut self, target_rip: u64, host: u64) {
        self.patches.insert(target_rip, host);
    }

    /// "On invalidation, all patches are undone by restoring the template" (§4.5): every link
    /// whose guest target falls in the invalidated range is removed.
    pub fn unlink_range(&mut self, start: u64, length: u64) {
        let end = start + length;
        self.patches.retain(|&target, _| target < start || target >= end);
    }
}

/// One [`Dispatcher::step`] result, mirroring the main loop pseudocode's two outcomes (§4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// L1 or L2 already resolved `RIP`; jump straight there.
    Linked { host: u64 },
    /// Neither level had an entry; `CompileBlock` ran and the result was published into C4.
    /// `fault_pending` mirrors `FillStaticRegs` touching `InterruptFaultPage`: if set, the caller
    /// must synthesize a fault so a deferred signal can be delivered before guest code resumes.
    Compiled { host: u64, fault_pending: bool },
}

/// `CheckTF`'s decision for a single `ExitFunction` (§4.5: "when the trap flag is set ... tail-call
/// the full dispatcher so a `SIGTRAP` can be synthesized per-instruction").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitDecision {
    /// Jump directly to an already-linked host address.
    Direct { host: u64 },
    /// Must go through the full dispatch loop, either because nothing is linked yet or because
    /// the trap flag forces single-step behavior even for an already-linked target.
    FullDispatch,
}

/// The dispatcher's per-thread control state (C5): the L4 lookup cache, the exit-linking patch
/// table, and the shadow call-return stack. One per guest thread, matching C4's "thread-local"
/// scope (§5).
pub struct Dispatcher {
    lookup: LookupCache,
    linker: ExitLinker,
    shadow_stack: ShadowStack,
}

/// Depth of the shadow call-return stack (§4.5 names no fixed number; this is a conservative
/// guess at typical call nesting a single dispatch loop iteration needs to track).
const SHADOW_STACK_DEPTH: usize = 64;

impl Dispatcher {
    pub fn new(virtual_mem_size: u64) -> Self {
        Self {
            lookup: LookupCache::new(virtual_mem_size),
            linker: ExitLinker::new(),
            shadow_stack: ShadowStack::new(SHADOW_STACK_DEPTH),
        }
    }

    pub fn linker(&mut self) -> &mut ExitLinker {
        &mut self.linker
    }

    pub fn shadow_stack(&mut self) -> &mut ShadowStack {
        &mut self.shadow_stack
    }

    /// Publishes a freshly compiled block into C4 (§4.5, §4.6 step 6).
    pub fn publish(&mut self, guest_rip: u64, host: u64) {
        self.lookup.insert(guest_rip, host);
    }

    /// A C1/C2 mapping change invalidates both C4 and every exit-link into the affected range
    /// (§3, §4.5: "On invalidation, all patches are undone").
    pub fn invalidate(&mut self, start: u64, length: u64) {
        self.lookup.invalidate(start, length);
        self.linker.unlink_range(start, length);
    }

    /// The main loop's core decision (§4.5 steps 1-2): L1/L2 consult, falling through to
    /// `compile` (step `CompileBlock`) on a miss. `compile` is the world boundary: SRA is spilled
    /// before it runs and refilled after, bumping and releasing `state.deferred_signal_ref_count`
    /// exactly as `SpillStaticRegs`/`FillStaticRegs` would (§4.5).
    pub fn step(
        &mut self,
        state: &mut GuestCpuState,
        mut compile: impl FnMut(u64) -> Result<u64, Error>,
        mut signals_pending: impl FnMut() -> bool,
    ) -> Result<StepOutcome, Error> {
        let rip = state.rip;

        if let Some(host) = self.lookup.find(rip) {
            return Ok(StepOutcome::Linked { host });
        }

        state.deferred_signal_ref_count += 1;
        let host = compile(rip)?;
        state.deferred_signal_ref_count -= 1;

        self.lookup.insert(rip, host);

        let fault_pending = state.deferred_signal_ref_count == 0 && signals_pending();

        Ok(StepOutcome::Compiled { host, fault_pending })
    }

    /// `ExitFunctionLinker`'s decision for a direct-target exit, gated by `CheckTF` (§4.5): a set
    /// trap flag always forces the full dispatch loop, regardless of whether the target is linked.
    pub fn exit_decision(&self, state: &GuestCpuState, target_rip: u64) -> ExitDecision {
        if state.flags.tf {
            return ExitDecision::FullDispatch;
        }

        match self.linker.decide(target_rip) {
            LinkDecision::Linked { host } => ExitDecision::Direct { host },
            LinkDecision::NeedsCompile => ExitDecision::FullDispatch,
        }
    }
}

/// `GuestSignal_SIGILL`/`_SIGTRAP`/`_SIGSEGV` (§4.5): spills SRA before handing the fault to the
/// signal delegator, so `state` is consistent when the delegator's thunk inspects it.
pub fn spill_for_guest_fault(state: &mut GuestCpuState) {
    state.deferred_signal_ref_count += 1;
}

/// `LUDIV` (§4.5): unsigned 128-bit-by-64-bit division, as the emitted code calls into for a
/// 64-bit `div` whose dividend spans `RDX:RAX`.
pub fn ludiv(dividend_hi: u64, dividend_lo: u64, divisor: u64) -> u64 {
    let dividend = ((dividend_hi as u128) << 64) | dividend_lo as u128;
    (dividend / divisor as u128) as u64
}

/// `LUREM` (§4.5): the remainder counterpart to [`ludiv`].
pub fn lurem(dividend_hi: u64, dividend_lo: u64, divisor: u64) -> u64 {
    let dividend = ((dividend_hi as u128) << 64) | dividend_lo as u128;
    (dividend % divisor as u128) as u64
}

/// `LDIV` (§4.5): signed 128-bit-by-64-bit division for 64-bit `idiv`.
pub fn ldiv(dividend_hi: i64, dividend_lo: u64, divisor: i64) -> i64 {
    let dividend = ((dividend_hi as i128) << 64) | dividend_lo as i128;
    (dividend / divisor as i128) as i64
}

/// `LREM` (§4.5): the remainder counterpart to [`ldiv`].
pub fn lrem(dividend_hi: i64, dividend_lo: u64, divisor: i64) -> i64 {
    let dividend = ((dividend_hi as i128) << 64) | dividend_lo as i128;
    (dividend % divisor as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_resolves_from_l1_without_compiling() {
        let mut dispatcher = Dispatcher::new(1 << 32);
        dispatcher.publish(0x4000, 0x8000);

        let mut state = GuestCpuState { rip: 0x4000, ..Default::default() };
        let mut compiled = false;

        let outcome = dispatcher
            .step(&mut state, |_| { compiled = true; Ok(0) }, || false)
            .unwrap();

        assert_eq!(outcome, StepOutcome::Linked { host: 0x8000 });
        assert!(!compiled);
    }

    #[test]
    fn step_compiles_on_miss_and_publishes() {
        let mut dispatcher = Dispatcher::new(1 << 32);
        let mut state = GuestCpuState { rip: 0x5000, ..Default::default() };

        let outcome = dispatcher.step(&mut state, |rip| Ok(rip + 0x1000), || false).unwrap();

        assert_eq!(outcome, StepOutcome::Compiled { host: 0x6000, fault_pending: false });
        assert_eq!(dispatcher.step(&mut state, |_| panic!("should not recompile"), || false).unwrap(), StepOutcome::Linked { host: 0x6000 });
    }

    #[test]
    fn compile_reports_fault_pending_when_signals_are_pending() {
        let mut dispatcher = Dispatcher::new(1 << 32);
        let mut state = GuestCpuState { rip: 0x5000, ..Default::default() };

        let outcome = dispatcher.step(&mut state, |_| Ok(0x1000), || true).unwrap();
        assert_eq!(outcome, StepOutcome::Compiled { host: 0x1000, fault_pending: true });
        assert_eq!(state.deferred_signal_ref_count, 0);
    }

    #[test]
    fn exit_linker_round_trips_and_unlinks_on_invalidation() {
        let mut linker = ExitLinker::new();
        assert_eq!(linker.decide(0x4000), LinkDecision::NeedsCompile);

        linker.link(0x4000, 0x9000);
        assert_eq!(linker.decide(0x4000), LinkDecision::Linked { host: 0x9000 });

        linker.unlink_range(0x3000, 0x2000);
        assert_eq!(linker.decide(0x4000), LinkDecision::NeedsCompile);
    }

    #[test]
    fn check_tf_forces_full_dispatch_even_when_linked() {
        let mut dispatcher = Dispatcher::new(1 << 32);
        dispatcher.linker().link(0x4000, 0x9000);

        let mut state = GuestCpuState::default();
        assert_eq!(dispatcher.exit_decision(&state, 0x4000), ExitDecision::Direct { host: 0x9000 });

        state.flags.tf = true;
        assert_eq!(dispatcher.exit_decision(&state, 0x4000), ExitDecision::FullDispatch);
    }

    #[test]
    fn shadow_stack_accelerates_matching_return_and_discards_mismatch() {
        let mut stack = ShadowStack::new(4);
        stack.push(0x4010, 0x9010);

        assert_eq!(stack.pop_for_return(0x4010), Some(0x9010));
        assert_eq!(stack.len(), 0);

        stack.push(0x4020, 0x9020);
        assert_eq!(stack.pop_for_return(0x9999), None);
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn shadow_stack_drops_oldest_entry_past_depth() {
        let mut stack = ShadowStack::new(2);
        stack.push(1, 10);
        stack.push(2, 20);
        stack.push(3, 30);

        assert_eq!(stack.pop_for_return(3), Some(30));
        assert_eq!(stack.pop_for_return(2), Some(20));
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn ludiv_and_lurem_match_plain_128_bit_division() {
        assert_eq!(ludiv(0, 100, 7), 14);
        assert_eq!(lurem(0, 100, 7), 2);
        assert_eq!(ludiv(1, 0, 2), 1u64 << 63);
    }

    #[test]
    fn ldiv_and_lrem_match_signed_128_bit_division() {
        assert_eq!(ldiv(0, 100, 7), 14);
        assert_eq!(lrem(0, 100, 7), 2);
        assert_eq!(ldiv(-1, (-100i64) as u64, 7), -14);
    }
}
