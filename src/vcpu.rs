//! `GuestThread` (§9 GLOSSARY): the per-thread struct that drives the dispatcher loop (C5),
//! analogous to the teacher's `Vcpu`. It owns the thread's [`GuestCpuState`], its
//! [`ThreadSignalState`] (§4.7), and a thread-local [`Dispatcher`] (C5, which itself owns the
//! thread-local C4 lookup cache) — matching §5's "the lookup cache is thread-local" and the
//! GLOSSARY's `GuestThread` entry.

use crate::dispatcher::{Dispatcher, ExitDecision, StepOutcome};
use crate::error::Error;
use crate::process::GuestProcess;
use crate::signal::{ThreadSignalState, ThunkDecision};
use crate::state::GuestCpuState;

/// A single guest thread (C8 entry) paired with the C5/C4 state that makes its dispatch loop
/// independent of every other thread's.
pub struct GuestThread {
    tid: u32,
    state: GuestCpuState,
    signals: ThreadSignalState,
    dispatcher: Dispatcher,
}

impl GuestThread {
    pub fn new(tid: u32, virtual_mem_size: u64) -> Self {
        Self {
            tid,
            state: GuestCpuState { thread: crate::state::ThreadManagerFields { tid: tid as i32, ..Default::default() }, ..Default::default() },
            signals: ThreadSignalState::default(),
            dispatcher: Dispatcher::new(virtual_mem_size),
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn state(&self) -> &GuestCpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut GuestCpuState {
        &mut self.state
    }

    pub fn signals(&self) -> &ThreadSignalState {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut ThreadSignalState {
        &mut self.signals
    }

    /// Runs one dispatcher step at the thread's current `RIP` (§4.5 main loop body), compiling
    /// through `process` on an L1/L2 miss.
    pub fn step(&mut self, process: &GuestProcess, mut read_guest: impl FnMut(u64, u64) -> Vec<u8>, signals_pending: impl FnMut() -> bool) -> Result<StepOutcome, Error> {
        self.dispatcher.step(
            &mut self.state,
            |rip| process.translate_block(rip, 64, &mut read_guest).map(|block| block.host_code_base),
            signals_pending,
        )
    }

    /// `ExitFunctionLinker`/`CheckTF` (§4.5): what a direct-target exit should do next.
    pub fn exit_decision(&self, target_rip: u64) -> ExitDecision {
        self.dispatcher.exit_decision(&self.state, target_rip)
    }

    /// A C1/C2 mapping change invalidates this thread's C4/exit-link state (§4.5, §5: "global
    /// invalidation broadcasts via the signal-based pause mechanism" reaches every thread in turn).
    pub fn invalidate(&mut self, start: u64, length: u64) {
        self.dispatcher.invalidate(start, length);
    }

    /// Marks the thread as having entered a syscall (§4.7: a deferred signal waits for the
    /// syscall to return rather than interrupting it).
    pub fn enter_syscall(&mut self, number: i64) {
        self.state.in_syscall = crate::state::InSyscallInfo { in_syscall: true, syscall_number: number };
    }

    pub fn leave_syscall(&mut self) {
        self.state.in_syscall = crate::state::InSyscallInfo::default();
    }

    /// `GuestSignal_SIGILL`/`_SIGTRAP`/`_SIGSEGV` entry (§4.5): spills SRA before the delegator's
    /// thunk logic inspects `self.signals`.
    pub fn spill_for_fault(&mut self) {
        crate::dispatcher::spill_for_guest_fault(&mut self.state);
    }

    /// Runs the signal delegator's thunk logic for an incoming host signal against this thread's
    /// mask/pending state (§4.7).
    pub fn thunk_decision(&mut self, process: &GuestProcess, sig: u32) -> ThunkDecision {
        process.thunk_decision(&mut self.signals, sig)
    }
}
