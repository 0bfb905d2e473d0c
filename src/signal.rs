//! The guest-to-host signal delegator (C7, §4.7).
//!
//! One process-wide table, indexed by signal number, tracks the guest's registered action
//! alongside the host installation the delegator actually has in place. Per-thread state tracks
//! the current guest signal mask, pending (masked) signals, and the alternate stack. The real
//! host `sigaction`/`sigprocmask` calls and the reentrant dispatch into a JIT-compiled guest
//! handler are both out of this crate's reach (§1); this module implements the bookkeeping and
//! decision logic described in §4.7 against an injected host-call seam so it is fully testable.

use bitflags::bitflags;
use std::collections::HashSet;

pub const NSIG: usize = 65;
pub const SIGSEGV: u32 = 11;
pub const SIGILL: u32 = 4;
pub const SIGBUS: u32 = 7;
pub const SIGTRAP: u32 = 5;
/// The kernel-private signal libc uses for XID synchronization (§4.7).
pub const XID_SIGNAL: u32 = 33;

bitflags! {
    pub struct SaFlags: u32 {
        const NOCLDSTOP = 1;
        const NOCLDWAIT = 2;
        const SIGINFO = 4;
        const RESTORER = 0x4000000;
        const ONSTACK = 0x08000000;
        const RESTART = 0x10000000;
        const NODEFER = 0x40000000;
        const RESETHAND = 0x80000000;
    }
}

/// Flags the guest may set that the delegator forwards verbatim to the host installation when an
/// embedder issues the real `sigaction` call; every other flag (`SA_NODEFER` included) only
/// affects this module's own bookkeeping and is never passed to the host (§4.7).
const FORWARDABLE: SaFlags = SaFlags::from_bits_truncate(
    SaFlags::NOCLDSTOP.bits() | SaFlags::NOCLDWAIT.bits() | SaFlags::RESTART.bits(),
);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuestAction {
    Default,
    Ignore,
    Handler(u64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DefaultBehaviour {
    Terminate,
    Core,
    Ignore,
    Stop,
    Continue,
}

/// POSIX default disposition for a signal number, used by `Thunk logic` step 4 to decide whether
/// a fallthrough to `SIG_DFL` needs an explicit re-raise (§4.7 implementation note, supplemented
/// from `original_source/.../SignalDelegator.cpp`).
pub fn default_behavior(sig: u32) -> DefaultBehaviour {
    match sig {
        9 | 19 => DefaultBehaviour::Stop, // SIGKILL/SIGSTOP semantics for this table's purposes
        17 => DefaultBehaviour::Ignore,   // SIGCHLD
        18 => DefaultBehaviour::Continue, // SIGCONT
        4 | 5 | 6 | 7 | 8 | 11 => DefaultBehaviour::Core,
        _ => DefaultBehaviour::Terminate,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SignalEntry {
    pub guest_action: Option<GuestAction>,
    pub guest_flags: SaFlags,
    pub guest_mask: u64,
    pub installed: bool,
    pub required: bool,
}

/// Per-thread signal state (§4.7, §5: "per-thread state").
#[derive(Clone, Debug, Default)]
pub struct ThreadSignalState {
    pub current_mask: u64,
    pub pending: u64,
    pub alt_stack: Option<(u64, u64)>, // (base, length)
    pub on_alt_stack: bool,
}

impl ThreadSignalState {
    fn is_masked(&self, sig: u32) -> bool {
        self.current_mask & (1u64 << sig) != 0
    }

    fn mark_pending(&mut self, sig: u32) {
        self.pending |= 1u64 << sig;
    }

    fn clear_pending(&mut self, sig: u32) {
        self.pending &= !(1u64 << sig);
    }
}

/// The process-wide signal delegator table (C7).
pub struct SignalDelegator {
    table: [SignalEntry; NSIG],
    required: HashSet<u32>,
}

impl SignalDelegator {
    /// Marks `SIGSEGV`, `SIGILL`, `SIGBUS`, and the internal pause signal as required per §4.7's
    /// "Required-signal invariant": the host mask never blocks them and their thunk is always
    /// installed.
    pub fn new(pause_signal: u32) -> Self {
        let mut table = [SignalEntry::default(); NSIG];
        let mut required = HashSet::new();

        for sig in [SIGSEGV, SIGILL, SIGBUS, pause_signal] {
            table[sig as usize].required = true;
            table[sig as usize].installed = true;
            required.insert(sig);
        }

        Self { table, required }
    }

    pub fn is_required(&self, sig: u32) -> bool {
        self.required.contains(&sig)
    }

    /// `RegisterGuestSignalHandler` (§4.7): stores the action, returns the previous one.
    pub fn register(&mut self, sig: u32, action: GuestAction, flags: SaFlags, mask: u64) -> SignalEntry {
        let old = self.table[sig as usize];

        self.table[sig as usize].guest_action = Some(action);
        self.table[sig as usize].guest_flags = flags;
        self.table[sig as usize].guest_mask = mask;
        self.table[sig as usize].installed = true;

        old
    }

    /// The subset of a registered `guest_flags` an embedder should pass to the real host
    /// `sigaction` call (§4.7); every other guest flag, `SA_NODEFER` included, only affects this
    /// delegator's own bookkeeping.
    pub fn host_flags(&self, sig: u32) -> SaFlags {
        self.table[sig as usize].guest_flags & FORWARDABLE
    }

    /// Registering, reading it back, then re-registering the old value round-trips exactly (§8).
    pub fn restore(&mut self, sig: u32, previous: SignalEntry) {
        self.table[sig as usize] = previous;
    }

    pub fn entry(&self, sig: u32) -> &SignalEntry {
        &self.table[sig as usize]
    }

    /// `sigprocmask` emulation (§4.7): `SIG_BLOCK`/`SIG_UNBLOCK`/`SIG_SETMASK`, always excluding
    /// `SIGKILL`/`SIGSTOP`, returning the signals that became newly unblocked (the caller
    /// self-raises any of those found pending).
    pub fn sigprocmask(&self, state: &mut ThreadSignalState, how: ProcMaskHow, arg: u64) -> Vec<u32> {
        const UNMASKABLE: u64 = (1 << 9) | (1 << 19); // SIGKILL, SIGSTOP

        let old = state.current_mask;

        state.current_mask = match how {
            ProcMaskHow::Block => old | arg,
            ProcMaskHow::Unblock => old & !arg,
            ProcMaskHow::Set => arg,
        } & !UNMASKABLE;

        for &sig in &self.required {
            state.current_mask &= !(1u64 << sig);
        }

        let newly_unblocked = old & !state.current_mask;
        let mut to_raise = Vec::new();

        for sig in 0..NSIG as u32 {
            if newly_unblocked & (1u64 << sig) != 0 && state.pending & (1u64 << sig) != 0 {
                to_raise.push(sig);
            }
        }

        to_raise
    }

    /// `sigaltstack` (§4.7): rejects changing the stack while executing on it.
    pub fn set_alt_stack(&self, state: &mut ThreadSignalState, base: u64, length: u64) -> Result<(), crate::error::Error> {
        const MIN_ALT_STACK: u64 = 8 * 1024;

        if state.on_alt_stack {
            return Err(crate::error::Error::ResourceExhausted("cannot change altstack while on it"));
        }

        if length < MIN_ALT_STACK {
            return Err(crate::error::Error::ResourceExhausted("altstack too small"));
        }

        state.alt_stack = Some((base, length));

        Ok(())
    }

    /// Decides what the thunk (§4.7 "Thunk logic") should do for an incoming host signal,
    /// matching its four numbered steps exactly. Returns the action the dispatcher-facing caller
    /// must take; the caller owns actually invoking the guest handler and any `tgkill` re-raise.
    pub fn thunk_decision(&self, state: &mut ThreadSignalState, sig: u32) -> ThunkDecision {
        state.clear_pending(sig);

        if state.is_masked(sig) && !self.is_required(sig) {
            state.mark_pending(sig);
            return ThunkDecision::Deferred;
        }

        match self.table[sig as usize].guest_action {
            Some(GuestAction::Handler(addr)) => {
                let nodefer = self.table[sig as usize].guest_flags.contains(SaFlags::NODEFER);
                let mut new_mask = self.table[sig as usize].guest_mask;

                if !nodefer {
                    new_mask |= 1u64 << sig;
                }

                for &required in &self.required {
                    new_mask &= !(1u64 << required);
                }

                ThunkDecision::InvokeGuestHandler { handler: addr, uc_sigmask: new_mask }
            }
            Some(GuestAction::Ignore) => ThunkDecision::Ignored,
            Some(GuestAction::Default) | None => match default_behavior(sig) {
                DefaultBehaviour::Ignore => ThunkDecision::Ignored,
                _ => ThunkDecision::Fallthrough,
            },
        }
    }

    /// Reinstalls the thunk for [`XID_SIGNAL`] if the guest's libc clobbered it (§4.7: "XID
    /// handler check").
    pub fn reinstall_xid_handler_if_clobbered(&mut self, currently_installed: bool) -> bool {
        if !currently_installed {
            self.table[XID_SIGNAL as usize].installed = true;
            return true;
        }

        false
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcMaskHow {
    Block,
    Unblock,
    Set,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThunkDecision {
    InvokeGuestHandler { handler: u64, uc_sigmask: u64 },
    Ignored,
    Deferred,
    Fallthrough,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_signal_is_deferred_and_counted_pending() {
        let delegator = SignalDelegator::new(64);
        let mut state = ThreadSignalState::default();
        state.current_mask = 1 << SIGTRAP;

        let decision = delegator.thunk_decision(&mut state, SIGTRAP);
        assert_eq!(decision, ThunkDecision::Deferred);
        assert!(state.pending & (1 << SIGTRAP) != 0);
    }

    #[test]
    fn required_signal_is_never_deferred_even_if_masked() {
        let delegator = SignalDelegator::new(64);
        let mut state = ThreadSignalState::default();
        state.current_mask = 1 << SIGSEGV;

        let decision = delegator.thunk_decision(&mut state, SIGSEGV);
        assert_ne!(decision, ThunkDecision::Deferred);
    }

    #[test]
    fn handler_decision_carries_computed_sigmask() {
        let mut delegator = SignalDelegator::new(64);
        delegator.register(SIGTRAP, GuestAction::Handler(0x4000), SaFlags::empty(), 0);
        let mut state = ThreadSignalState::default();

        match delegator.thunk_decision(&mut state, SIGTRAP) {
            ThunkDecision::InvokeGuestHandler { handler, uc_sigmask } => {
                assert_eq!(handler, 0x4000);
                assert!(uc_sigmask & (1 << SIGTRAP) != 0); // self-signal blocked, NODEFER unset.
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn nodefer_leaves_the_self_signal_unblocked() {
        let mut delegator = SignalDelegator::new(64);
        delegator.register(SIGTRAP, GuestAction::Handler(0x4000), SaFlags::NODEFER, 0);
        let mut state = ThreadSignalState::default();

        match delegator.thunk_decision(&mut state, SIGTRAP) {
            ThunkDecision::InvokeGuestHandler { uc_sigmask, .. } => {
                assert!(uc_sigmask & (1 << SIGTRAP) == 0);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn host_flags_drops_everything_but_the_forwardable_set() {
        let mut delegator = SignalDelegator::new(64);
        delegator.register(
            SIGTRAP,
            GuestAction::Handler(0x4000),
            SaFlags::NODEFER | SaFlags::SIGINFO | SaFlags::RESTART | SaFlags::NOCLDSTOP,
            0,
        );

        let forwarded = delegator.host_flags(SIGTRAP);
        assert_eq!(forwarded, SaFlags::RESTART | SaFlags::NOCLDSTOP);
        assert!(delegator.entry(SIGTRAP).guest_flags.contains(SaFlags::NODEFER));
    }

    #[test]
    fn register_then_restore_round_trips() {
        let mut delegator = SignalDelegator::new(64);
        let original = *delegator.entry(SIGTRAP);
        let old = delegator.register(SIGTRAP, GuestAction::Ignore, SaFlags::empty(), 0);
        delegator.restore(SIGTRAP, old);
        assert_eq!(delegator.entry(SIGTRAP).guest_action, original.guest_action);
    }

    #[test]
    fn unblocking_a_pending_signal_reports_it_for_self_raise() {
        let delegator = SignalDelegator::new(64);
        let mut state = ThreadSignalState::default();
        state.current_mask = 1 << SIGTRAP;
        state.pending = 1 << SIGTRAP;

        let to_raise = delegator.sigprocmask(&mut state, ProcMaskHow::Unblock, 1 << SIGTRAP);
        assert_eq!(to_raise, vec![SIGTRAP]);
    }

    #[test]
    fn sigkill_and_sigstop_cannot_be_masked() {
        let delegator = SignalDelegator::new(64);
        let mut state = ThreadSignalState::default();
        delegator.sigprocmask(&mut state, ProcMaskHow::Block, 1 << 9 | 1 << 19);
        assert_eq!(state.current_mask, 0);
    }

    #[test]
    fn altstack_rejected_while_active() {
        let delegator = SignalDelegator::new(64);
        let mut state = ThreadSignalState::default();
        state.on_alt_stack = true;
        let result = delegator.set_alt_stack(&mut state, 0x1000, 16 * 1024);
        assert!(result.is_err());
    }
}
