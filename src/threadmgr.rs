//! The thread manager and `clone` translation (C8, §4.8).
//!
//! Owns the set of live guest threads, keyed by guest TID. The actual host thread spawn, the real
//! `fork`/`clone` syscalls, and the event/futex primitives they coordinate with are out of this
//! crate's reach (§1); this module implements `HandleNewClone`'s flag validation and branching
//! plus the thread-table bookkeeping against an injected host-call seam, matching
//! `original_source/.../Syscalls/Thread.cpp` closely enough to test against (§4.8 implementation
//! note).

use crate::error::Error;
use std::collections::HashMap;

pub const CLONE_VM: u64 = 0x0000_0100;
pub const CLONE_FS: u64 = 0x0000_0200;
pub const CLONE_FILES: u64 = 0x0000_0400;
pub const CLONE_SIGHAND: u64 = 0x0000_0800;
pub const CLONE_PIDFD: u64 = 0x0000_1000;
pub const CLONE_VFORK: u64 = 0x0000_4000;
pub const CLONE_PARENT: u64 = 0x0000_8000;
pub const CLONE_THREAD: u64 = 0x0001_0000;
pub const CLONE_NEWNS: u64 = 0x0002_0000;
pub const CLONE_SYSVSEM: u64 = 0x0004_0000;
pub const CLONE_SETTLS: u64 = 0x0008_0000;
pub const CLONE_PARENT_SETTID: u64 = 0x0010_0000;
pub const CLONE_CHILD_CLEARTID: u64 = 0x0020_0000;
pub const CLONE_CHILD_SETTID: u64 = 0x0100_0000;

/// Namespace flags that §6 says must terminate the process with a diagnostic rather than be
/// emulated.
const UNSUPPORTED_NAMESPACE_FLAGS: u64 = CLONE_NEWNS
    | 0x0200_0000 // CLONE_NEWCGROUP
    | 0x0400_0000 // CLONE_NEWUTS
    | 0x0800_0000 // CLONE_NEWIPC
    | 0x1000_0000 // CLONE_NEWUSER
    | 0x2000_0000 // CLONE_NEWPID
    | 0x4000_0000; // CLONE_NEWNET

const CLONE_THREAD_REQUIRED: u64 = CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND;

/// Translated `clone3` argument struct, built from either the `clone3` syscall's argument block
/// or legacy `clone`'s positional arguments (§4.8).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clone3Args {
    pub flags: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub parent_tid_ptr: u64,
    pub child_tid_ptr: u64,
    pub exit_signal: u32,
}

impl Clone3Args {
    /// Builds a [`Clone3Args`] from legacy `clone(flags, stack, parent_tid, child_tid, tls)`'s
    /// positional arguments (§4.8: "translating legacy clone's positional args").
    pub fn from_legacy(flags: u64, stack: u64, parent_tid: u64, child_tid: u64, tls: u64) -> Self {
        Self {
            flags: flags & !0xff,
            stack,
            stack_size: 0,
            tls,
            parent_tid_ptr: parent_tid,
            child_tid_ptr: child_tid,
            exit_signal: (flags & 0xff) as u32,
        }
    }

    fn has(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }
}

/// What the caller of [`ThreadManager::handle_new_clone`] should actually do; the manager itself
/// never calls the host syscalls (§1 scope).
#[derive(Debug, PartialEq, Eq)]
pub enum CloneAction {
    /// Spawn a new worker thread sharing the parent's address space.
    SpawnThread { child_tid: u32 },
    /// `fork` (or flag-restricted `clone`) a new process; `vfork` additionally sets up the
    /// blocking pipe described in §4.8.
    ForkProcess { vfork: bool },
    /// A namespace flag was set; §6 requires terminating with a diagnostic.
    UnsupportedNamespace,
    /// `CLONE_THREAD` was requested without the required companion flags.
    InvalidThreadFlags,
}

#[derive(Clone, Debug)]
pub struct ThreadState {
    pub tid: u32,
    pub clear_child_tid: Option<u64>,
    pub is_vfork_child: bool,
}

/// The process-wide thread registry (C8).
pub struct ThreadManager {
    threads: HashMap<u32, ThreadState>,
    next_tid: u32,
}

impl ThreadManager {
    pub fn new(initial_tid: u32) -> Self {
        let mut threads = HashMap::new();
        threads.insert(initial_tid, ThreadState { tid: initial_tid, clear_child_tid: None, is_vfork_child: false });

        Self { threads, next_tid: initial_tid + 1 }
    }

    pub fn thread(&self, tid: u32) -> Option<&ThreadState> {
        self.threads.get(&tid)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// `HandleNewClone` (§4.8): validates flags and decides the branch the caller must take.
    /// Does not itself spawn anything; the caller drives the host-facing half of each branch.
    pub fn handle_new_clone(&mut self, args: &Clone3Args) -> CloneAction {
        if args.flags & UNSUPPORTED_NAMESPACE_FLAGS != 0 {
            return CloneAction::UnsupportedNamespace;
        }

        if args.has(CLONE_THREAD) {
            if args.flags & CLONE_THREAD_REQUIRED != CLONE_THREAD_REQUIRED {
                return CloneAction::InvalidThreadFlags;
            }

            let child_tid = self.next_tid;
            self.next_tid += 1;

            let clear_child_tid = if args.has(CLONE_CHILD_CLEARTID) { Some(args.child_tid_ptr) } else { None };

            self.threads.insert(child_tid, ThreadState { tid: child_tid, clear_child_tid, is_vfork_child: false });

            return CloneAction::SpawnThread { child_tid };
        }

        CloneAction::ForkProcess { vfork: args.has(CLONE_VFORK) }
    }

    /// Registers the child's thread state after a fork-like clone has actually happened on the
    /// host side; the manager has no visibility into process creation itself.
    pub fn register_forked_child(&mut self, tid: u32, vfork: bool) {
        self.threads.insert(tid, ThreadState { tid, clear_child_tid: None, is_vfork_child: vfork });
    }

    /// `exit` (§4.8): wakes `clear_child_tid` via the supplied futex-wake seam, removes the
    /// thread, and reports whether this was the last thread in the process (the caller is
    /// responsible for saving telemetry and issuing the real `exit_group`).
    pub fn exit_thread(&mut self, tid: u32, mut futex_wake: impl FnMut(u64)) -> Result<bool, Error> {
        let state = self.threads.remove(&tid).ok_or(Error::InvalidGuestAddress)?;

        if let Some(addr) = state.clear_child_tid {
            futex_wake(addr);
        }

        Ok(self.threads.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_thread_with_required_flags_spawns_a_thread() {
        let mut manager = ThreadManager::new(100);
        let args = Clone3Args {
            flags: CLONE_THREAD | CLONE_THREAD_REQUIRED,
            ..Default::default()
        };

        let action = manager.handle_new_clone(&args);
        assert_eq!(action, CloneAction::SpawnThread { child_tid: 101 });
        assert_eq!(manager.thread_count(), 2);
    }

    #[test]
    fn clone_thread_missing_companion_flags_is_rejected() {
        let mut manager = ThreadManager::new(100);
        let args = Clone3Args { flags: CLONE_THREAD | CLONE_VM, ..Default::default() };

        let action = manager.handle_new_clone(&args);
        assert_eq!(action, CloneAction::InvalidThreadFlags);
        assert_eq!(manager.thread_count(), 1);
    }

    #[test]
    fn clone_without_clone_thread_forks_a_process() {
        let mut manager = ThreadManager::new(100);
        let args = Clone3Args { flags: CLONE_VFORK, ..Default::default() };

        let action = manager.handle_new_clone(&args);
        assert_eq!(action, CloneAction::ForkProcess { vfork: true });
    }

    #[test]
    fn namespace_flags_are_rejected() {
        let mut manager = ThreadManager::new(100);
        let args = Clone3Args { flags: 0x2000_0000, ..Default::default() }; // CLONE_NEWPID

        let action = manager.handle_new_clone(&args);
        assert_eq!(action, CloneAction::UnsupportedNamespace);
    }

    #[test]
    fn legacy_clone_translates_positional_args() {
        let args = Clone3Args::from_legacy(CLONE_VM | 17, 0x7000, 0x8000, 0x9000, 0xa000);
        assert_eq!(args.flags, CLONE_VM);
        assert_eq!(args.exit_signal, 17);
        assert_eq!(args.stack, 0x7000);
        assert_eq!(args.parent_tid_ptr, 0x8000);
        assert_eq!(args.child_tid_ptr, 0x9000);
        assert_eq!(args.tls, 0xa000);
    }

    #[test]
    fn exit_wakes_clear_child_tid_and_reports_last_thread() {
        let mut manager = ThreadManager::new(100);
        let args = Clone3Args { flags: CLONE_THREAD | CLONE_THREAD_REQUIRED | CLONE_CHILD_CLEARTID, child_tid_ptr: 0x1234, ..Default::default() };
        manager.handle_new_clone(&args);

        let mut woken = Vec::new();
        let last = manager.exit_thread(101, |addr| woken.push(addr)).unwrap();
        assert!(!last);
        assert_eq!(woken, vec![0x1234]);

        let last = manager.exit_thread(100, |_| {}).unwrap();
        assert!(last);
    }

    #[test]
    fn exiting_an_unknown_thread_is_an_error() {
        let mut manager = ThreadManager::new(100);
        assert!(manager.exit_thread(999, |_| {}).is_err());
    }
}
