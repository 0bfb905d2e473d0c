//! The per-thread guest CPU state (§3: "Guest CPU state").
//!
//! `GuestCpuState` is laid out so that a hand-written dispatcher trampoline could reach every
//! field by a fixed compile-time offset; the struct itself is plain, `repr(C)` data with no
//! padding-sensitive behavior relied on outside of `memoffset`-style field access, which this
//! crate does not perform (the trampoline itself is out of scope, see [`crate::dispatcher`]).

use crate::fault::RFlagsBytes;

/// Number of general-purpose 64-bit registers in 64-bit guest mode.
pub const GPR_COUNT_64: usize = 16;
/// Number of 128-bit vector registers when the host lacks wide-vector support.
pub const VECTOR_COUNT_SSE: usize = 16;
/// Number of 256-bit vector registers when AVX lowering is available.
pub const VECTOR_COUNT_AVX: usize = 16;

/// An opaque 80-bit x87 register; softened to 64 bits is permitted by configuration (§9) but the
/// wider representation is kept here so no precision is silently discarded by this crate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct X87Register(pub [u8; 10]);

/// Bookkeeping the thread manager (C8) needs attached to every guest thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadManagerFields {
    pub tid: i32,
    pub pid: i32,
    pub clear_child_tid: u64,
    pub set_child_tid: u64,
    pub robust_list_head: u64,
}

/// An opaque word describing whether the thread is currently inside a syscall, and if so which
/// one; used by the signal delegator to decide whether a deferred signal can be delivered
/// immediately or must wait for the syscall to return.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InSyscallInfo {
    pub in_syscall: bool,
    pub syscall_number: i64,
}

/// The process-wide per-thread guest CPU state (§3).
#[derive(Clone, Debug)]
pub struct GuestCpuState {
    /// General-purpose registers, indexed by [`crate::arch::x86_64::Register`] discriminant order
    /// excluding `Rip`/`Rflags`.
    pub gprs: [u64; GPR_COUNT_64],
    pub rip: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub flags: RFlagsBytes,
    pub vectors: Vec<[u8; 32]>,
    pub x87_stack: [X87Register; 8],
    pub tls_base: u64,
    pub thread: ThreadManagerFields,
    /// Incremented by `SpillStaticRegs` at every world boundary; a nonzero value tells the
    /// signal thunk that a deferred signal check is pending (§4.5, §4.7).
    pub deferred_signal_ref_count: u32,
    pub in_syscall: InSyscallInfo,
}

impl Default for GuestCpuState {
    fn default() -> Self {
        Self {
            gprs: [0; GPR_COUNT_64],
            rip: 0,
            fs_base: 0,
            gs_base: 0,
            flags: RFlagsBytes::default(),
            vectors: vec![[0u8; 32]; VECTOR_COUNT_AVX],
            x87_stack: [X87Register::default(); 8],
            tls_base: 0,
            thread: ThreadManagerFields::default(),
            deferred_signal_ref_count: 0,
            in_syscall: InSyscallInfo::default(),
        }
    }
}

impl GuestCpuState {
    /// Sets `FS`/`GS` base after the canonical-address check required by `arch_prctl` (§4.9).
    pub fn set_fs_base(&mut self, addr: u64) -> Result<(), crate::error::Error> {
        const TASK_MAX: u64 = 1 << 48;

        if addr >= TASK_MAX {
            return Err(crate::error::Error::ResourceExhausted("non-canonical FS base"));
        }

        self.fs_base = addr;

        Ok(())
    }

    /// Sets `GS` base after the canonical-address check required by `arch_prctl` (§4.9).
    pub fn set_gs_base(&mut self, addr: u64) -> Result<(), crate::error::Error> {
        const TASK_MAX: u64 = 1 << 48;

        if addr >= TASK_MAX {
            return Err(crate::error::Error::ResourceExhausted("non-canonical GS base"));
        }

        self.gs_base = addr;

        Ok(())
    }
}
