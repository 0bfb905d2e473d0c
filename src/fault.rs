//! Classification of guest instruction faults into the signal/trapno/err/si_code tuple the
//! delegator (§4.7) must deliver to the guest, and reconstruction of EFLAGS for signal delivery.
//!
//! The opcode-to-fault mapping below is a fixed table (§6); it does not depend on the instruction
//! decoder that lives outside this crate's scope, only on the already-classified opcode kind the
//! translator driver (§4.6) hands it.

/// The host signal number the delegator must synthesize for a guest fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
    Trap,
    Illegal,
    SegV,
}

/// A fully classified guest fault, ready to be handed to the signal delegator (C7) for delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GuestFault {
    pub signal: Signal,
    pub trapno: i32,
    pub err: i32,
    pub si_code: i32,
}

impl GuestFault {
    const fn new(signal: Signal, trapno: i32, err: i32, si_code: i32) -> Self {
        Self { signal, trapno, err, si_code }
    }
}

/// Classifies a guest `int N` instruction. `int 1` is special-cased to a `SIGTRAP`; every other
/// vector raises `SIGSEGV` with `err = (N << 3) | 2`.
pub fn int_n(vector: u8) -> GuestFault {
    if vector == 1 {
        return GuestFault::new(Signal::Trap, 1, 0, 1);
    }

    let err = ((vector as i32) << 3) | 2;

    GuestFault::new(Signal::SegV, 13, err, 0x80)
}

/// Classifies `int3` / the breakpoint opcode.
pub fn int3() -> GuestFault {
    GuestFault::new(Signal::Trap, 3, 0, 0x80)
}

/// Classifies `ud2` and any other instruction the decoder recognizes but cannot lift.
pub fn ud2() -> GuestFault {
    GuestFault::new(Signal::Illegal, 6, 0, 2)
}

/// Classifies an opcode from an unsupported instruction family (§6): anything not in base
/// integer, x87, MMX, SSE-SSE4.2, AES-NI, PCLMUL, AVX1/AVX2, BMI1/2, ADX, RDRAND/RDSEED, SHA-NI,
/// CLMUL, or an invalid VEX/AVX encoding.
pub fn unsupported_opcode() -> GuestFault {
    GuestFault::new(Signal::Illegal, 6, 0, 2)
}

/// Classifies a privileged instruction (`rdmsr`, `wrmsr`, `swapgs`, `cli`, `sti`, `lmsw`, `ltr`,
/// CR/DR moves, `invlpg`, `rdpmc`, `sysret`, `outs`, `ins`, `clts`).
pub fn privileged_instruction() -> GuestFault {
    GuestFault::new(Signal::SegV, 13, 0, 0x80)
}

/// Classifies `monitor`, `mwait`, `sysenter`, `sysexit`.
pub fn unsupported_system_instruction() -> GuestFault {
    GuestFault::new(Signal::Illegal, 6, 0, 2)
}

/// Classifies a trap-flag single-step completion (§6: "Trap flag").
pub fn trap_flag_step() -> GuestFault {
    GuestFault::new(Signal::Trap, 1, 0, 2)
}

/// Per-flag decomposition of RFLAGS, matching the `GuestCpuState` layout (§3): one byte per
/// defined flag bit so the register allocator can treat each flag as an independently live SSA
/// value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RFlagsBytes {
    pub cf: bool,
    pub pf: bool,
    pub af: bool,
    pub zf: bool,
    pub sf: bool,
    pub tf: bool,
    pub r#if: bool,
    pub df: bool,
    pub of: bool,
    pub iopl: u8,
    pub nt: bool,
    pub rf: bool,
    pub vm: bool,
    pub ac: bool,
    pub vif: bool,
    pub vip: bool,
    pub id: bool,
}

/// Reconstructs a packed EFLAGS value from the per-flag byte representation, as required when
/// delivering a guest signal (§6: "Signals carry EFLAGS").
pub fn reconstruct_eflags(flags: &RFlagsBytes) -> u64 {
    let mut eflags: u64 = 1 << 1; // bit 1 is reserved, always set on real x86 hardware.

    eflags |= (flags.cf as u64) << 0;
    eflags |= (flags.pf as u64) << 2;
    eflags |= (flags.af as u64) << 4;
    eflags |= (flags.zf as u64) << 6;
    eflags |= (flags.sf as u64) << 7;
    eflags |= (flags.tf as u64) << 8;
    eflags |= (flags.r#if as u64) << 9;
    eflags |= (flags.df as u64) << 10;
    eflags |= (flags.of as u64) << 11;
    eflags |= ((flags.iopl & 0x3) as u64) << 12;
    eflags |= (flags.nt as u64) << 14;
    eflags |= (flags.rf as u64) << 16;
    eflags |= (flags.vm as u64) << 17;
    eflags |= (flags.ac as u64) << 18;
    eflags |= (flags.vif as u64) << 19;
    eflags |= (flags.vip as u64) << 20;
    eflags |= (flags.id as u64) << 21;

    eflags
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 1: invalid `int 1`.
    #[test]
    fn int1_raises_sigtrap() {
        let fault = int_n(1);
        assert_eq!(fault.signal, Signal::Trap);
        assert_eq!(fault.trapno, 1);
        assert_eq!(fault.err, 0);
        assert_eq!(fault.si_code, 1);
    }

    /// Scenario 2: `int 0x2d`.
    #[test]
    fn int_0x2d_raises_sigsegv_with_computed_err() {
        let fault = int_n(0x2d);
        assert_eq!(fault.signal, Signal::SegV);
        assert_eq!(fault.trapno, 13);
        assert_eq!(fault.err, 362);
        assert_eq!(fault.si_code, 128);
    }

    /// Scenario 3: `ud2`.
    #[test]
    fn ud2_raises_sigill() {
        let fault = ud2();
        assert_eq!(fault.signal, Signal::Illegal);
        assert_eq!(fault.trapno, 6);
        assert_eq!(fault.err, 0);
        assert_eq!(fault.si_code, 2);
    }

    /// Scenario 4: privileged `rdmsr`.
    #[test]
    fn privileged_instruction_raises_sigsegv() {
        let fault = privileged_instruction();
        assert_eq!(fault.signal, Signal::SegV);
        assert_eq!(fault.trapno, 13);
        assert_eq!(fault.err, 0);
        assert_eq!(fault.si_code, 0x80);
    }

    /// Scenario 5: trap-flag single-step.
    #[test]
    fn trap_flag_raises_sigtrap_with_code_2() {
        let fault = trap_flag_step();
        assert_eq!(fault.signal, Signal::Trap);
        assert_eq!(fault.trapno, 1);
        assert_eq!(fault.si_code, 2);
    }

    /// Scenario 6: flag preservation on signal, `stc` sets CF.
    #[test]
    fn eflags_reconstruction_preserves_carry_flag() {
        let mut flags = RFlagsBytes::default();
        flags.cf = true;
        let eflags = reconstruct_eflags(&flags);
        assert_eq!(eflags & 1, 1);

        flags.cf = false;
        let eflags = reconstruct_eflags(&flags);
        assert_eq!(eflags & 1, 0);
    }

    #[test]
    fn eflags_reconstruction_places_each_flag_at_its_bit() {
        let flags = RFlagsBytes {
            pf: true,
            zf: true,
            sf: true,
            of: true,
            ..Default::default()
        };
        let eflags = reconstruct_eflags(&flags);

        assert_eq!((eflags >> 2) & 1, 1, "PF");
        assert_eq!((eflags >> 6) & 1, 1, "ZF");
        assert_eq!((eflags >> 7) & 1, 1, "SF");
        assert_eq!((eflags >> 11) & 1, 1, "OF");
    }
}
