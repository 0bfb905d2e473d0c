//! The core translation and execution subsystem of an x86/x86-64 userland emulator running
//! guest Linux binaries on an AArch64 Linux host.
//!
//! This crate owns guest virtual memory tracking (C1) and allocation (C2), the on-disk (C3) and
//! in-memory (C4) code caches, the block translator (C6) and its register allocator, the
//! dispatcher trampoline's control logic (C5), the guest-to-host signal delegator (C7), the
//! thread manager (C8), and the memory- and thread-facing syscall surface (C9). The literal x86
//! decode table, the IR-to-AArch64 emitter, and the dispatcher's own hand-written assembly are
//! external collaborators this crate drives through the [`translator::Decoder`]/
//! [`translator::Emitter`] trait seams and the [`dispatcher`] module's decision logic,
//! respectively.

pub mod arch;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod ir;
pub mod mmap;
pub mod process;
pub mod regalloc;
pub mod runtime;
pub mod signal;
pub mod state;
pub mod syscall;
pub mod threadmgr;
pub mod translator;
pub mod valloc;
pub mod vcpu;
pub mod vma;

pub use config::Config;
pub use error::Error;
pub use process::GuestProcess;
pub use runtime::Runtime;
pub use vcpu::GuestThread;
