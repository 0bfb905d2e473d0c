//! `GuestProcess` (§9 GLOSSARY): the per-guest-process struct owning C1/C2/C3/C7/C8 state,
//! analogous to the teacher's `Vm`.
//!
//! A `Runtime` (§9) constructs one of these per guest process. Everything here is guarded by a
//! plain `Mutex` per §5's shared-resource policy ("one mutex each" for the VMA tracker and
//! allocator, a process mutex for the code-cache files, `GuestDelegatorMutex` for the signal
//! table); no global state is reachable from anywhere else in this crate.

use crate::cache::disk::CodeCache;
use crate::cache::CacheEntry;
use crate::error::Error;
use crate::signal::{GuestAction, ProcMaskHow, SaFlags, SignalDelegator, SignalEntry, ThreadSignalState, ThunkDecision};
use crate::syscall::MemorySyscalls;
use crate::threadmgr::{Clone3Args, CloneAction, ThreadManager, ThreadState};
use crate::translator::{Decoder, Emitter, Translator, TranslatedBlock};
use crate::valloc::{MmapError, VaAllocator};
use crate::vma::{Prot, ResourceId, VmaTracker};
use std::path::Path;
use std::sync::Mutex;

/// The range the caller must invalidate in every thread's C4 lookup cache and exit-link table,
/// re-exported here for callers that only ever talk to [`GuestProcess`].
pub use crate::syscall::InvalidatedRange;

enum JitState {
    Writable(crate::mmap::MmapMut),
    Executable(crate::mmap::Mmap),
}

/// The JIT code arena C6 publishes host code into (§4.6 step 6, §9 "On-disk cache file mapping").
/// A single growable bump allocator; each [`JitArena::allocate`] call round-trips the buffer
/// through the mutable state to write the new bytes and back to executable before returning.
pub struct JitArena {
    state: Option<JitState>,
    base: u64,
    cursor: usize,
    capacity: usize,
}

impl JitArena {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        let buffer = crate::mmap::MmapMut::reserve(capacity)?;
        let base = buffer.host_address();
        let capacity = buffer.size();

        Ok(Self { state: Some(JitState::Writable(buffer)), base, cursor: 0, capacity })
    }

    pub fn allocate(&mut self, code: &[u8]) -> Result<u64, Error> {
        if self.cursor + code.len() > self.capacity {
            return Err(Error::ResourceExhausted("JIT code arena exhausted"));
        }

        let mut buffer = match self.state.take().expect("state always present between calls") {
            JitState::Writable(buffer) => buffer,
            JitState::Executable(exec) => exec.make_mut().map_err(|(_, e)| e)?,
        };

        let addr = self.base + self.cursor as u64;
        buffer.as_mut()[self.cursor..self.cursor + code.len()].copy_from_slice(code);
        self.cursor += code.len();

        let exec = buffer.make_exec().map_err(|(_, e)| e)?;
        self.state = Some(JitState::Executable(exec));

        Ok(addr)
    }
}

/// The process-wide translator, generic over whichever opcode table and AArch64 emitter the
/// embedder supplies; boxed so [`GuestProcess`] itself stays a plain, non-generic struct other
/// components can hold without threading type parameters through `Runtime`.
type ProcessTranslator = Translator<Box<dyn Decoder + Send + Sync>, Box<dyn Emitter + Send + Sync>>;

/// The per-guest-process struct (§9 GLOSSARY).
pub struct GuestProcess {
    va: VaAllocator,
    vma: Mutex<VmaTracker>,
    ir_cache: Mutex<CodeCache>,
    obj_cache: Mutex<CodeCache>,
    jit: Mutex<JitArena>,
    signals: Mutex<SignalDelegator>,
    threads: Mutex<ThreadManager>,
    translator: ProcessTranslator,
}

impl GuestProcess {
    /// Builds a fresh process: reserves the C2 region, opens both C3 cache pairs, and seeds C7/C8
    /// with the initial thread.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial_tid: u32,
        virtual_mem_upper_bound: u64,
        reserve: impl FnMut(u64, u64) -> bool,
        ir_index_path: &Path,
        ir_data_path: &Path,
        obj_index_path: &Path,
        obj_data_path: &Path,
        cache_fourcc: [u8; 4],
        cache_version: u32,
        jit_capacity: usize,
        pause_signal: u32,
        decoder: impl Decoder + Send + Sync + 'static,
        emitter: impl Emitter + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        Ok(Self {
            va: VaAllocator::new(virtual_mem_upper_bound, reserve),
            vma: Mutex::new(VmaTracker::new()),
            ir_cache: Mutex::new(CodeCache::open(ir_index_path, ir_data_path, cache_fourcc, cache_version)?),
            obj_cache: Mutex::new(CodeCache::open(obj_index_path, obj_data_path, cache_fourcc, cache_version)?),
            jit: Mutex::new(JitArena::new(jit_capacity)?),
            signals: Mutex::new(SignalDelegator::new(pause_signal)),
            threads: Mutex::new(ThreadManager::new(initial_tid)),
            translator: Translator::new(
                Box::new(decoder) as Box<dyn Decoder + Send + Sync>,
                Box::new(emitter) as Box<dyn Emitter + Send + Sync>,
            ),
        })
    }

    /// Runs C6 end to end, locking the on-disk caches (C3) and the JIT arena only for the
    /// duration of one block's translation (§5: code-cache mutex "held only during index
    /// mutations").
    pub fn translate_block(
        &self,
        guest_rip: u64,
        max_instructions: usize,
        read_guest: impl FnMut(u64, u64) -> Vec<u8>,
    ) -> Result<TranslatedBlock, Error> {
        let mut ir_cache = self.ir_cache.lock().unwrap();
        let mut obj_cache = self.obj_cache.lock().unwrap();
        let mut jit = self.jit.lock().unwrap();

        self.translator.translate(
            guest_rip,
            max_instructions,
            read_guest,
            |code| jit.allocate(code).expect("JIT code arena exhausted"),
            &mut ir_cache,
            &mut obj_cache,
        )
    }

    fn with_memory_syscalls<T>(&self, f: impl FnOnce(&mut MemorySyscalls) -> T) -> T {
        let mut guard = self.vma.lock().unwrap();
        let taken = std::mem::replace(&mut *guard, VmaTracker::new());
        let mut syscalls = MemorySyscalls::from_parts(&self.va, taken);
        let result = f(&mut syscalls);
        *guard = syscalls.into_vma();
        result
    }

    pub fn mmap(
        &self,
        addr: u64,
        length: u64,
        prot: Prot,
        shared: bool,
        resource: Option<ResourceId>,
        offset: u64,
        place: impl FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(u64, InvalidatedRange), MmapError> {
        self.with_memory_syscalls(|s| s.mmap(addr, length, prot, shared, resource, offset, place))
    }

    pub fn munmap(&self, addr: u64, length: u64) -> Result<(InvalidatedRange, Vec<ResourceId>), MmapError> {
        self.with_memory_syscalls(|s| s.munmap(addr, length))
    }

    pub fn mprotect(&self, addr: u64, length: u64, new_prot: Prot) -> InvalidatedRange {
        self.with_memory_syscalls(|s| s.mprotect(addr, length, new_prot))
    }

    pub fn mremap(
        &self,
        old_addr: u64,
        old_length: u64,
        new_length: u64,
        place: impl FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(u64, [InvalidatedRange; 2], Vec<ResourceId>), MmapError> {
        self.with_memory_syscalls(|s| s.mremap(old_addr, old_length, new_length, place))
    }

    pub fn shmat(
        &self,
        addr: u64,
        length: u64,
        prot: Prot,
        resource: ResourceId,
        place: impl FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(u64, InvalidatedRange), MmapError> {
        self.with_memory_syscalls(|s| s.shmat(addr, length, prot, resource, place))
    }

    pub fn shmdt(&self, addr: u64) -> Result<(InvalidatedRange, ResourceId), Error> {
        self.with_memory_syscalls(|s| s.shmdt(addr))
    }

    /// `clone`/`clone3` (§4.8): validates `args` and reports what the caller must do next.
    pub fn handle_new_clone(&self, args: &Clone3Args) -> CloneAction {
        self.threads.lock().unwrap().handle_new_clone(args)
    }

    pub fn register_forked_child(&self, tid: u32, vfork: bool) {
        self.threads.lock().unwrap().register_forked_child(tid, vfork)
    }

    pub fn exit_thread(&self, tid: u32, futex_wake: impl FnMut(u64)) -> Result<bool, Error> {
        self.threads.lock().unwrap().exit_thread(tid, futex_wake)
    }

    pub fn thread(&self, tid: u32) -> Option<ThreadState> {
        self.threads.lock().unwrap().thread(tid).cloned()
    }

    pub fn register_signal(&self, sig: u32, action: GuestAction, flags: SaFlags, mask: u64) -> SignalEntry {
        self.signals.lock().unwrap().register(sig, action, flags, mask)
    }

    pub fn restore_signal(&self, sig: u32, previous: SignalEntry) {
        self.signals.lock().unwrap().restore(sig, previous)
    }

    pub fn sigprocmask(&self, state: &mut ThreadSignalState, how: ProcMaskHow, arg: u64) -> Vec<u32> {
        self.signals.lock().unwrap().sigprocmask(state, how, arg)
    }

    pub fn thunk_decision(&self, state: &mut ThreadSignalState, sig: u32) -> ThunkDecision {
        self.signals.lock().unwrap().thunk_decision(state, sig)
    }

    /// A mapping change invalidates the on-disk cache indirectly only through the in-memory C4
    /// lookup cache each [`crate::vcpu::GuestThread`] owns; this just reports the resources freed
    /// so the caller can invalidate every thread's C4/exit-link state (§5: "global invalidation
    /// broadcasts via the signal-based pause mechanism").
    pub fn cache_entry_for(&self, cache: &str, offset_rip: u64, guest_rip: u64, read_range: impl FnMut(u64, u64) -> Vec<u8>) -> Result<Option<CacheEntry>, Error> {
        match cache {
            "ir" => self.ir_cache.lock().unwrap().find(offset_rip, guest_rip, read_range),
            "obj" => self.obj_cache.lock().unwrap().find(offset_rip, guest_rip, read_range),
            _ => Err(Error::NotImplemented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrList;
    use crate::regalloc::Allocation;
    use crate::translator::DecodedInstruction;

    struct NullDecoder;
    impl Decoder for NullDecoder {
        fn decode(&self, guest_rip: u64, _max: usize) -> Vec<DecodedInstruction> {
            vec![DecodedInstruction {
                range: crate::cache::GuestRange { start_offset: 0, length: 1 },
                ops: vec![],
                terminator: Some(crate::translator::Terminator::Jump { target: guest_rip + 1 }),
            }]
        }
    }

    struct NullEmitter;
    impl Emitter for NullEmitter {
        fn emit(&self, _ir: &IrList, _allocation: &Allocation) -> Vec<u8> {
            vec![0u8; 4]
        }
    }

    fn test_process(dir: &tempfile::TempDir) -> GuestProcess {
        GuestProcess::new(
            100,
            crate::valloc::LOWER_BOUND + 16 * 4096,
            |_, _| true,
            &dir.path().join("ir.index"),
            &dir.path().join("ir.data"),
            &dir.path().join("obj.index"),
            &dir.path().join("obj.data"),
            *b"TEST",
            1,
            1 << 16,
            64,
            NullDecoder,
            NullEmitter,
        )
        .unwrap()
    }

    #[test]
    fn mmap_then_munmap_round_trips_through_locked_vma() {
        let dir = tempfile::tempdir().unwrap();
        let process = test_process(&dir);

        let (addr, _) = process.mmap(0, 4096, Prot::READ | Prot::WRITE, false, None, 0, |_, _| Ok(())).unwrap();
        let (_, freed) = process.munmap(addr, 4096).unwrap();
        assert!(freed.is_empty());
    }

    #[test]
    fn translate_block_populates_and_then_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let process = test_process(&dir);

        let first = process.translate_block(0x4000, 16, |_, len| vec![0u8; len as usize]).unwrap();
        assert!(!first.from_cache);

        let second = process.translate_block(0x4000, 16, |_, len| vec![0u8; len as usize]).unwrap();
        assert!(second.from_cache);
    }

    #[test]
    fn clone_and_exit_round_trip_through_locked_thread_manager() {
        let dir = tempfile::tempdir().unwrap();
        let process = test_process(&dir);

        let args = Clone3Args {
            flags: crate::threadmgr::CLONE_THREAD
                | crate::threadmgr::CLONE_VM
                | crate::threadmgr::CLONE_FS
                | crate::threadmgr::CLONE_FILES
                | crate::threadmgr::CLONE_SIGHAND,
            ..Default::default()
        };

        match process.handle_new_clone(&args) {
            CloneAction::SpawnThread { child_tid } => {
                assert!(process.thread(child_tid).is_some());
                assert!(!process.exit_thread(child_tid, |_| {}).unwrap());
            }
            other => panic!("unexpected clone action: {other:?}"),
        }
    }
}
