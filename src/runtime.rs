//! `Runtime` (§9 GLOSSARY, "Decision"): the top-level, explicitly-owned struct analogous to the
//! teacher's `Hypervisor`. Constructed once via [`Runtime::new`]; nothing in
//! this crate reaches for a `static`/`lazy_static` global, matching §9's decision to keep every
//! piece of state reachable from a value the embedder holds.

use crate::config::Config;
use crate::error::Error;
use crate::process::GuestProcess;
use crate::translator::{Decoder, Emitter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Default guest-visible virtual address space size when [`Config::virtual_mem_size_override`]
/// is unset; matches a 48-bit canonical host address space (§3).
const DEFAULT_VIRTUAL_MEM_SIZE: u64 = 1 << 47;

/// Owns every [`GuestProcess`] this embedding has spawned.
pub struct Runtime {
    config: Config,
    processes: Mutex<HashMap<u32, Arc<GuestProcess>>>,
}

impl Runtime {
    /// Installs tracing per `config`, then returns an otherwise empty runtime.
    pub fn new(config: Config) -> Self {
        config.init_tracing();

        Self { config, processes: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn virtual_mem_size(&self) -> u64 {
        self.config.virtual_mem_size_override.unwrap_or(DEFAULT_VIRTUAL_MEM_SIZE)
    }

    /// Spawns a [`GuestProcess`] for `binary_name`, opening its code-cache file pairs under
    /// [`Config::cache_dir`] (§3: "name-keyed by the guest binary"). If
    /// [`Config::aot_cache_enabled`] is false, the pair still lives on disk for this run (the
    /// on-disk cache's only role is persistence across runs; §7 has no notion of an
    /// in-memory-only C3), but the caller is expected to point `cache_dir` at a scratch directory
    /// in that mode.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_process(
        &self,
        pid: u32,
        binary_name: &str,
        initial_tid: u32,
        jit_capacity: usize,
        pause_signal: u32,
        decoder: impl Decoder + Send + Sync + 'static,
        emitter: impl Emitter + Send + Sync + 'static,
    ) -> Result<Arc<GuestProcess>, Error> {
        std::fs::create_dir_all(&self.config.cache_dir)?;

        let ir_index_path = self.config.cache_dir.join(format!("{binary_name}.ir.index"));
        let ir_data_path = self.config.cache_dir.join(format!("{binary_name}.ir.data"));
        let obj_index_path = self.config.cache_dir.join(format!("{binary_name}.obj.index"));
        let obj_data_path = self.config.cache_dir.join(format!("{binary_name}.obj.data"));

        let process = Arc::new(GuestProcess::new(
            initial_tid,
            self.virtual_mem_size(),
            |_, _| true,
            &ir_index_path,
            &ir_data_path,
            &obj_index_path,
            &obj_data_path,
            *b"FEXR",
            1,
            jit_capacity,
            pause_signal,
            decoder,
            emitter,
        )?);

        self.processes.lock().unwrap().insert(pid, process.clone());

        Ok(process)
    }

    pub fn process(&self, pid: u32) -> Option<Arc<GuestProcess>> {
        self.processes.lock().unwrap().get(&pid).cloned()
    }

    /// Drops a process's state once every thread in it has exited.
    pub fn remove_process(&self, pid: u32) -> Option<Arc<GuestProcess>> {
        self.processes.lock().unwrap().remove(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrList;
    use crate::regalloc::Allocation;
    use crate::translator::{DecodedInstruction, Terminator};

    struct NullDecoder;
    impl Decoder for NullDecoder {
        fn decode(&self, guest_rip: u64, _max: usize) -> Vec<DecodedInstruction> {
            vec![DecodedInstruction {
                range: crate::cache::GuestRange { start_offset: 0, length: 1 },
                ops: vec![],
                terminator: Some(Terminator::Jump { target: guest_rip + 1 }),
            }]
        }
    }

    struct NullEmitter;
    impl Emitter for NullEmitter {
        fn emit(&self, _ir: &IrList, _allocation: &Allocation) -> Vec<u8> {
            vec![0u8; 4]
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config { cache_dir: dir.path().to_path_buf(), ..Config::default() }
    }

    #[test]
    fn spawn_then_lookup_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(test_config(&dir));

        let process = runtime.spawn_process(1, "guest-bin", 100, 1 << 16, 64, NullDecoder, NullEmitter).unwrap();
        assert_eq!(runtime.process_count(), 1);
        assert!(Arc::ptr_eq(&process, &runtime.process(1).unwrap()));

        assert!(runtime.remove_process(1).is_some());
        assert_eq!(runtime.process_count(), 0);
    }

    #[test]
    fn spawning_the_same_binary_name_twice_reuses_the_cache_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::new(test_config(&dir));

        runtime.spawn_process(1, "guest-bin", 100, 1 << 16, 64, NullDecoder, NullEmitter).unwrap();
        runtime.remove_process(1);

        assert!(runtime.spawn_process(2, "guest-bin", 200, 1 << 16, 64, NullDecoder, NullEmitter).is_ok());
    }
}
