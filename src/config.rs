//! Process-wide configuration, read once at startup.
//!
//! The CLI/config loading mechanism itself sits outside the core (§1); this module only defines
//! the shape the core needs and a convenience constructor that reads it from the environment.

use std::path::PathBuf;

/// Configuration read once at process start and handed to [`crate::runtime::Runtime::new`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the guest rootfs used to resolve guest file paths.
    pub rootfs_path: PathBuf,
    /// Directory containing thunked host libraries, if thunking is enabled.
    pub thunk_library_dir: Option<PathBuf>,
    /// Whether the on-disk (AOT) code cache is consulted and written to.
    pub aot_cache_enabled: bool,
    /// Directory the IR and Obj code-cache file pairs are created under, name-keyed by guest
    /// binary (§3: "Code-cache files").
    pub cache_dir: PathBuf,
    /// Overrides the guest-visible virtual memory size instead of probing the host.
    pub virtual_mem_size_override: Option<u64>,
    /// Filter string passed to [`tracing_subscriber::EnvFilter`].
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rootfs_path: PathBuf::from("/"),
            thunk_library_dir: None,
            aot_cache_enabled: true,
            cache_dir: std::env::temp_dir().join("fex-emu-cache"),
            virtual_mem_size_override: None,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads configuration from the process environment, falling back to defaults for anything
    /// unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FEX_ROOTFS") {
            config.rootfs_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("FEX_THUNK_LIBS") {
            config.thunk_library_dir = Some(PathBuf::from(path));
        }

        if let Ok(value) = std::env::var("FEX_DISABLEAOT") {
            config.aot_cache_enabled = value != "1";
        }

        if let Ok(path) = std::env::var("FEX_CACHE_DIR") {
            config.cache_dir = PathBuf::from(path);
        }

        if let Ok(value) = std::env::var("FEX_VIRTUAL_MEM_SIZE") {
            if let Ok(size) = value.parse() {
                config.virtual_mem_size_override = Some(size);
            }
        }

        if let Ok(filter) = std::env::var("RUST_LOG") {
            config.log_filter = filter;
        }

        config
    }

    /// Installs a [`tracing_subscriber`] subscriber using this configuration's log filter. Should
    /// be called at most once per process.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.log_filter)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_enables_aot_cache() {
        let config = Config::default();
        assert!(config.aot_cache_enabled);
        assert_eq!(config.rootfs_path, PathBuf::from("/"));
    }
}
