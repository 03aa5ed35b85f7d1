//! Configuration for Vessel
//!
//! Centralized configuration with sensible defaults. The temp directory is an
//! explicit value handed to the factory; nothing here is process-global.

use std::path::PathBuf;

use crate::padded::MIN_PADDED_SIZE;

/// Main configuration for a [`ContainerFactory`](crate::ContainerFactory)
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory for temp files. `None` resolves through
    /// [`TempDirResolver`](crate::path::TempDirResolver):
    /// `$VESSEL_TMPDIR`, then OS candidates, then the working directory.
    pub temp_dir: Option<PathBuf>,

    /// Size hints at or below this stay in RAM (in bytes)
    pub max_ram_size: u64,

    /// Never hand out memory containers, regardless of size hint
    pub force_disk: bool,

    /// Remove `.partial` files left behind by a crash when the factory starts
    pub clean_stale_temp_on_start: bool,

    /// Best-effort deletion of temp files when the factory's cleanup
    /// registry is dropped
    pub delete_on_exit: bool,

    // -------------------------------------------------------------------------
    // Decorator Configuration
    // -------------------------------------------------------------------------
    /// Encrypt everything the factory creates (requires a master secret)
    pub encrypt: bool,

    /// Pad everything the factory creates to a power of two
    pub pad: bool,

    /// Smallest physical size a padded container may have (in bytes)
    pub min_padded_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_dir: None,
            max_ram_size: 128 * 1024, // 128 KB
            force_disk: false,
            clean_stale_temp_on_start: true,
            delete_on_exit: true,
            encrypt: false,
            pad: false,
            min_padded_size: MIN_PADDED_SIZE,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the temp directory explicitly
    pub fn temp_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(path.into());
        self
    }

    /// Set the RAM threshold (in bytes)
    pub fn max_ram_size(mut self, size: u64) -> Self {
        self.config.max_ram_size = size;
        self
    }

    /// Always back containers with files
    pub fn force_disk(mut self, force: bool) -> Self {
        self.config.force_disk = force;
        self
    }

    /// Toggle stale temp-file cleanup on start
    pub fn clean_stale_temp_on_start(mut self, clean: bool) -> Self {
        self.config.clean_stale_temp_on_start = clean;
        self
    }

    /// Toggle best-effort deletion on exit
    pub fn delete_on_exit(mut self, delete: bool) -> Self {
        self.config.delete_on_exit = delete;
        self
    }

    /// Toggle encryption
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    /// Toggle padding
    pub fn pad(mut self, pad: bool) -> Self {
        self.config.pad = pad;
        self
    }

    /// Set the minimum padded size (in bytes)
    pub fn min_padded_size(mut self, size: u64) -> Self {
        self.config.min_padded_size = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
