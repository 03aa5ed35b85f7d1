//! Container Factory
//!
//! Builds decorator stacks from a [`Config`] and hands them out as plain
//! `Box<dyn Container>` / `Box<dyn RandomBuffer>`.
//!
//! ## Stack Assembly
//! ```text
//! size hint ≤ max_ram_size && !force_disk ─► MemoryContainer
//! otherwise                               ─► FileContainer (temp path)
//!        │
//!        ├─ config.encrypt ─► EncryptedContainer
//!        ├─ config.pad     ─► PaddedContainer
//!        └─ persistent     ─► DelayedDisposalContainer
//! ```

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::{
    cleanup_stale_temp_files, Container, CreateMode, ExitCleanup, FileBuffer, FileContainer, FileOptions,
    MemoryBuffer, MemoryContainer, RandomBuffer,
};
use crate::crypto::{HkdfSha256, KeyDerivation, MasterSecret, HEADER_LEN};
use crate::disposal::{CommitTracker, DelayedDisposalBuffer, DelayedDisposalContainer};
use crate::encrypted::{EncryptedBuffer, EncryptedContainer};
use crate::error::{Result, VesselError};
use crate::padded::{padded_size, PaddedBuffer, PaddedContainer};
use crate::path::{PathResolver, TempDirResolver};
use crate::persist::{self, RestoreContext};

/// Produces containers and buffers configured by one [`Config`]
pub struct ContainerFactory {
    config: Config,
    /// Directory for every file this factory creates
    resolver: Arc<dyn PathResolver>,
    /// Required when `config.encrypt` is set or a frame holds encrypted layers
    secret: Option<Arc<MasterSecret>>,
    key_derivation: Arc<dyn KeyDerivation>,
    /// Required for persistent containers and buffers
    tracker: Option<Arc<dyn CommitTracker>>,
    /// Shared by every temp file; `None` when `config.delete_on_exit` is off
    exit_cleanup: Option<Arc<ExitCleanup>>,
    /// Next `vessel-<id>.tmp` number
    next_id: AtomicU64,
}

impl ContainerFactory {
    /// Resolve the temp directory from `config` and open a factory on it
    pub fn open(config: Config) -> Result<Self> {
        let resolver = TempDirResolver::resolve(config.temp_dir.as_deref())?;
        Self::new(config, Arc::new(resolver))
    }

    /// Open a factory over an explicit resolver
    ///
    /// Cleans stale `.partial` files if configured, and continues numbering
    /// after the highest id already present in the directory.
    pub fn new(config: Config, resolver: Arc<dyn PathResolver>) -> Result<Self> {
        let dir = resolver.temp_dir().to_path_buf();
        if config.clean_stale_temp_on_start {
            let removed = cleanup_stale_temp_files(&dir)?;
            if removed > 0 {
                info!(dir = %dir.display(), removed, "Removed stale partial files");
            }
        }
        let next_id = highest_id(resolver.as_ref(), &dir)?.map_or(0, |id| id + 1);
        let exit_cleanup = config.delete_on_exit.then(|| Arc::new(ExitCleanup::new()));

        info!(dir = %dir.display(), next_id, encrypt = config.encrypt, pad = config.pad, "Container factory ready");

        Ok(Self {
            config,
            resolver,
            secret: None,
            key_derivation: Arc::new(HkdfSha256),
            tracker: None,
            exit_cleanup,
            next_id: AtomicU64::new(next_id),
        })
    }

    pub fn with_secret(mut self, secret: MasterSecret) -> Self {
        self.secret = Some(Arc::new(secret));
        self
    }

    pub fn with_key_derivation(mut self, kdf: Arc<dyn KeyDerivation>) -> Self {
        self.key_derivation = kdf;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn CommitTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn temp_dir(&self) -> &Path {
        self.resolver.temp_dir()
    }

    /// Registry of temp files deleted when the factory is dropped
    pub fn exit_cleanup(&self) -> Option<&Arc<ExitCleanup>> {
        self.exit_cleanup.as_ref()
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Container for roughly `size_hint` bytes
    pub fn make_container(&self, size_hint: u64) -> Result<Box<dyn Container>> {
        let raw: Box<dyn Container> = if self.fits_in_ram(size_hint) {
            Box::new(MemoryContainer::new())
        } else {
            let path = self.next_path();
            debug!(path = %path.display(), size_hint, "Creating temp file container");
            Box::new(FileContainer::new(path, FileOptions::temp(self.exit_cleanup.clone())))
        };
        self.decorate_container(raw)
    }

    /// File-backed container that survives restarts via [`persist`](Container::persist)
    ///
    /// Its file is created up front and deletion goes through the commit
    /// tracker.
    pub fn make_persistent_container(&self) -> Result<Box<dyn Container>> {
        let tracker = self.require_tracker()?;
        let path = self.create_persistent_file()?;
        let identity = file_identity(&path);
        let raw = Box::new(FileContainer::new(
            path,
            FileOptions {
                mode: CreateMode::MustExist,
                delete_on_dispose: true,
                exit_cleanup: None,
                read_only: false,
            },
        ));
        let decorated = self.decorate_container(raw)?;
        Ok(Box::new(DelayedDisposalContainer::with_identity(decorated, identity, tracker)))
    }

    fn decorate_container(&self, mut container: Box<dyn Container>) -> Result<Box<dyn Container>> {
        if self.config.encrypt {
            let secret = self.require_secret()?;
            container = Box::new(EncryptedContainer::new(container, secret, Arc::clone(&self.key_derivation))?);
        }
        if self.config.pad {
            container = Box::new(PaddedContainer::with_min_size(container, self.config.min_padded_size));
        }
        Ok(container)
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Zero-filled random-access buffer of `size` logical bytes
    pub fn make_buffer(&self, size: u64) -> Result<Box<dyn RandomBuffer>> {
        let physical = self.physical_buffer_size(size)?;
        let raw: Box<dyn RandomBuffer> = if self.fits_in_ram(physical) {
            Box::new(MemoryBuffer::new(physical))
        } else {
            let path = self.next_path();
            debug!(path = %path.display(), physical, "Creating temp file buffer");
            let buffer = FileBuffer::create(path, physical, true)?;
            match &self.exit_cleanup {
                Some(cleanup) => Box::new(buffer.with_exit_cleanup(Arc::clone(cleanup))),
                None => Box::new(buffer),
            }
        };
        self.decorate_buffer(raw, size)
    }

    /// File-backed buffer whose deletion goes through the commit tracker
    pub fn make_persistent_buffer(&self, size: u64) -> Result<Box<dyn RandomBuffer>> {
        let tracker = self.require_tracker()?;
        let physical = self.physical_buffer_size(size)?;
        let path = self.next_path();
        let identity = file_identity(&path);
        let raw = Box::new(FileBuffer::create(path, physical, true)?);
        let decorated = self.decorate_buffer(raw, size)?;
        Ok(Box::new(DelayedDisposalBuffer::with_identity(decorated, identity, tracker)))
    }

    /// Bytes the raw buffer needs for `size` logical bytes after every layer
    fn physical_buffer_size(&self, size: u64) -> Result<u64> {
        let mut physical = size;
        if self.config.pad {
            physical = padded_size(physical, self.config.min_padded_size);
        }
        if self.config.encrypt {
            physical = physical
                .checked_add(HEADER_LEN as u64)
                .ok_or_else(|| VesselError::Resource(format!("buffer of {} bytes is too large to encrypt", size)))?;
        }
        Ok(physical)
    }

    fn decorate_buffer(&self, mut buffer: Box<dyn RandomBuffer>, logical_size: u64) -> Result<Box<dyn RandomBuffer>> {
        if self.config.encrypt {
            let secret = self.require_secret()?;
            buffer = Box::new(EncryptedBuffer::create(buffer, secret, Arc::clone(&self.key_derivation))?);
        }
        if self.config.pad {
            buffer = Box::new(PaddedBuffer::with_min_size(buffer, logical_size, self.config.min_padded_size)?);
        }
        Ok(buffer)
    }

    // =========================================================================
    // Resume
    // =========================================================================

    /// Collaborators handed to restored stacks
    pub fn restore_context(&self) -> RestoreContext {
        RestoreContext {
            secret: self.secret.clone(),
            key_derivation: Arc::clone(&self.key_derivation),
            tracker: self.tracker.clone(),
            exit_cleanup: self.exit_cleanup.clone(),
        }
    }

    /// Rebuild a container from a frame produced by [`Container::persist`]
    pub fn resume(&self, frame: &[u8]) -> Result<Box<dyn Container>> {
        persist::restore_container(frame, &self.restore_context())
    }

    pub fn resume_buffer(&self, frame: &[u8]) -> Result<Box<dyn RandomBuffer>> {
        persist::restore_buffer(frame, &self.restore_context())
    }

    /// Resume every frame independently
    ///
    /// One broken frame never prevents the others from resuming; each
    /// failure is logged and returned in place.
    pub fn resume_all<I, F>(&self, frames: I) -> Vec<Result<Box<dyn Container>>>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let ctx = self.restore_context();
        let results: Vec<_> = frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                let result = persist::restore_container(frame.as_ref(), &ctx);
                if let Err(e) = &result {
                    warn!(index, kind = ?e.kind(), error = %e, "Failed to resume container");
                }
                result
            })
            .collect();
        let resumed = results.iter().filter(|r| r.is_ok()).count();
        info!(resumed, failed = results.len() - resumed, "Resumed containers");
        results
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn fits_in_ram(&self, size: u64) -> bool {
        !self.config.force_disk && size <= self.config.max_ram_size
    }

    fn next_path(&self) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.resolver.path_for(id)
    }

    /// Exclusively create an empty file at a fresh path
    fn create_persistent_file(&self) -> Result<PathBuf> {
        let path = self.next_path();
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| VesselError::Resource(format!("cannot create {}: {}", path.display(), e)))?;
        Ok(path)
    }

    fn require_secret(&self) -> Result<&MasterSecret> {
        self.secret
            .as_deref()
            .ok_or_else(|| VesselError::Security("encryption is enabled but no master secret was supplied".into()))
    }

    fn require_tracker(&self) -> Result<Arc<dyn CommitTracker>> {
        self.tracker
            .clone()
            .ok_or_else(|| VesselError::resource("persistent containers need a commit tracker"))
    }
}

impl std::fmt::Debug for ContainerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerFactory")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("has_secret", &self.secret.is_some())
            .field("has_tracker", &self.tracker.is_some())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

/// Highest resolver id already present in `dir`
fn highest_id(resolver: &dyn PathResolver, dir: &Path) -> Result<Option<u64>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut highest = None;
    for entry in fs::read_dir(dir)? {
        if let Some(id) = resolver.id_for(&entry?.path()) {
            highest = Some(highest.map_or(id, |h: u64| h.max(id)));
        }
    }
    Ok(highest)
}

fn file_identity(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
