//! Temp path resolution
//!
//! The directory is resolved once, when the resolver is built:
//! 1. An explicit directory from [`Config::temp_dir`](crate::Config)
//! 2. `$VESSEL_TMPDIR`
//! 3. The first usable OS candidate (`std::env::temp_dir()`, `/var/tmp`, `/tmp`)
//! 4. The current working directory

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, VesselError};

/// Environment variable overriding the temp directory
pub const TEMP_DIR_ENV: &str = "VESSEL_TMPDIR";

const FILE_PREFIX: &str = "vessel-";
const FILE_SUFFIX: &str = ".tmp";

/// Maps container ids to backing file paths
pub trait PathResolver: Send + Sync + fmt::Debug {
    /// Directory every path lives in
    fn temp_dir(&self) -> &Path;

    fn path_for(&self, id: u64) -> PathBuf;

    /// Inverse of [`path_for`](Self::path_for); `None` for foreign files
    fn id_for(&self, path: &Path) -> Option<u64>;
}

/// Default resolver: `vessel-<id as 16 hex digits>.tmp` in one directory
#[derive(Debug, Clone)]
pub struct TempDirResolver {
    dir: PathBuf,
}

impl TempDirResolver {
    /// Use `dir` as is, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            VesselError::Resource(format!("cannot create temp directory {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    /// Resolve the directory from `explicit`, the environment, and OS defaults
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let from_env = env::var_os(TEMP_DIR_ENV).map(PathBuf::from);
        let cwd = env::current_dir()?;
        let dir = resolve_dir(explicit, from_env.as_deref(), &os_candidates(), &cwd);
        debug!(dir = %dir.display(), "Resolved temp directory");
        Self::new(dir)
    }
}

impl PathResolver for TempDirResolver {
    fn temp_dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{:016x}{}", FILE_PREFIX, id, FILE_SUFFIX))
    }

    fn id_for(&self, path: &Path) -> Option<u64> {
        if path.parent()? != self.dir {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        let hex = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()
    }
}

fn os_candidates() -> Vec<PathBuf> {
    vec![env::temp_dir(), PathBuf::from("/var/tmp"), PathBuf::from("/tmp")]
}

/// Pure resolution order; candidates must already be writable directories
pub fn resolve_dir(explicit: Option<&Path>, from_env: Option<&Path>, candidates: &[PathBuf], cwd: &Path) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = from_env.filter(|d| !d.as_os_str().is_empty()) {
        return dir.to_path_buf();
    }
    candidates
        .iter()
        .find(|dir| is_writable_dir(dir))
        .cloned()
        .unwrap_or_else(|| cwd.to_path_buf())
}

fn is_writable_dir(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}
