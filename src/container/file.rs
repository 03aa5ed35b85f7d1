//! Disk-backed containers
//!
//! ## Write Path
//! ```text
//!  output_stream()                         close()
//!       │                                     │
//!       ▼                                     ▼
//!  .<name>.XXXXXX.partial ──write──► fsync ──rename──► <name>
//! ```
//! [`CreateMode::MustExist`] additionally requires the target to exist when
//! the stream opens. Dropping a stream without `close()` deletes the
//! `.partial` file and leaves the target as it was. A crash before the rename leaves only a `.partial` sibling, which
//! [`cleanup_stale_temp_files`] removes on the next start.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Result, VesselError};
use crate::persist::{self, FileBufferPayload, FilePayload};

use super::{check_range, Container, ContainerKind, InputStream, OutputStream, RandomBuffer};

/// Suffix of in-flight sibling temp files
pub(crate) const PARTIAL_SUFFIX: &str = ".partial";

/// How the first write treats the target path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Write a sibling temp file and rename it over the target
    Replace,
    /// Like `Replace`, but the target must not exist (no-clobber rename)
    CreateNew,
    /// Like `Replace`, but the target must already exist
    MustExist,
}

impl CreateMode {
    pub(crate) fn to_code(self) -> u8 {
        match self {
            CreateMode::Replace => 0,
            CreateMode::CreateNew => 1,
            CreateMode::MustExist => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CreateMode::Replace),
            1 => Ok(CreateMode::CreateNew),
            2 => Ok(CreateMode::MustExist),
            other => Err(VesselError::Format(format!("unknown create mode {}", other))),
        }
    }
}

/// Construction policy for a [`FileContainer`]
#[derive(Debug, Clone)]
pub struct FileOptions {
    pub mode: CreateMode,
    /// Delete the file once the container is disposed
    pub delete_on_dispose: bool,
    /// Best-effort deletion when this registry is dropped
    pub exit_cleanup: Option<Arc<ExitCleanup>>,
    pub read_only: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            mode: CreateMode::Replace,
            delete_on_dispose: false,
            exit_cleanup: None,
            read_only: false,
        }
    }
}

impl FileOptions {
    /// Options for a throwaway temp file owned by this process
    pub fn temp(exit_cleanup: Option<Arc<ExitCleanup>>) -> Self {
        Self {
            mode: CreateMode::Replace,
            delete_on_dispose: true,
            exit_cleanup,
            read_only: false,
        }
    }
}

// =============================================================================
// Exit Cleanup
// =============================================================================

/// Paths to delete, best effort, when the registry is dropped
///
/// Correctness never depends on this: it only mops up temp files whose
/// containers were never disposed.
#[derive(Debug, Default)]
pub struct ExitCleanup {
    paths: Mutex<HashSet<PathBuf>>,
}

impl ExitCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &Path) {
        self.paths.lock().insert(path.to_path_buf());
    }

    pub fn unregister(&self, path: &Path) {
        self.paths.lock().remove(path);
    }

    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every registered path now, returning how many were removed
    pub fn run(&self) -> usize {
        let paths: Vec<PathBuf> = self.paths.lock().drain().collect();
        let mut removed = 0;
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "exit cleanup failed"),
            }
        }
        removed
    }
}

impl Drop for ExitCleanup {
    fn drop(&mut self) {
        let removed = self.run();
        if removed > 0 {
            debug!(removed, "exit cleanup removed leftover temp files");
        }
    }
}

/// Remove `.partial` files a crashed writer left in `dir`
///
/// Returns the number of files removed. Files that do not look like ours are
/// never touched.
pub fn cleanup_stale_temp_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "removed stale partial file");
            removed += 1;
        }
    }
    Ok(removed)
}

// =============================================================================
// FileContainer
// =============================================================================

/// OS handle shared between a stream and its container's registry
type Slot<T> = Arc<Mutex<Option<T>>>;

type Sink = BufWriter<NamedTempFile>;

/// Registry entry for an open stream
enum StreamHandle {
    Reader(Slot<BufReader<File>>),
    Writer(Slot<Sink>),
}

impl StreamHandle {
    /// Close the OS handle now; a writer's `.partial` file is deleted with it
    fn release(&self) {
        match self {
            StreamHandle::Reader(slot) => drop(slot.lock().take()),
            StreamHandle::Writer(slot) => drop(slot.lock().take()),
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamHandle::Reader(_) => "Reader",
            StreamHandle::Writer(_) => "Writer",
        })
    }
}

#[derive(Debug)]
struct FileState {
    read_only: bool,
    disposed: bool,
    /// Delete the file on dispose; cleared once a buffer view takes over
    delete_on_dispose: bool,
    /// Bumped every time an output stream is opened
    generation: u64,
    /// Id of the open output stream, if any
    writer: Option<u64>,
    /// Every open reader and writer, by id
    open_streams: HashMap<u64, StreamHandle>,
    next_stream_id: u64,
}

impl FileState {
    fn register(&mut self, handle: StreamHandle) -> u64 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        if matches!(handle, StreamHandle::Writer(_)) {
            self.writer = Some(id);
        }
        self.open_streams.insert(id, handle);
        id
    }

    fn unregister(&mut self, id: u64) {
        self.open_streams.remove(&id);
        if self.writer == Some(id) {
            self.writer = None;
        }
    }

    /// Close every open stream's OS handle; the streams fail on their next I/O
    fn release_all(&mut self) -> usize {
        let count = self.open_streams.len();
        for (_, handle) in self.open_streams.drain() {
            handle.release();
        }
        self.writer = None;
        count
    }
}

/// Everything a container shares with the streams it opened
struct FileShared {
    path: PathBuf,
    mode: CreateMode,
    /// Shadows never write or delete
    is_shadow: bool,
    /// Where `path` is registered when the container owns the file
    exit_cleanup: Option<Arc<ExitCleanup>>,
    /// Lock order: `state` before any stream slot
    state: Mutex<FileState>,
}

/// Disk-backed container
///
/// ## Concurrency:
/// - All bookkeeping lives in one per-instance `Mutex<FileState>`
/// - One writer at a time; a second `output_stream()` fails immediately
/// - Readers are independent file handles with their own positions
pub struct FileContainer {
    shared: Arc<FileShared>,
}

impl FileContainer {
    /// Create a container for `path`; the file is created on first write
    /// unless `options.mode` is `MustExist`
    pub fn new(path: impl Into<PathBuf>, options: FileOptions) -> Self {
        let path = path.into();
        if options.delete_on_dispose {
            if let Some(cleanup) = &options.exit_cleanup {
                cleanup.register(&path);
            }
        }
        Self {
            shared: Arc::new(FileShared {
                path,
                mode: options.mode,
                is_shadow: false,
                exit_cleanup: options.exit_cleanup,
                state: Mutex::new(FileState {
                    read_only: options.read_only,
                    disposed: false,
                    delete_on_dispose: options.delete_on_dispose,
                    generation: 0,
                    writer: None,
                    open_streams: HashMap::new(),
                    next_stream_id: 1,
                }),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_shadow(&self) -> bool {
        self.shared.is_shadow
    }

    /// Current writer generation
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Number of readers and writers currently registered
    pub fn open_stream_count(&self) -> usize {
        self.shared.state.lock().open_streams.len()
    }

    /// Rebuild from a persisted payload
    pub(crate) fn from_payload(payload: FilePayload, exit_cleanup: Option<Arc<ExitCleanup>>) -> Result<Self> {
        let mode = CreateMode::from_code(payload.mode)?;
        if mode == CreateMode::MustExist && !payload.path.exists() {
            return Err(VesselError::Resume(format!(
                "file {} vanished while the process was down",
                payload.path.display()
            )));
        }
        let container = Self::new(
            payload.path,
            FileOptions {
                mode,
                delete_on_dispose: payload.delete_on_dispose && !payload.shadow,
                exit_cleanup: exit_cleanup.filter(|_| payload.delete_on_exit),
                read_only: payload.read_only || payload.shadow,
            },
        );
        if payload.shadow {
            return Ok(container.into_shadow());
        }
        Ok(container)
    }

    fn into_shadow(self) -> Self {
        let path = self.shared.path.clone();
        let mode = self.shared.mode;
        Self::shadow_of(path, mode)
    }

    fn shadow_of(path: PathBuf, mode: CreateMode) -> Self {
        Self {
            shared: Arc::new(FileShared {
                path,
                mode,
                is_shadow: true,
                exit_cleanup: None,
                state: Mutex::new(FileState {
                    read_only: true,
                    disposed: false,
                    delete_on_dispose: false,
                    generation: 0,
                    writer: None,
                    open_streams: HashMap::new(),
                    next_stream_id: 1,
                }),
            }),
        }
    }

    fn open_sink(&self) -> Result<Sink> {
        let path = &self.shared.path;
        match self.shared.mode {
            CreateMode::MustExist if !path.exists() => {
                return Err(VesselError::Resource(format!("cannot write {}: file does not exist", path.display())));
            }
            CreateMode::CreateNew if path.exists() => {
                return Err(VesselError::Resource(format!("{} already exists", path.display())));
            }
            _ => {}
        }
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vessel".to_string());
        let staged = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(dir)
            .map_err(|e| VesselError::Resource(format!("cannot create temp file in {}: {}", dir.display(), e)))?;
        Ok(BufWriter::new(staged))
    }
}

impl fmt::Debug for FileContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContainer")
            .field("path", &self.shared.path)
            .field("mode", &self.shared.mode)
            .field("is_shadow", &self.shared.is_shadow)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl Container for FileContainer {
    fn output_stream(&self) -> Result<Box<dyn OutputStream>> {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(VesselError::Resource(format!("{} already disposed", self.shared.path.display())));
        }
        if state.read_only || self.shared.is_shadow {
            return Err(VesselError::Resource(format!("{} is read-only", self.shared.path.display())));
        }
        if state.writer.is_some() {
            return Err(VesselError::Resource(format!(
                "{} already has an open output stream",
                self.shared.path.display()
            )));
        }

        let sink: Slot<Sink> = Arc::new(Mutex::new(Some(self.open_sink()?)));
        state.generation += 1;
        let generation = state.generation;
        let id = state.register(StreamHandle::Writer(Arc::clone(&sink)));
        debug!(path = %self.shared.path.display(), generation, "opened output stream");

        Ok(Box::new(FileOutputStream {
            shared: Arc::clone(&self.shared),
            id,
            generation,
            sink,
            closed: false,
        }))
    }

    fn input_stream(&self) -> Result<Option<Box<dyn InputStream>>> {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(VesselError::Resource(format!("{} already disposed", self.shared.path.display())));
        }
        let file = match File::open(&self.shared.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let remaining = file.metadata()?.len();
        let reader: Slot<BufReader<File>> = Arc::new(Mutex::new(Some(BufReader::new(file))));
        let id = state.register(StreamHandle::Reader(Arc::clone(&reader)));

        Ok(Some(Box::new(FileInputStream {
            shared: Arc::clone(&self.shared),
            id,
            reader,
            remaining,
        })))
    }

    fn size(&self) -> u64 {
        fs::metadata(&self.shared.path).map(|m| m.len()).unwrap_or(0)
    }

    fn is_read_only(&self) -> bool {
        self.shared.is_shadow || self.shared.state.lock().read_only
    }

    fn set_read_only(&self) {
        self.shared.state.lock().read_only = true;
    }

    fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn Container>>> {
        if self.shared.state.lock().disposed {
            return Err(VesselError::Resource(format!("{} already disposed", self.shared.path.display())));
        }
        Ok(Some(Box::new(Self::shadow_of(self.shared.path.clone(), self.shared.mode))))
    }

    fn close(&self) -> Result<()> {
        let released = self.shared.state.lock().release_all();
        if released > 0 {
            debug!(path = %self.shared.path.display(), released, "released open streams");
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;

        let leaked = state.release_all();
        if leaked > 0 {
            warn!(
                path = %self.shared.path.display(),
                leaked,
                "disposing file container with open streams; force-closing them"
            );
        }

        if self.shared.is_shadow || !state.delete_on_dispose {
            return Ok(());
        }
        if let Some(cleanup) = &self.shared.exit_cleanup {
            cleanup.unregister(&self.shared.path);
        }
        match fs::remove_file(&self.shared.path) {
            Ok(()) => {
                debug!(path = %self.shared.path.display(), "deleted file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn to_random_buffer(&self) -> Result<Box<dyn RandomBuffer>> {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(VesselError::Resource(format!("{} already disposed", self.shared.path.display())));
        }
        if state.writer.is_some() {
            return Err(VesselError::resource("cannot convert while an output stream is open"));
        }
        let file = File::open(&self.shared.path).map_err(|e| {
            VesselError::Resource(format!("cannot view {}: {}", self.shared.path.display(), e))
        })?;
        let size = file.metadata()?.len();

        state.read_only = true;
        let delete_on_dispose = state.delete_on_dispose && !self.shared.is_shadow;
        // The view owns deletion from here on.
        state.delete_on_dispose = false;

        Ok(Box::new(FileBuffer {
            path: self.shared.path.clone(),
            size,
            is_shadow: self.shared.is_shadow,
            exit_cleanup: self.shared.exit_cleanup.clone(),
            file: Mutex::new(Some(file)),
            state: Mutex::new(FileBufferState {
                read_only: true,
                disposed: false,
                delete_on_dispose,
            }),
        }))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        let state = self.shared.state.lock();
        let payload = FilePayload {
            path: self.shared.path.clone(),
            mode: self.shared.mode.to_code(),
            delete_on_dispose: state.delete_on_dispose,
            delete_on_exit: self.shared.exit_cleanup.is_some(),
            read_only: state.read_only,
            shadow: self.shared.is_shadow,
        };
        persist::encode_frame(persist::FILE_CONTAINER_MAGIC, &payload)
    }

    fn name(&self) -> String {
        self.shared.path.display().to_string()
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::File
    }
}

// =============================================================================
// Streams
// =============================================================================

struct FileOutputStream {
    shared: Arc<FileShared>,
    id: u64,
    generation: u64,
    /// Emptied by close() or by the container force-closing this stream
    sink: Slot<Sink>,
    closed: bool,
}

impl FileOutputStream {
    /// Fails if this stream was released or a newer writer took over
    fn check_current(&self, state: &FileState) -> Result<()> {
        if state.disposed {
            return Err(VesselError::Resource(format!("{} disposed during write", self.shared.path.display())));
        }
        if state.generation != self.generation {
            return Err(VesselError::Resource(format!(
                "stale output stream for {}: generation {} superseded by {}",
                self.shared.path.display(),
                self.generation,
                state.generation
            )));
        }
        if !state.open_streams.contains_key(&self.id) {
            return Err(self.force_closed());
        }
        Ok(())
    }

    fn force_closed(&self) -> VesselError {
        VesselError::Resource(format!("output stream for {} was force-closed", self.shared.path.display()))
    }

    fn commit(&self, sink: Sink) -> Result<()> {
        let path = &self.shared.path;
        let staged = sink.into_inner().map_err(|e| VesselError::Io(e.into_error()))?;
        staged.as_file().sync_all()?;
        let persisted = if self.shared.mode == CreateMode::CreateNew {
            staged.persist_noclobber(path)
        } else {
            staged.persist(path)
        };
        // On failure the temp file is dropped (and deleted) with the error.
        persisted.map_err(|e| VesselError::Resource(format!("rename onto {} failed: {}", path.display(), e.error)))?;
        Ok(())
    }
}

impl fmt::Debug for FileOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileOutputStream")
            .field("path", &self.shared.path)
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Write for FileOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(VesselError::resource("output stream already closed").into_io());
        }
        self.check_current(&self.shared.state.lock()).map_err(VesselError::into_io)?;
        match self.sink.lock().as_mut() {
            Some(sink) => sink.write(buf),
            None => Err(self.force_closed().into_io()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.lock().as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for FileOutputStream {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Held across the rename so dispose() cannot interleave with it.
        let mut state = self.shared.state.lock();
        let sink = self.sink.lock().take();
        let result = match sink {
            Some(sink) => self.check_current(&state).and_then(|()| self.commit(sink)),
            None => Err(self.force_closed()),
        };
        state.unregister(self.id);
        if result.is_ok() {
            debug!(path = %self.shared.path.display(), generation = self.generation, "committed output stream");
        }
        result
    }
}

impl Drop for FileOutputStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut state = self.shared.state.lock();
        let discarded = self.sink.lock().take();
        state.unregister(self.id);
        if discarded.is_some() {
            debug!(
                path = %self.shared.path.display(),
                generation = self.generation,
                "output stream dropped without close(); discarded staged data"
            );
        }
    }
}

struct FileInputStream {
    shared: Arc<FileShared>,
    id: u64,
    /// Emptied when the container force-closes this stream
    reader: Slot<BufReader<File>>,
    remaining: u64,
}

impl fmt::Debug for FileInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileInputStream")
            .field("path", &self.shared.path)
            .field("id", &self.id)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Read for FileInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut slot = self.reader.lock();
        let Some(reader) = slot.as_mut() else {
            return Err(VesselError::Resource(format!(
                "input stream for {} was force-closed",
                self.shared.path.display()
            ))
            .into_io());
        };
        let n = reader.read(buf)?;
        self.remaining = self.remaining.saturating_sub(n as u64);
        Ok(n)
    }
}

impl InputStream for FileInputStream {
    fn available(&self) -> u64 {
        self.remaining
    }
}

impl Drop for FileInputStream {
    fn drop(&mut self) {
        self.shared.state.lock().unregister(self.id);
    }
}

// =============================================================================
// FileBuffer
// =============================================================================

#[derive(Debug)]
struct FileBufferState {
    read_only: bool,
    disposed: bool,
    delete_on_dispose: bool,
}

/// Fixed-size disk-backed buffer with positional I/O
pub struct FileBuffer {
    path: PathBuf,
    /// Fixed at creation
    size: u64,
    /// Shadows never write or delete
    is_shadow: bool,
    /// Where `path` is registered when the buffer owns the file
    exit_cleanup: Option<Arc<ExitCleanup>>,
    /// `None` after close(); reopened lazily
    file: Mutex<Option<File>>,
    state: Mutex<FileBufferState>,
}

impl FileBuffer {
    /// Exclusively create `path` and size it to `size` bytes
    pub fn create(path: impl Into<PathBuf>, size: u64, delete_on_dispose: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| VesselError::Resource(format!("cannot create {}: {}", path.display(), e)))?;
        file.set_len(size)?;
        Ok(Self {
            path,
            size,
            is_shadow: false,
            exit_cleanup: None,
            file: Mutex::new(Some(file)),
            state: Mutex::new(FileBufferState {
                read_only: false,
                disposed: false,
                delete_on_dispose,
            }),
        })
    }

    /// Open an existing file; its current length becomes the fixed size
    pub fn open(path: impl Into<PathBuf>, read_only: bool, delete_on_dispose: bool) -> Result<Self> {
        let path = path.into();
        let file = Self::open_handle(&path, read_only)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            size,
            is_shadow: false,
            exit_cleanup: None,
            file: Mutex::new(Some(file)),
            state: Mutex::new(FileBufferState {
                read_only,
                disposed: false,
                delete_on_dispose,
            }),
        })
    }

    /// Register for best-effort deletion when `cleanup` drops
    pub fn with_exit_cleanup(mut self, cleanup: Arc<ExitCleanup>) -> Self {
        if self.state.lock().delete_on_dispose {
            cleanup.register(&self.path);
        }
        self.exit_cleanup = Some(cleanup);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn from_payload(payload: FileBufferPayload, exit_cleanup: Option<Arc<ExitCleanup>>) -> Result<Self> {
        if !payload.path.exists() {
            return Err(VesselError::Resume(format!(
                "buffer file {} vanished while the process was down",
                payload.path.display()
            )));
        }
        let read_only = payload.read_only || payload.shadow;
        let mut buffer = Self::open(&payload.path, read_only, payload.delete_on_dispose && !payload.shadow)?;
        if buffer.size != payload.size {
            return Err(VesselError::Resume(format!(
                "buffer file {} is {} bytes, expected {}",
                payload.path.display(),
                buffer.size,
                payload.size
            )));
        }
        buffer.is_shadow = payload.shadow;
        if let Some(cleanup) = exit_cleanup.filter(|_| payload.delete_on_exit) {
            buffer = buffer.with_exit_cleanup(cleanup);
        }
        Ok(buffer)
    }

    fn open_handle(path: &Path, read_only: bool) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| VesselError::Resource(format!("cannot open {}: {}", path.display(), e)))
    }

    /// Run `op` on the (lazily reopened) file handle
    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> Result<T> {
        let read_only = {
            let state = self.state.lock();
            if state.disposed {
                return Err(VesselError::Resource(format!("{} already disposed", self.path.display())));
            }
            state.read_only || self.is_shadow
        };
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(Self::open_handle(&self.path, read_only)?);
        }
        match guard.as_mut() {
            Some(file) => Ok(op(file)?),
            None => Err(VesselError::resource("file handle unavailable")),
        }
    }
}

impl fmt::Debug for FileBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBuffer")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("is_shadow", &self.is_shadow)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl RandomBuffer for FileBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.size)?;
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)
        })
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.is_read_only() {
            return Err(VesselError::Resource(format!("{} is read-only", self.path.display())));
        }
        check_range(offset, data.len(), self.size)?;
        self.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)
        })
    }

    fn is_read_only(&self) -> bool {
        self.is_shadow || self.state.lock().read_only
    }

    fn set_read_only(&self) {
        self.state.lock().read_only = true;
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn RandomBuffer>>> {
        if self.is_disposed() {
            return Err(VesselError::Resource(format!("{} already disposed", self.path.display())));
        }
        Ok(Some(Box::new(FileBuffer {
            path: self.path.clone(),
            size: self.size,
            is_shadow: true,
            exit_cleanup: None,
            file: Mutex::new(None),
            state: Mutex::new(FileBufferState {
                read_only: true,
                disposed: false,
                delete_on_dispose: false,
            }),
        })))
    }

    fn close(&self) -> Result<()> {
        let read_only = self.is_read_only();
        let file = self.file.lock().take();
        if let (Some(file), false) = (file, read_only) {
            file.sync_all()?;
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;
        self.file.lock().take();

        if self.is_shadow || !state.delete_on_dispose {
            return Ok(());
        }
        if let Some(cleanup) = &self.exit_cleanup {
            cleanup.unregister(&self.path);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn into_container(self: Box<Self>) -> Result<Box<dyn Container>> {
        if self.is_disposed() {
            return Err(VesselError::Resource(format!("{} already disposed", self.path.display())));
        }
        self.close()?;
        let delete_on_dispose = self.state.lock().delete_on_dispose;
        let container = FileContainer::new(
            self.path.clone(),
            FileOptions {
                mode: CreateMode::MustExist,
                delete_on_dispose: delete_on_dispose && !self.is_shadow,
                exit_cleanup: self.exit_cleanup.clone(),
                read_only: true,
            },
        );
        if self.is_shadow {
            return Ok(Box::new(container.into_shadow()));
        }
        Ok(Box::new(container))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let payload = FileBufferPayload {
            path: self.path.clone(),
            size: self.size,
            read_only: state.read_only,
            delete_on_dispose: state.delete_on_dispose,
            delete_on_exit: self.exit_cleanup.is_some(),
            shadow: self.is_shadow,
        };
        persist::encode_frame(persist::FILE_BUFFER_MAGIC, &payload)
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::File
    }
}
