//! In-memory containers
//!
//! `MemoryContainer` and `MemoryBuffer` share one `Arc<RwLock<Vec<u8>>>`, so
//! converting between them never copies. Neither supports shadows.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, VesselError};

use super::{check_range, Container, ContainerKind, InputStream, OutputStream, RandomBuffer};

#[derive(Debug, Default)]
struct MemoryState {
    read_only: bool,
    disposed: bool,
    /// An output stream is open and may still commit
    writer_open: bool,
    /// An output stream has committed at least once
    written: bool,
    /// Set once a buffer view took over the data (and its deletion)
    handed_off: bool,
    /// Bumped on every output stream open
    generation: u64,
}

/// In-RAM byte-array container
pub struct MemoryContainer {
    /// Committed content, shared with any buffer view
    data: Arc<RwLock<Vec<u8>>>,
    /// Shared with open output streams so they can commit or abort
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryContainer {
    /// Create an empty, never-written container
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Create a container already holding `data`
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            state: Arc::new(Mutex::new(MemoryState {
                written: true,
                ..MemoryState::default()
            })),
        }
    }
}

impl Default for MemoryContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.data.read().len();
        f.debug_struct("MemoryContainer")
            .field("size", &size)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Container for MemoryContainer {
    fn output_stream(&self) -> Result<Box<dyn OutputStream>> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(VesselError::resource("memory container already disposed"));
        }
        if state.read_only {
            return Err(VesselError::resource("memory container is read-only"));
        }
        if state.writer_open {
            return Err(VesselError::resource("memory container already has an open output stream"));
        }
        state.writer_open = true;
        state.generation += 1;

        Ok(Box::new(MemoryOutputStream {
            data: Arc::clone(&self.data),
            state: Arc::clone(&self.state),
            generation: state.generation,
            staged: Vec::new(),
            closed: false,
        }))
    }

    fn input_stream(&self) -> Result<Option<Box<dyn InputStream>>> {
        let state = self.state.lock();
        if state.disposed {
            return Err(VesselError::resource("memory container already disposed"));
        }
        if !state.written {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryInputStream {
            data: Arc::clone(&self.data),
            position: 0,
        })))
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    fn set_read_only(&self) {
        self.state.lock().read_only = true;
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn Container>>> {
        Ok(None)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.writer_open {
            // An unclosed writer from before close() must not commit later.
            state.writer_open = false;
            state.generation += 1;
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;
        state.writer_open = false;
        state.generation += 1;
        if !state.handed_off {
            let mut data = self.data.write();
            data.clear();
            data.shrink_to_fit();
        }
        Ok(())
    }

    fn to_random_buffer(&self) -> Result<Box<dyn RandomBuffer>> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(VesselError::resource("memory container already disposed"));
        }
        if state.writer_open {
            return Err(VesselError::resource("cannot convert while an output stream is open"));
        }
        state.read_only = true;
        state.handed_off = true;
        let size = self.data.read().len() as u64;
        Ok(Box::new(MemoryBuffer {
            data: Arc::clone(&self.data),
            size,
            state: Mutex::new(BufferState {
                read_only: true,
                disposed: false,
            }),
        }))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        Err(VesselError::resource("memory containers do not survive restart"))
    }

    fn name(&self) -> String {
        format!("memory@{:p}", Arc::as_ptr(&self.data))
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Memory
    }
}

// =============================================================================
// Streams
// =============================================================================

struct MemoryOutputStream {
    data: Arc<RwLock<Vec<u8>>>,
    state: Arc<Mutex<MemoryState>>,
    generation: u64,
    /// Bytes are staged here and swapped in on close
    staged: Vec<u8>,
    closed: bool,
}

impl MemoryOutputStream {
    fn check_current(&self) -> Result<()> {
        if self.closed {
            return Err(VesselError::resource("output stream already closed"));
        }
        let state = self.state.lock();
        if state.disposed {
            return Err(VesselError::resource("memory container disposed during write"));
        }
        if state.generation != self.generation {
            return Err(VesselError::resource("stale output stream: a newer writer has been opened"));
        }
        Ok(())
    }
}

impl Write for MemoryOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_current().map_err(VesselError::into_io)?;
        self.staged.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for MemoryOutputStream {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.disposed || state.generation != self.generation {
            self.closed = true;
            return Err(VesselError::resource("output stream invalidated before close"));
        }
        *self.data.write() = std::mem::take(&mut self.staged);
        state.written = true;
        state.writer_open = false;
        self.closed = true;
        Ok(())
    }
}

impl fmt::Debug for MemoryOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryOutputStream")
            .field("generation", &self.generation)
            .field("staged", &self.staged.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for MemoryOutputStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Unclosed: the staged bytes are discarded and the writer slot freed.
        let mut state = self.state.lock();
        if state.generation == self.generation {
            state.writer_open = false;
        }
        debug!(discarded = self.staged.len(), "memory output stream dropped without close()");
    }
}

struct MemoryInputStream {
    data: Arc<RwLock<Vec<u8>>>,
    position: usize,
}

impl fmt::Debug for MemoryInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryInputStream")
            .field("position", &self.position)
            .finish()
    }
}

impl Read for MemoryInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read();
        if self.position >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - self.position);
        buf[..n].copy_from_slice(&data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl InputStream for MemoryInputStream {
    fn available(&self) -> u64 {
        self.data.read().len().saturating_sub(self.position) as u64
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let skipped = n.min(self.available());
        self.position += skipped as usize;
        Ok(skipped)
    }
}

// =============================================================================
// MemoryBuffer
// =============================================================================

#[derive(Debug)]
struct BufferState {
    read_only: bool,
    disposed: bool,
}

/// Fixed-size in-RAM buffer
pub struct MemoryBuffer {
    /// Shared with the container this buffer was converted from, if any
    data: Arc<RwLock<Vec<u8>>>,
    /// Fixed at creation; `data` is cleared (not resized) on dispose
    size: u64,
    state: Mutex<BufferState>,
}

impl MemoryBuffer {
    /// Zero-filled buffer of `size` bytes
    pub fn new(size: u64) -> Self {
        Self::from_vec(vec![0u8; size as usize])
    }

    /// Writable buffer over `data`
    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            data: Arc::new(RwLock::new(data)),
            size,
            state: Mutex::new(BufferState {
                read_only: false,
                disposed: false,
            }),
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.state.lock().disposed {
            return Err(VesselError::resource("memory buffer already disposed"));
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("size", &self.size)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl RandomBuffer for MemoryBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_usable()?;
        check_range(offset, buf.len(), self.size)?;
        let data = self.data.read();
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        if self.state.lock().read_only {
            return Err(VesselError::resource("memory buffer is read-only"));
        }
        check_range(offset, data.len(), self.size)?;
        let start = offset as usize;
        self.data.write()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    fn set_read_only(&self) {
        self.state.lock().read_only = true;
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn RandomBuffer>>> {
        Ok(None)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.disposed {
            state.disposed = true;
            let mut data = self.data.write();
            data.clear();
            data.shrink_to_fit();
        }
        Ok(())
    }

    fn into_container(self: Box<Self>) -> Result<Box<dyn Container>> {
        self.check_usable()?;
        Ok(Box::new(MemoryContainer {
            data: Arc::clone(&self.data),
            state: Arc::new(Mutex::new(MemoryState {
                read_only: true,
                written: true,
                ..MemoryState::default()
            })),
        }))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        Err(VesselError::resource("memory buffers do not survive restart"))
    }

    fn name(&self) -> String {
        format!("memory-buffer@{:p}", Arc::as_ptr(&self.data))
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Memory
    }
}
