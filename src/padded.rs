//! Power-of-two padding wrappers
//!
//! Padding hides the exact length of stored data from anyone who can see
//! file sizes. It does not protect content, so filler comes from a fast
//! non-cryptographic generator.
//!
//! ```text
//! logical:   [ data ........ L ]
//! physical:  [ data ........ L | filler ......... ]  = max(MIN, next_pow2(L))
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::container::{
    check_range, forward_to, Container, ContainerKind, InputStream, OutputStream, RandomBuffer,
};
use crate::error::{Result, VesselError};
use crate::persist::{self, PaddedPayload};

/// Smallest physical size of a padded container (in bytes)
pub const MIN_PADDED_SIZE: u64 = 1024;

const FILLER_CHUNK: usize = 4096;

/// Physical size for `logical` bytes: `max(min, next_pow2(logical))`
pub fn padded_size(logical: u64, min: u64) -> u64 {
    logical
        .checked_next_power_of_two()
        .unwrap_or(u64::MAX)
        .max(min)
}

fn write_filler<W: Write + ?Sized>(out: &mut W, mut remaining: u64) -> io::Result<()> {
    let mut rng = SmallRng::from_entropy();
    let mut chunk = [0u8; FILLER_CHUNK];
    while remaining > 0 {
        let n = remaining.min(FILLER_CHUNK as u64) as usize;
        rng.fill_bytes(&mut chunk[..n]);
        out.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

// =============================================================================
// PaddedContainer
// =============================================================================

/// Container wrapper rounding the physical size up to a power of two
pub struct PaddedContainer {
    /// Holds data followed by filler
    inner: Box<dyn Container>,
    /// Logical size, shared with shadows and updated on stream close
    logical_size: Arc<Mutex<u64>>,
    /// Floor for the physical size of any write
    min_padded_size: u64,
}

impl PaddedContainer {
    /// Wrap a container that has not been written through a padding layer yet
    pub fn new(inner: Box<dyn Container>) -> Self {
        Self::with_min_size(inner, MIN_PADDED_SIZE)
    }

    pub fn with_min_size(inner: Box<dyn Container>, min_padded_size: u64) -> Self {
        Self::with_logical_size(inner, 0, min_padded_size)
    }

    /// Wrap padded data whose logical size is already known
    pub fn with_logical_size(inner: Box<dyn Container>, logical_size: u64, min_padded_size: u64) -> Self {
        Self {
            inner,
            logical_size: Arc::new(Mutex::new(logical_size)),
            min_padded_size,
        }
    }

    pub(crate) fn from_payload(payload: PaddedPayload, inner: Box<dyn Container>) -> Self {
        Self::with_logical_size(inner, payload.logical_size, payload.min_padded_size)
    }

    /// Size of the wrapped storage, filler included
    pub fn physical_size(&self) -> u64 {
        self.inner.size()
    }
}

impl fmt::Debug for PaddedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaddedContainer")
            .field("logical_size", &*self.logical_size.lock())
            .field("min_padded_size", &self.min_padded_size)
            .field("inner", &self.inner)
            .finish()
    }
}

impl Container for PaddedContainer {
    fn output_stream(&self) -> Result<Box<dyn OutputStream>> {
        let inner = self.inner.output_stream()?;
        Ok(Box::new(PaddedOutputStream {
            inner: Some(inner),
            logical_size: Arc::clone(&self.logical_size),
            min_padded_size: self.min_padded_size,
            written: 0,
        }))
    }

    fn input_stream(&self) -> Result<Option<Box<dyn InputStream>>> {
        let remaining = *self.logical_size.lock();
        Ok(self.inner.input_stream()?.map(|inner| {
            Box::new(PaddedInputStream { inner, remaining }) as Box<dyn InputStream>
        }))
    }

    fn size(&self) -> u64 {
        *self.logical_size.lock()
    }

    forward_to! { inner:
        fn is_read_only(&self) -> bool;
        fn set_read_only(&self) -> ();
        fn is_disposed(&self) -> bool;
        fn close(&self) -> Result<()>;
        fn dispose(&self) -> Result<()>;
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn Container>>> {
        let Some(shadow) = self.inner.create_shadow()? else {
            return Ok(None);
        };
        shadow.set_read_only();
        Ok(Some(Box::new(PaddedContainer {
            inner: shadow,
            logical_size: Arc::clone(&self.logical_size),
            min_padded_size: self.min_padded_size,
        })))
    }

    fn to_random_buffer(&self) -> Result<Box<dyn RandomBuffer>> {
        let logical_size = *self.logical_size.lock();
        let view = self.inner.to_random_buffer()?;
        Ok(Box::new(PaddedBuffer::with_min_size(view, logical_size, self.min_padded_size)?))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        let payload = PaddedPayload {
            logical_size: *self.logical_size.lock(),
            min_padded_size: self.min_padded_size,
            inner: self.inner.persist()?,
        };
        persist::encode_frame(persist::PADDED_CONTAINER_MAGIC, &payload)
    }

    fn name(&self) -> String {
        format!("padded({})", self.inner.name())
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Padded
    }
}

// =============================================================================
// Streams
// =============================================================================

struct PaddedOutputStream {
    /// `None` once closed
    inner: Option<Box<dyn OutputStream>>,
    /// Published to the container only after `inner` commits
    logical_size: Arc<Mutex<u64>>,
    min_padded_size: u64,
    /// Logical bytes accepted so far
    written: u64,
}

impl Write for PaddedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(VesselError::resource("output stream already closed").into_io());
        };
        let n = inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for PaddedOutputStream {
    fn close(&mut self) -> Result<()> {
        let Some(mut inner) = self.inner.take() else {
            return Ok(());
        };
        let physical = padded_size(self.written, self.min_padded_size);
        write_filler(inner.as_mut(), physical - self.written)?;
        inner.close()?;
        *self.logical_size.lock() = self.written;
        Ok(())
    }
}

// `logical_size` changes only in close(); dropping unclosed just aborts `inner`.
impl fmt::Debug for PaddedOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaddedOutputStream")
            .field("written", &self.written)
            .field("min_padded_size", &self.min_padded_size)
            .field("inner", &self.inner)
            .finish()
    }
}

struct PaddedInputStream {
    inner: Box<dyn InputStream>,
    /// Logical bytes not yet delivered
    remaining: u64,
}

impl Read for PaddedInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let limit = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..limit])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl fmt::Debug for PaddedInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaddedInputStream")
            .field("remaining", &self.remaining)
            .field("inner", &self.inner)
            .finish()
    }
}

impl InputStream for PaddedInputStream {
    fn available(&self) -> u64 {
        self.remaining.min(self.inner.available())
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let skipped = self.inner.skip(n.min(self.remaining))?;
        self.remaining -= skipped;
        Ok(skipped)
    }
}

// =============================================================================
// PaddedBuffer
// =============================================================================

/// Buffer wrapper exposing only the first `logical_size` bytes of a
/// power-of-two sized inner buffer
pub struct PaddedBuffer {
    inner: Box<dyn RandomBuffer>,
    /// Bytes visible through this buffer; the rest of `inner` is filler
    logical_size: u64,
    /// Carried so `into_container` pads later writes the same way
    min_padded_size: u64,
}

impl PaddedBuffer {
    /// `inner` must already be at least the padded size of `logical_size`
    pub fn new(inner: Box<dyn RandomBuffer>, logical_size: u64) -> Result<Self> {
        Self::with_min_size(inner, logical_size, MIN_PADDED_SIZE)
    }

    pub fn with_min_size(inner: Box<dyn RandomBuffer>, logical_size: u64, min_padded_size: u64) -> Result<Self> {
        if inner.size() < logical_size {
            return Err(VesselError::Resource(format!(
                "{} is {} bytes, smaller than logical size {}",
                inner.name(),
                inner.size(),
                logical_size
            )));
        }
        Ok(Self {
            inner,
            logical_size,
            min_padded_size,
        })
    }

    pub(crate) fn from_payload(payload: PaddedPayload, inner: Box<dyn RandomBuffer>) -> Result<Self> {
        Self::with_min_size(inner, payload.logical_size, payload.min_padded_size)
    }

    pub fn physical_size(&self) -> u64 {
        self.inner.size()
    }
}

impl fmt::Debug for PaddedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaddedBuffer")
            .field("logical_size", &self.logical_size)
            .field("inner", &self.inner)
            .finish()
    }
}

impl RandomBuffer for PaddedBuffer {
    fn size(&self) -> u64 {
        self.logical_size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.logical_size)?;
        self.inner.pread(offset, buf)
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.logical_size)?;
        self.inner.pwrite(offset, data)
    }

    forward_to! { inner:
        fn is_read_only(&self) -> bool;
        fn set_read_only(&self) -> ();
        fn is_disposed(&self) -> bool;
        fn close(&self) -> Result<()>;
        fn dispose(&self) -> Result<()>;
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn RandomBuffer>>> {
        let Some(shadow) = self.inner.create_shadow()? else {
            return Ok(None);
        };
        shadow.set_read_only();
        Ok(Some(Box::new(PaddedBuffer {
            inner: shadow,
            logical_size: self.logical_size,
            min_padded_size: self.min_padded_size,
        })))
    }

    fn into_container(self: Box<Self>) -> Result<Box<dyn Container>> {
        let Self {
            inner,
            logical_size,
            min_padded_size,
        } = *self;
        Ok(Box::new(PaddedContainer::with_logical_size(
            inner.into_container()?,
            logical_size,
            min_padded_size,
        )))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        let payload = PaddedPayload {
            logical_size: self.logical_size,
            min_padded_size: self.min_padded_size,
            inner: self.inner.persist()?,
        };
        persist::encode_frame(persist::PADDED_BUFFER_MAGIC, &payload)
    }

    fn name(&self) -> String {
        format!("padded({})", self.inner.name())
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Padded
    }
}
