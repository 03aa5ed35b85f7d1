//! Container Module
//!
//! The two storage interfaces every layer of Vessel speaks.
//!
//! ## Responsibilities
//! - [`Container`]: sequential access (one writer, many readers)
//! - [`RandomBuffer`]: fixed-size, offset-addressed access
//! - Lossless zero-copy conversion between the two
//! - Shadows: read-only aliases without deletion rights
//!
//! ## Decorator Stack
//! ```text
//! ┌──────────────────────────────┐
//! │ DelayedDisposal (outermost)  │  defers physical deletion
//! ├──────────────────────────────┤
//! │ Padded                       │  hides the exact length
//! ├──────────────────────────────┤
//! │ Encrypted                    │  header + ChaCha20 body
//! ├──────────────────────────────┤
//! │ Memory | File                │  physical bytes
//! └──────────────────────────────┘
//! ```
//!
//! Each wrapper owns exactly one inner `Box<dyn Container>` (or buffer).

mod file;
mod memory;

use std::fmt;
use std::io::{self, Read, Write};

use crate::error::{Result, VesselError};

pub use file::{cleanup_stale_temp_files, CreateMode, ExitCleanup, FileBuffer, FileContainer, FileOptions};
pub use memory::{MemoryBuffer, MemoryContainer};

/// Concrete kind of the outermost layer of a container or buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Memory,
    File,
    Encrypted,
    Padded,
    DelayedDisposal,
}

/// Writer returned by [`Container::output_stream`]
///
/// Data is only committed by [`OutputStream::close`]. Dropping an unclosed
/// stream discards everything written through it and leaves the previous
/// content in place.
pub trait OutputStream: Write + Send + fmt::Debug {
    /// Flush and commit; idempotent
    fn close(&mut self) -> Result<()>;
}

/// Reader returned by [`Container::input_stream`]
pub trait InputStream: Read + Send + fmt::Debug {
    /// Bytes left before end of logical content
    fn available(&self) -> u64;

    /// Skip up to `n` bytes, returning how many were skipped
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        io::copy(&mut Read::take(self, n), &mut io::sink())
    }
}

/// Logical byte blob with sequential access
pub trait Container: Send + Sync + fmt::Debug {
    /// Open the single writer; content is replaced from byte 0
    fn output_stream(&self) -> Result<Box<dyn OutputStream>>;

    /// Open a reader, `None` if nothing was ever written
    fn input_stream(&self) -> Result<Option<Box<dyn InputStream>>>;

    /// Logical size (never includes headers or padding)
    fn size(&self) -> u64;

    fn is_read_only(&self) -> bool;

    /// Irreversible
    fn set_read_only(&self);

    fn is_disposed(&self) -> bool;

    /// Read-only alias over the same storage; `None` if unsupported
    fn create_shadow(&self) -> Result<Option<Box<dyn Container>>>;

    /// Release open stream handles, keeping the data
    fn close(&self) -> Result<()>;

    /// Release handles and delete physical storage unless deferred; idempotent
    fn dispose(&self) -> Result<()>;

    /// Zero-copy read-only view; the container becomes read-only and gives
    /// its deletion rights to the view
    fn to_random_buffer(&self) -> Result<Box<dyn RandomBuffer>>;

    /// Serialized frame for restart (see [`crate::persist`])
    fn persist(&self) -> Result<Vec<u8>>;

    fn name(&self) -> String;

    fn kind(&self) -> ContainerKind;
}

/// Fixed-size blob with offset-addressed access
pub trait RandomBuffer: Send + Sync + fmt::Debug {
    /// Fixed at creation
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`; the whole range must be in bounds
    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`; the whole range must be in bounds
    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()>;

    fn is_read_only(&self) -> bool;

    fn set_read_only(&self);

    fn is_disposed(&self) -> bool;

    fn create_shadow(&self) -> Result<Option<Box<dyn RandomBuffer>>>;

    fn close(&self) -> Result<()>;

    fn dispose(&self) -> Result<()>;

    /// Lossless conversion back to a (read-only) container over the same storage
    fn into_container(self: Box<Self>) -> Result<Box<dyn Container>>;

    fn persist(&self) -> Result<Vec<u8>>;

    fn name(&self) -> String;

    fn kind(&self) -> ContainerKind;
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Forward `&self` methods to a field holding the wrapped container/buffer
macro_rules! forward_to {
    ($field:ident: $( fn $name:ident(&self $(, $arg:ident: $ty:ty)*) -> $ret:ty; )*) => {
        $(
            fn $name(&self $(, $arg: $ty)*) -> $ret {
                self.$field.$name($($arg),*)
            }
        )*
    };
}
pub(crate) use forward_to;

/// Validate that `[offset, offset + len)` lies inside a buffer of `size` bytes
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| VesselError::resource("offset overflow"))?;
    if end > size {
        return Err(VesselError::Resource(format!(
            "access [{}, {}) beyond buffer of {} bytes",
            offset, end, size
        )));
    }
    Ok(())
}

/// Read a container's whole logical content
pub fn read_all(container: &dyn Container) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(container.size() as usize);
    if let Some(mut input) = container.input_stream()? {
        input.read_to_end(&mut out)?;
    }
    Ok(out)
}

/// Replace a container's content with `data`
pub fn write_all(container: &dyn Container, data: &[u8]) -> Result<()> {
    let mut output = container.output_stream()?;
    output.write_all(data)?;
    output.close()
}
