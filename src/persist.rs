//! Persistence framing
//!
//! Every persistable container or buffer serializes to a self-describing
//! frame. Wrappers embed their inner frame, so a whole decorator stack
//! round-trips through one byte string.
//!
//! ## Frame Format
//! ```text
//! ┌───────────┬─────────────┬──────────────┬───────────┬─────────────────┐
//! │ Magic (4) │ Version (4) │ PayloadLen(4)│ CRC32 (4) │ Payload (bincode)│
//! └───────────┴─────────────┴──────────────┴───────────┴─────────────────┘
//! ```
//! The magic names the concrete kind; restoring dispatches on it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::container::{Container, ExitCleanup, FileBuffer, FileContainer, RandomBuffer};
use crate::crypto::{HkdfSha256, KeyDerivation, MasterSecret};
use crate::disposal::{CommitTracker, DelayedDisposalBuffer, DelayedDisposalContainer};
use crate::encrypted::{EncryptedBuffer, EncryptedContainer};
use crate::error::{Result, VesselError};
use crate::padded::{PaddedBuffer, PaddedContainer};

// =============================================================================
// Constants
// =============================================================================

pub const FILE_CONTAINER_MAGIC: u32 = u32::from_be_bytes(*b"VFIL");
pub const FILE_BUFFER_MAGIC: u32 = u32::from_be_bytes(*b"VFBF");
pub const ENCRYPTED_CONTAINER_MAGIC: u32 = u32::from_be_bytes(*b"VENC");
pub const ENCRYPTED_BUFFER_MAGIC: u32 = u32::from_be_bytes(*b"VENB");
pub const PADDED_CONTAINER_MAGIC: u32 = u32::from_be_bytes(*b"VPAD");
pub const PADDED_BUFFER_MAGIC: u32 = u32::from_be_bytes(*b"VPDB");
pub const DELAYED_CONTAINER_MAGIC: u32 = u32::from_be_bytes(*b"VDLY");
pub const DELAYED_BUFFER_MAGIC: u32 = u32::from_be_bytes(*b"VDLB");

/// Current payload version for every kind
pub const FRAME_VERSION: u32 = 1;

/// Magic (4) + Version (4) + PayloadLen (4) + CRC32 (4)
pub const FRAME_HEADER_SIZE: usize = 16;

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FilePayload {
    pub path: PathBuf,
    pub mode: u8,
    pub delete_on_dispose: bool,
    /// Registered for exit cleanup when persisted
    pub delete_on_exit: bool,
    pub read_only: bool,
    pub shadow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FileBufferPayload {
    pub path: PathBuf,
    pub size: u64,
    pub read_only: bool,
    pub delete_on_dispose: bool,
    pub delete_on_exit: bool,
    pub shadow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EncryptedPayload {
    pub encryption: u8,
    pub inner: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PaddedPayload {
    pub logical_size: u64,
    pub min_padded_size: u64,
    pub inner: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DelayedPayload {
    pub identity: String,
    pub commit_id_at_creation: u64,
    pub pending: bool,
    pub shadow: bool,
    pub inner: Vec<u8>,
}

// =============================================================================
// Encoding
// =============================================================================

/// Frame `payload` under `magic`
pub(crate) fn encode_frame<T: Serialize>(magic: u32, payload: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(payload)?;
    let len = u32::try_from(body.len())
        .map_err(|_| VesselError::Serialization(format!("payload of {} bytes is too large", body.len())))?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u32(magic);
    buf.put_u32(FRAME_VERSION);
    buf.put_u32(len);
    buf.put_u32(crc32fast::hash(&body));
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

/// Split a frame into its magic and verified payload bytes
pub fn decode_frame(frame: &[u8]) -> Result<(u32, &[u8])> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(VesselError::Format(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let mut header = &frame[..FRAME_HEADER_SIZE];
    let magic = header.get_u32();
    let version = header.get_u32();
    let len = header.get_u32() as usize;
    let crc = header.get_u32();

    if kind_name(magic).is_none() {
        return Err(VesselError::Format(format!("unknown frame magic {:#010x}", magic)));
    }
    if version != FRAME_VERSION {
        return Err(VesselError::Format(format!(
            "unsupported {} frame version {}",
            kind_name(magic).unwrap_or("?"),
            version
        )));
    }
    let body = &frame[FRAME_HEADER_SIZE..];
    if body.len() != len {
        return Err(VesselError::Format(format!(
            "frame payload is {} bytes, header says {}",
            body.len(),
            len
        )));
    }
    if crc32fast::hash(body) != crc {
        return Err(VesselError::format("frame checksum mismatch"));
    }
    Ok((magic, body))
}

fn decode_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

/// Human-readable name of a frame kind, `None` if unknown
pub fn kind_name(magic: u32) -> Option<&'static str> {
    match magic {
        FILE_CONTAINER_MAGIC => Some("file-container"),
        FILE_BUFFER_MAGIC => Some("file-buffer"),
        ENCRYPTED_CONTAINER_MAGIC => Some("encrypted-container"),
        ENCRYPTED_BUFFER_MAGIC => Some("encrypted-buffer"),
        PADDED_CONTAINER_MAGIC => Some("padded-container"),
        PADDED_BUFFER_MAGIC => Some("padded-buffer"),
        DELAYED_CONTAINER_MAGIC => Some("delayed-disposal-container"),
        DELAYED_BUFFER_MAGIC => Some("delayed-disposal-buffer"),
        _ => None,
    }
}

/// Describe each layer of a frame, outermost first
pub fn describe(frame: &[u8]) -> Result<Vec<String>> {
    let mut layers = Vec::new();
    let mut current = frame.to_vec();
    loop {
        let (magic, body) = decode_frame(&current)?;
        let name = kind_name(magic).unwrap_or("unknown");
        let next = match magic {
            FILE_CONTAINER_MAGIC => {
                let p: FilePayload = decode_payload(body)?;
                layers.push(format!("{} path={} shadow={}", name, p.path.display(), p.shadow));
                None
            }
            FILE_BUFFER_MAGIC => {
                let p: FileBufferPayload = decode_payload(body)?;
                layers.push(format!("{} path={} size={}", name, p.path.display(), p.size));
                None
            }
            ENCRYPTED_CONTAINER_MAGIC | ENCRYPTED_BUFFER_MAGIC => {
                let p: EncryptedPayload = decode_payload(body)?;
                layers.push(format!("{} type={}", name, p.encryption));
                Some(p.inner)
            }
            PADDED_CONTAINER_MAGIC | PADDED_BUFFER_MAGIC => {
                let p: PaddedPayload = decode_payload(body)?;
                layers.push(format!("{} logical_size={}", name, p.logical_size));
                Some(p.inner)
            }
            _ => {
                let p: DelayedPayload = decode_payload(body)?;
                layers.push(format!(
                    "{} identity={} commit={} pending={}",
                    name, p.identity, p.commit_id_at_creation, p.pending
                ));
                Some(p.inner)
            }
        };
        match next {
            Some(inner) => current = inner,
            None => break,
        }
    }
    Ok(layers)
}

// =============================================================================
// Restoring
// =============================================================================

/// Collaborators a restored stack re-attaches to
#[derive(Clone)]
pub struct RestoreContext {
    pub secret: Option<Arc<MasterSecret>>,
    pub key_derivation: Arc<dyn KeyDerivation>,
    pub tracker: Option<Arc<dyn CommitTracker>>,
    pub exit_cleanup: Option<Arc<ExitCleanup>>,
}

impl Default for RestoreContext {
    fn default() -> Self {
        Self {
            secret: None,
            key_derivation: Arc::new(HkdfSha256),
            tracker: None,
            exit_cleanup: None,
        }
    }
}

impl fmt::Debug for RestoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreContext")
            .field("has_secret", &self.secret.is_some())
            .field("key_derivation", &self.key_derivation)
            .field("has_tracker", &self.tracker.is_some())
            .finish()
    }
}

impl RestoreContext {
    pub(crate) fn require_secret(&self, what: &str) -> Result<&MasterSecret> {
        self.secret
            .as_deref()
            .ok_or_else(|| VesselError::Resume(format!("no master secret available to resume {}", what)))
    }

    pub(crate) fn require_tracker(&self, what: &str) -> Result<Arc<dyn CommitTracker>> {
        self.tracker
            .clone()
            .ok_or_else(|| VesselError::Resume(format!("no commit tracker available to resume {}", what)))
    }
}

/// Rebuild a container stack from its frame
pub fn restore_container(frame: &[u8], ctx: &RestoreContext) -> Result<Box<dyn Container>> {
    let (magic, body) = decode_frame(frame)?;
    match magic {
        FILE_CONTAINER_MAGIC => Ok(Box::new(FileContainer::from_payload(
            decode_payload(body)?,
            ctx.exit_cleanup.clone(),
        )?)),
        ENCRYPTED_CONTAINER_MAGIC => {
            let payload: EncryptedPayload = decode_payload(body)?;
            let inner = restore_container(&payload.inner, ctx)?;
            Ok(Box::new(EncryptedContainer::from_payload(payload, inner, ctx)?))
        }
        PADDED_CONTAINER_MAGIC => {
            let payload: PaddedPayload = decode_payload(body)?;
            let inner = restore_container(&payload.inner, ctx)?;
            Ok(Box::new(PaddedContainer::from_payload(payload, inner)))
        }
        DELAYED_CONTAINER_MAGIC => {
            let payload: DelayedPayload = decode_payload(body)?;
            let inner = restore_container(&payload.inner, ctx)?;
            Ok(Box::new(DelayedDisposalContainer::from_payload(payload, inner, ctx)?))
        }
        other => Err(VesselError::Format(format!(
            "{} frame does not describe a container",
            kind_name(other).unwrap_or("unknown")
        ))),
    }
}

/// Rebuild a buffer stack from its frame
pub fn restore_buffer(frame: &[u8], ctx: &RestoreContext) -> Result<Box<dyn RandomBuffer>> {
    let (magic, body) = decode_frame(frame)?;
    match magic {
        FILE_BUFFER_MAGIC => Ok(Box::new(FileBuffer::from_payload(
            decode_payload(body)?,
            ctx.exit_cleanup.clone(),
        )?)),
        ENCRYPTED_BUFFER_MAGIC => {
            let payload: EncryptedPayload = decode_payload(body)?;
            let inner = restore_buffer(&payload.inner, ctx)?;
            Ok(Box::new(EncryptedBuffer::from_payload(payload, inner, ctx)?))
        }
        PADDED_BUFFER_MAGIC => {
            let payload: PaddedPayload = decode_payload(body)?;
            let inner = restore_buffer(&payload.inner, ctx)?;
            Ok(Box::new(PaddedBuffer::from_payload(payload, inner)?))
        }
        DELAYED_BUFFER_MAGIC => {
            let payload: DelayedPayload = decode_payload(body)?;
            let inner = restore_buffer(&payload.inner, ctx)?;
            Ok(Box::new(DelayedDisposalBuffer::from_payload(payload, inner, ctx)?))
        }
        other => Err(VesselError::Format(format!(
            "{} frame does not describe a buffer",
            kind_name(other).unwrap_or("unknown")
        ))),
    }
}
