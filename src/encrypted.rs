//! Authenticated-encryption wrappers
//!
//! Both wrappers store `header || ChaCha20(body)` in the wrapped storage.
//! The header format is identical, so [`EncryptedContainer`] and
//! [`EncryptedBuffer`] convert into each other without touching the data.
//!
//! Header failures are fatal: a bad magic or version is a format error, a
//! MAC mismatch is a security error, and nothing is ever decrypted before the
//! MAC has been checked.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use chacha20::cipher::{StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;

use crate::container::{check_range, forward_to, Container, ContainerKind, InputStream, OutputStream, RandomBuffer};
use crate::crypto::{EncryptionHeader, EncryptionType, HeaderKeys, KeyDerivation, MasterSecret, StreamKeys, HEADER_LEN};
use crate::error::{Result, VesselError};
use crate::persist::{self, EncryptedPayload, RestoreContext};

const HEADER_LEN_U64: u64 = HEADER_LEN as u64;

/// Shared key context of one encrypted wrapper and its shadows
#[derive(Clone)]
struct KeyContext {
    encryption: EncryptionType,
    /// Derived once from the master secret; seal and open every header
    header_keys: Arc<HeaderKeys>,
    /// Turns a header's content key into body keys
    kdf: Arc<dyn KeyDerivation>,
}

impl KeyContext {
    fn new(secret: &MasterSecret, kdf: Arc<dyn KeyDerivation>) -> Result<Self> {
        Ok(Self {
            encryption: EncryptionType::ChaCha20HmacSha256,
            header_keys: Arc::new(HeaderKeys::derive(secret, kdf.as_ref())?),
            kdf,
        })
    }

    /// Decode, authenticate, and derive body keys from a raw header
    fn open_header(&self, raw: &[u8]) -> Result<StreamKeys> {
        let header = EncryptionHeader::decode(raw)?;
        let content_key = header.open(&self.header_keys)?;
        content_key.stream_keys(self.kdf.as_ref())
    }

    /// Fresh header bytes plus the body keys they protect
    fn seal_header(&self) -> Result<(Vec<u8>, StreamKeys)> {
        let (header, content_key) = EncryptionHeader::seal(&self.header_keys)?;
        Ok((header.encode(), content_key.stream_keys(self.kdf.as_ref())?))
    }

    fn payload(&self, inner: Vec<u8>) -> EncryptedPayload {
        EncryptedPayload {
            encryption: self.encryption.code(),
            inner,
        }
    }
}

// =============================================================================
// EncryptedContainer
// =============================================================================

/// Container wrapper adding confidentiality and integrity
pub struct EncryptedContainer {
    /// Holds `header || ciphertext`
    inner: Box<dyn Container>,
    keys: KeyContext,
}

impl EncryptedContainer {
    /// Wrap `inner`; header keys are derived once from `secret`
    pub fn new(inner: Box<dyn Container>, secret: &MasterSecret, kdf: Arc<dyn KeyDerivation>) -> Result<Self> {
        Ok(Self {
            inner,
            keys: KeyContext::new(secret, kdf)?,
        })
    }

    pub(crate) fn from_payload(payload: EncryptedPayload, inner: Box<dyn Container>, ctx: &RestoreContext) -> Result<Self> {
        EncryptionType::from_code(payload.encryption)?;
        let secret = ctx.require_secret("encrypted container")?;
        Self::new(inner, secret, Arc::clone(&ctx.key_derivation))
    }

    /// Size of the wrapped storage, including the header
    pub fn physical_size(&self) -> u64 {
        self.inner.size()
    }
}

impl fmt::Debug for EncryptedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedContainer")
            .field("encryption", &self.keys.encryption)
            .field("inner", &self.inner)
            .finish()
    }
}

impl Container for EncryptedContainer {
    fn output_stream(&self) -> Result<Box<dyn OutputStream>> {
        let mut inner = self.inner.output_stream()?;
        let (header, stream_keys) = self.keys.seal_header()?;
        // Header goes out before any ciphertext.
        inner.write_all(&header)?;
        Ok(Box::new(EncryptedOutputStream {
            inner,
            cipher: stream_keys.cipher_at(0)?,
            scratch: Vec::new(),
        }))
    }

    fn input_stream(&self) -> Result<Option<Box<dyn InputStream>>> {
        let physical = self.inner.size();
        if physical == 0 {
            return Ok(None);
        }
        if physical < HEADER_LEN_U64 {
            return Err(VesselError::Format(format!(
                "{} holds {} bytes, less than an encryption header",
                self.inner.name(),
                physical
            )));
        }
        let Some(mut inner) = self.inner.input_stream()? else {
            return Ok(None);
        };
        let mut raw = [0u8; HEADER_LEN];
        inner.read_exact(&mut raw).map_err(|e| match VesselError::from(e) {
            VesselError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                VesselError::format("encryption header truncated")
            }
            other => other,
        })?;
        let stream_keys = self.keys.open_header(&raw)?;

        Ok(Some(Box::new(EncryptedInputStream {
            inner,
            cipher: stream_keys.cipher_at(0)?,
            position: 0,
        })))
    }

    fn size(&self) -> u64 {
        self.inner.size().saturating_sub(HEADER_LEN_U64)
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
        Ok(Some(Box::new(EncryptedContainer {
            inner: shadow,
            keys: self.keys.clone(),
        })))
    }

    fn to_random_buffer(&self) -> Result<Box<dyn RandomBuffer>> {
        if self.inner.size() == 0 {
            return Err(VesselError::Resource(format!(
                "{} has never been written; nothing to view",
                self.name()
            )));
        }
        let view = self.inner.to_random_buffer()?;
        Ok(Box::new(EncryptedBuffer::open_with(view, self.keys.clone())?))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        let payload = self.keys.payload(self.inner.persist()?);
        persist::encode_frame(persist::ENCRYPTED_CONTAINER_MAGIC, &payload)
    }

    fn name(&self) -> String {
        format!("encrypted({})", self.inner.name())
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Encrypted
    }
}

// =============================================================================
// Streams
// =============================================================================

struct EncryptedOutputStream {
    /// Header already written
    inner: Box<dyn OutputStream>,
    cipher: ChaCha20,
    /// Reused ciphertext buffer
    scratch: Vec<u8>,
}

impl fmt::Debug for EncryptedOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedOutputStream").field("inner", &self.inner).finish()
    }
}

impl Write for EncryptedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply_keystream(&mut self.scratch);
        // The keystream has advanced by buf.len(); the whole chunk must land.
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl OutputStream for EncryptedOutputStream {
    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

struct EncryptedInputStream {
    /// Positioned just past the header
    inner: Box<dyn InputStream>,
    cipher: ChaCha20,
    /// Body offset, kept in step with the keystream
    position: u64,
}

impl fmt::Debug for EncryptedInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedInputStream")
            .field("position", &self.position)
            .field("inner", &self.inner)
            .finish()
    }
}

impl Read for EncryptedInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl InputStream for EncryptedInputStream {
    fn available(&self) -> u64 {
        self.inner.available()
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let skipped = self.inner.skip(n)?;
        self.position += skipped;
        self.cipher
            .try_seek(self.position)
            .map_err(|e| VesselError::Resource(format!("cannot seek cipher: {}", e)).into_io())?;
        Ok(skipped)
    }
}

// =============================================================================
// EncryptedBuffer
// =============================================================================

/// Random-access wrapper; decrypts at any offset by seeking the keystream
pub struct EncryptedBuffer {
    /// Holds `header || ciphertext`; logical offset 0 is `HEADER_LEN` here
    inner: Box<dyn RandomBuffer>,
    keys: KeyContext,
    /// Body keys recovered from the header, shared with shadows
    stream_keys: StreamKeys,
}

impl EncryptedBuffer {
    /// Write a fresh header into `inner`; logical size is `inner.size() - HEADER_LEN`
    pub fn create(inner: Box<dyn RandomBuffer>, secret: &MasterSecret, kdf: Arc<dyn KeyDerivation>) -> Result<Self> {
        if inner.size() < HEADER_LEN_U64 {
            return Err(VesselError::Resource(format!(
                "{} is {} bytes, too small for an encryption header",
                inner.name(),
                inner.size()
            )));
        }
        let keys = KeyContext::new(secret, kdf)?;
        let (header, stream_keys) = keys.seal_header()?;
        inner.pwrite(0, &header)?;
        Ok(Self {
            inner,
            keys,
            stream_keys,
        })
    }

    /// Verify the header already stored in `inner`
    pub fn open(inner: Box<dyn RandomBuffer>, secret: &MasterSecret, kdf: Arc<dyn KeyDerivation>) -> Result<Self> {
        Self::open_with(inner, KeyContext::new(secret, kdf)?)
    }

    fn open_with(inner: Box<dyn RandomBuffer>, keys: KeyContext) -> Result<Self> {
        if inner.size() < HEADER_LEN_U64 {
            return Err(VesselError::Format(format!(
                "{} is {} bytes, less than an encryption header",
                inner.name(),
                inner.size()
            )));
        }
        let mut raw = [0u8; HEADER_LEN];
        inner.pread(0, &mut raw)?;
        let stream_keys = keys.open_header(&raw)?;
        Ok(Self {
            inner,
            keys,
            stream_keys,
        })
    }

    pub(crate) fn from_payload(payload: EncryptedPayload, inner: Box<dyn RandomBuffer>, ctx: &RestoreContext) -> Result<Self> {
        EncryptionType::from_code(payload.encryption)?;
        let secret = ctx.require_secret("encrypted buffer")?;
        Self::open(inner, secret, Arc::clone(&ctx.key_derivation))
    }
}

impl fmt::Debug for EncryptedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBuffer")
            .field("encryption", &self.keys.encryption)
            .field("inner", &self.inner)
            .finish()
    }
}

impl RandomBuffer for EncryptedBuffer {
    fn size(&self) -> u64 {
        self.inner.size() - HEADER_LEN_U64
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.size())?;
        self.inner.pread(offset + HEADER_LEN_U64, buf)?;
        self.stream_keys.cipher_at(offset)?.apply_keystream(buf);
        Ok(())
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.inner.is_read_only() {
            return Err(VesselError::resource("encrypted buffer is read-only"));
        }
        check_range(offset, data.len(), self.size())?;
        let mut ciphertext = data.to_vec();
        self.stream_keys.cipher_at(offset)?.apply_keystream(&mut ciphertext);
        self.inner.pwrite(offset + HEADER_LEN_U64, &ciphertext)
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
        Ok(Some(Box::new(EncryptedBuffer {
            inner: shadow,
            keys: self.keys.clone(),
            stream_keys: self.stream_keys.clone(),
        })))
    }

    fn into_container(self: Box<Self>) -> Result<Box<dyn Container>> {
        let Self { inner, keys, .. } = *self;
        Ok(Box::new(EncryptedContainer {
            inner: inner.into_container()?,
            keys,
        }))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        let payload = self.keys.payload(self.inner.persist()?);
        persist::encode_frame(persist::ENCRYPTED_BUFFER_MAGIC, &payload)
    }

    fn name(&self) -> String {
        format!("encrypted({})", self.inner.name())
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::Encrypted
    }
}
