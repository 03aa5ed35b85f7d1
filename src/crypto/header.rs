//! Encryption header
//!
//! ## Layout (88 bytes, big-endian)
//! ```text
//! ┌──────────┬──────────────────┬───────────┬─────────────┬───────────┐
//! │ IV (12)  │ WrappedKey (32)  │ MAC (32)  │ Version (4) │ Magic (8) │
//! └──────────┴──────────────────┴───────────┴─────────────┴───────────┘
//! ```
//! MAC = HMAC-SHA256(header MAC key, IV || ContentKey || Version)

use bytes::{Buf, BufMut, BytesMut};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha20, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VesselError};

use super::{KeyDerivation, MasterSecret, IV_SIZE, KEY_SIZE, MAC_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Current header format version
pub const HEADER_VERSION: u32 = 1;

/// Trailing constant identifying a Vessel encryption header
pub const HEADER_MAGIC: u64 = 0x5645_5353_454c_4831;

/// Total header size in bytes
pub const HEADER_LEN: usize = IV_SIZE + KEY_SIZE + MAC_SIZE + 4 + 8;

const HEADER_KEY_CONTEXT: &str = "vessel header key";
const HEADER_MAC_CONTEXT: &str = "vessel header mac";
const CONTENT_KEY_CONTEXT: &str = "vessel content key";
const CONTENT_IV_CONTEXT: &str = "vessel content iv";

/// Cipher suite (persisted as a one-byte code)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// ChaCha20 body, ChaCha20-wrapped content key, HMAC-SHA256 header MAC
    ChaCha20HmacSha256,
}

impl EncryptionType {
    pub fn code(self) -> u8 {
        match self {
            EncryptionType::ChaCha20HmacSha256 => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(EncryptionType::ChaCha20HmacSha256),
            other => Err(VesselError::Format(format!("unknown encryption type {}", other))),
        }
    }
}

/// Header-protection keys, derived once per master secret
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HeaderKeys {
    encrypt: [u8; KEY_SIZE],
    mac: [u8; KEY_SIZE],
}

impl HeaderKeys {
    pub fn derive(secret: &MasterSecret, kdf: &dyn KeyDerivation) -> Result<Self> {
        Ok(Self {
            encrypt: kdf.derive_key(secret.as_bytes(), HEADER_KEY_CONTEXT)?,
            mac: kdf.derive_key(secret.as_bytes(), HEADER_MAC_CONTEXT)?,
        })
    }

    fn mac(&self, iv: &[u8; IV_SIZE], content_key: &[u8; KEY_SIZE], version: u32) -> Result<[u8; MAC_SIZE]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|e| VesselError::Security(format!("bad MAC key: {}", e)))?;
        mac.update(iv);
        mac.update(content_key);
        mac.update(&version.to_be_bytes());
        Ok(mac.finalize().into_bytes().into())
    }

    /// Wrapping is its own inverse (XOR keystream)
    fn wrap(&self, iv: &[u8; IV_SIZE], key: &mut [u8; KEY_SIZE]) {
        let mut cipher = ChaCha20::new(Key::from_slice(&self.encrypt), Nonce::from_slice(iv));
        cipher.apply_keystream(key);
    }
}

/// Per-container random key protecting the body
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; KEY_SIZE]);

impl ContentKey {
    /// Derive the body cipher's key and nonce
    pub fn stream_keys(&self, kdf: &dyn KeyDerivation) -> Result<StreamKeys> {
        Ok(StreamKeys {
            key: kdf.derive_key(&self.0, CONTENT_KEY_CONTEXT)?,
            iv: kdf.derive_iv(&self.0, CONTENT_IV_CONTEXT)?,
        })
    }
}

/// Key and nonce of the seekable body cipher
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StreamKeys {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl StreamKeys {
    /// Body cipher positioned at plaintext offset `offset`
    pub fn cipher_at(&self, offset: u64) -> Result<ChaCha20> {
        let mut cipher = ChaCha20::new(Key::from_slice(&self.key), Nonce::from_slice(&self.iv));
        cipher
            .try_seek(offset)
            .map_err(|e| VesselError::Resource(format!("cannot seek cipher to {}: {}", offset, e)))?;
        Ok(cipher)
    }
}

/// Decoded (not yet verified) encryption header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    pub iv: [u8; IV_SIZE],
    pub wrapped_key: [u8; KEY_SIZE],
    pub mac: [u8; MAC_SIZE],
    pub version: u32,
}

impl EncryptionHeader {
    /// Generate a fresh content key and the header protecting it
    pub fn seal(keys: &HeaderKeys) -> Result<(Self, ContentKey)> {
        let mut content_key = ContentKey([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut content_key.0);
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mac = keys.mac(&iv, &content_key.0, HEADER_VERSION)?;
        let mut wrapped_key = content_key.0;
        keys.wrap(&iv, &mut wrapped_key);

        Ok((
            Self {
                iv,
                wrapped_key,
                mac,
                version: HEADER_VERSION,
            },
            content_key,
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(&self.iv);
        buf.put_slice(&self.wrapped_key);
        buf.put_slice(&self.mac);
        buf.put_u32(self.version);
        buf.put_u64(HEADER_MAGIC);
        buf.to_vec()
    }

    /// Parse and check magic/version; does not authenticate
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(VesselError::Format(format!(
                "truncated encryption header: {} of {} bytes",
                bytes.len(),
                HEADER_LEN
            )));
        }
        let mut buf = &bytes[..HEADER_LEN];
        let mut iv = [0u8; IV_SIZE];
        buf.copy_to_slice(&mut iv);
        let mut wrapped_key = [0u8; KEY_SIZE];
        buf.copy_to_slice(&mut wrapped_key);
        let mut mac = [0u8; MAC_SIZE];
        buf.copy_to_slice(&mut mac);
        let version = buf.get_u32();
        let magic = buf.get_u64();

        if magic != HEADER_MAGIC {
            return Err(VesselError::Format(format!("bad encryption header magic {:#018x}", magic)));
        }
        if version != HEADER_VERSION {
            return Err(VesselError::Format(format!("unsupported encryption header version {}", version)));
        }
        Ok(Self {
            iv,
            wrapped_key,
            mac,
            version,
        })
    }

    /// Unwrap the content key and verify the MAC in constant time
    pub fn open(&self, keys: &HeaderKeys) -> Result<ContentKey> {
        let mut content_key = ContentKey(self.wrapped_key);
        keys.wrap(&self.iv, &mut content_key.0);
        let expected = keys.mac(&self.iv, &content_key.0, self.version)?;
        if !bool::from(expected.as_slice().ct_eq(self.mac.as_slice())) {
            return Err(VesselError::Security(
                "encryption header MAC mismatch: wrong key or tampered header".to_string(),
            ));
        }
        Ok(content_key)
    }
}
