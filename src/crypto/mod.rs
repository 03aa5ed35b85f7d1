//! Crypto Module
//!
//! Key material and the encryption header shared by
//! [`EncryptedContainer`](crate::encrypted::EncryptedContainer) and
//! [`EncryptedBuffer`](crate::encrypted::EncryptedBuffer).
//!
//! ## Key Hierarchy
//! ```text
//! MasterSecret ──derive "vessel header key"──► header encryption key ─┐
//!      │                                                               ├─ wrap + MAC content key
//!      └──────derive "vessel header mac"───► header MAC key ──────────┘
//!
//! ContentKey (random, per container)
//!      ├──derive "vessel content key"──► ChaCha20 key
//!      └──derive "vessel content iv"───► ChaCha20 nonce
//! ```
//! Header-protection material never doubles as content-protection material.

mod header;

use std::fmt;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VesselError};

pub use header::{ContentKey, EncryptionHeader, EncryptionType, HeaderKeys, StreamKeys};
pub use header::{HEADER_LEN, HEADER_MAGIC, HEADER_VERSION};

/// ChaCha20 nonce length
pub const IV_SIZE: usize = 12;

/// Symmetric key length
pub const KEY_SIZE: usize = 32;

/// HMAC-SHA256 tag length
pub const MAC_SIZE: usize = 32;

/// Root secret every header key is derived from
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret {
    bytes: [u8; KEY_SIZE],
}

impl MasterSecret {
    /// Fresh secret from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Accepts exactly `KEY_SIZE` bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            VesselError::Security(format!("master secret must be {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// Keyed derivation of keys and IVs from a secret and a context tag
pub trait KeyDerivation: Send + Sync + fmt::Debug {
    fn derive_key(&self, secret: &[u8], context: &str) -> Result<[u8; KEY_SIZE]>;

    fn derive_iv(&self, secret: &[u8], context: &str) -> Result<[u8; IV_SIZE]>;
}

/// HKDF-SHA256 with the context tag as `info`
#[derive(Debug, Default, Clone, Copy)]
pub struct HkdfSha256;

impl HkdfSha256 {
    fn expand<const N: usize>(secret: &[u8], context: &str) -> Result<[u8; N]> {
        let hkdf = Hkdf::<Sha256>::new(None, secret);
        let mut out = [0u8; N];
        hkdf.expand(context.as_bytes(), &mut out)
            .map_err(|e| VesselError::Security(format!("key derivation failed: {}", e)))?;
        Ok(out)
    }
}

impl KeyDerivation for HkdfSha256 {
    fn derive_key(&self, secret: &[u8], context: &str) -> Result<[u8; KEY_SIZE]> {
        Self::expand(secret, context)
    }

    fn derive_iv(&self, secret: &[u8], context: &str) -> Result<[u8; IV_SIZE]> {
        Self::expand(secret, context)
    }
}
