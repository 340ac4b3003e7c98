//! Shared key types and constants used across the storage gateway core.

#![deny(unsafe_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Minimum number of shards required to reconstruct a file.
pub const K_REQUIRED: usize = 3;
/// Total number of shards produced per file.
pub const M_TOTAL: usize = 5;

const SIGNING_KEY_LEN: usize = 16;
const ENCRYPTION_KEY_LEN: usize = 16;
/// Total byte length of a composite `Key` (signing half || encryption half).
pub const KEY_LEN: usize = SIGNING_KEY_LEN + ENCRYPTION_KEY_LEN;

/// Errors produced while parsing a serialized key.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The base64 envelope did not decode.
    #[error("invalid base64 key encoding: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded bytes were not exactly [`KEY_LEN`] long.
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// A composite symmetric key: a 16-byte HMAC signing half and a 16-byte
/// AES-128 encryption half, serialized together as a single base64 string.
///
/// This is the key shape used by both `DataKey` (per file) and `MasterKey`
/// (process-wide, wraps manifests) — they are the same type used in two
/// different roles.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Generate a fresh random key using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct a key from raw bytes; fails if the length is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::WrongLength(bytes.len()));
        }
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Parse a key from its base64 serialization.
    pub fn from_b64(s: &str) -> Result<Self, KeyError> {
        let bytes = STANDARD.decode(s.trim())?;
        Self::from_bytes(&bytes)
    }

    /// Serialize the key to a printable base64 string, embeddable in a manifest.
    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// The HMAC signing half of the key.
    pub fn signing_key(&self) -> &[u8] {
        &self.0[..SIGNING_KEY_LEN]
    }

    /// The AES-128 encryption half of the key.
    pub fn encryption_key(&self) -> &[u8] {
        &self.0[SIGNING_KEY_LEN..]
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&"<redacted>").finish()
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_b64())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;
        impl Visitor<'_> for KeyVisitor {
            type Value = Key;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64-encoded storage key")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Key, E> {
                Key::from_b64(v).map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(KeyVisitor)
    }
}

/// Build the externally visible blob identifier for shard `index` of a file
/// whose path stem is `stem`: `"{stem}_shard_{index}"`.
pub fn shard_identifier(stem: &str, index: usize) -> String {
    format!("{stem}_shard_{index}")
}
