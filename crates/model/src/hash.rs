//! SHA-256 digests and the base64url rendering used for identifiers,
//! chain back-links and cluster message hashes.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

pub const HASH_LEN: usize = 32;

/// A SHA-256 digest.
///
/// Rendered as base64url without padding wherever it appears in persisted or
/// wire-visible form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash {
    data: [u8; HASH_LEN],
}

impl Hash {
    pub const ZERO: Self = Self { data: [0; HASH_LEN] };

    pub fn from_arr(arr: &[u8; HASH_LEN]) -> Self {
        Self { data: *arr }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.data)
    }

    pub fn from_base64url(encoded: &str) -> Result<Self, HashDecodeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| HashDecodeError)?;
        let data = <[u8; HASH_LEN]>::try_from(bytes.as_slice()).map_err(|_| HashDecodeError)?;
        Ok(Self { data })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.data)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_base64url())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64url())
    }
}

impl Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64url())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64url(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("not a base64url-encoded 32-byte digest")]
pub struct HashDecodeError;

/// SHA-256 of `bytes`.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Hash {
    let data = Sha256::digest(bytes.as_ref()).into();
    Hash { data }
}

/// `n` bytes from the OS random source.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Base64url (no padding) rendering of arbitrary bytes.
pub fn encode_base64url(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes.as_ref())
}
