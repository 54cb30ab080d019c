//! Hashing primitives for content-addressed storage.
//!
//! This module provides:
//! - `Fingerprint`: a full SHA-256 hash, rendered as 64 lowercase hex characters
//! - `Digest`: a fingerprint plus the size of the content it addresses
//! - `Hashable`: canonical-JSON fingerprinting for structured values
//! - `hash_bytes()`: arbitrary byte hashing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub type HashError = serde_json::Error;

pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 of the empty byte string.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
  0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4,
  0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// Digest of the empty blob.
pub const EMPTY_DIGEST: Digest = Digest {
  hash: EMPTY_FINGERPRINT,
  size_bytes: 0,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintParseError {
  #[error("fingerprint must be {expected} hex characters, got {actual}")]
  Length { expected: usize, actual: usize },

  #[error("invalid hex in fingerprint: {0}")]
  Hex(String),

  #[error("digest must look like <hash>:<size>, got {0:?}")]
  DigestFormat(String),
}

/// A full SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
  pub fn from_hex(hex_string: &str) -> Result<Self, FingerprintParseError> {
    if hex_string.len() != FINGERPRINT_SIZE * 2 {
      return Err(FingerprintParseError::Length {
        expected: FINGERPRINT_SIZE * 2,
        actual: hex_string.len(),
      });
    }
    let mut bytes = [0u8; FINGERPRINT_SIZE];
    hex::decode_to_slice(hex_string, &mut bytes).map_err(|e| FingerprintParseError::Hex(e.to_string()))?;
    Ok(Fingerprint(bytes))
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }

  /// Two-character shard prefix used for on-disk layout.
  pub fn shard(&self) -> String {
    hex::encode(&self.0[..1])
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint<{}>", self.to_hex())
  }
}

impl FromStr for Fingerprint {
  type Err = FingerprintParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Fingerprint::from_hex(s)
  }
}

impl Serialize for Fingerprint {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Fingerprint {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
  }
}

/// Content address of a blob or a serialized directory.
///
/// Two digests with the same fingerprint always refer to byte-identical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest {
  pub hash: Fingerprint,
  pub size_bytes: usize,
}

impl Digest {
  pub fn new(hash: Fingerprint, size_bytes: usize) -> Self {
    Self { hash, size_bytes }
  }

  pub fn of_bytes(bytes: &[u8]) -> Self {
    Self {
      hash: hash_bytes(bytes),
      size_bytes: bytes.len(),
    }
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.hash, self.size_bytes)
  }
}

impl FromStr for Digest {
  type Err = FingerprintParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (hash, size) = s
      .split_once(':')
      .ok_or_else(|| FingerprintParseError::DigestFormat(s.to_string()))?;
    let size_bytes = size
      .parse::<usize>()
      .map_err(|_| FingerprintParseError::DigestFormat(s.to_string()))?;
    Ok(Digest::new(Fingerprint::from_hex(hash)?, size_bytes))
  }
}

/// Values whose identity is the SHA-256 of their canonical JSON form.
///
/// Implementors must serialize deterministically: ordered maps and sets only.
pub trait Hashable: Serialize {
  fn fingerprint(&self) -> Result<Fingerprint, HashError> {
    let serialized = serde_json::to_vec(self)?;
    Ok(hash_bytes(&serialized))
  }
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> Fingerprint {
  let mut hasher = Sha256::new();
  hasher.update(data);
  Fingerprint(hasher.finalize().into())
}
