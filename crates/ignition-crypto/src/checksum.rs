//! Payload checksums as declared by release metadata.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Digest algorithms the cabinet format declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// SHA-1, kept for older vendor archives
    Sha1,
    /// SHA-256
    Sha256,
}

impl ChecksumKind {
    /// Hex digest length for the algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumKind::Sha1 => 40,
            ChecksumKind::Sha256 => 64,
        }
    }

    /// Guess the algorithm from a bare hex digest.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(ChecksumKind::Sha1),
            64 => Some(ChecksumKind::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Sha1 => f.write_str("sha1"),
            ChecksumKind::Sha256 => f.write_str("sha256"),
        }
    }
}

/// An algorithm-tagged hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// Digest algorithm
    pub kind: ChecksumKind,
    /// Lowercase hex digest
    pub value: String,
}

impl Checksum {
    /// Compute a digest of the given kind over the payload bytes.
    pub fn compute(kind: ChecksumKind, data: &[u8]) -> Self {
        let value = match kind {
            ChecksumKind::Sha1 => hex::encode(Sha1::digest(data)),
            ChecksumKind::Sha256 => hex::encode(Sha256::digest(data)),
        };
        Self { kind, value }
    }

    /// Whether the payload bytes hash to this digest.
    ///
    /// Comparison is constant-time; a truncated or malformed stored digest
    /// simply never matches.
    pub fn matches(&self, data: &[u8]) -> bool {
        let computed = Self::compute(self.kind, data);
        let a = computed.value.as_bytes();
        let b = self.value.as_bytes();
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }

    /// Pick the strongest checksum out of a declared list.
    pub fn best_of(checksums: &[Checksum]) -> Option<&Checksum> {
        checksums.iter().max_by_key(|c| c.kind)
    }
}

impl FromStr for Checksum {
    type Err = CryptoError;

    /// Parse `"sha256:<hex>"`, `"sha1:<hex>"` or a bare hex digest whose
    /// algorithm is guessed from its length.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, digest) = match s.split_once(':') {
            Some(("sha1", digest)) => (ChecksumKind::Sha1, digest),
            Some(("sha256", digest)) => (ChecksumKind::Sha256, digest),
            Some((other, _)) => {
                return Err(CryptoError::InvalidChecksum(other.to_string()));
            }
            None => {
                let kind = ChecksumKind::from_digest_len(s.len())
                    .ok_or_else(|| CryptoError::InvalidChecksum(s.to_string()))?;
                (kind, s)
            }
        };
        if digest.len() != kind.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidChecksum(s.to_string()));
        }
        Ok(Self {
            kind,
            value: digest.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}
