//! Error types for verification operations

use thiserror::Error;

/// Errors that can occur during checksum or signature verification
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Checksum string could not be parsed
    #[error("invalid checksum '{0}'")]
    InvalidChecksum(String),

    /// Checksum did not match the payload bytes
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Digest declared by the release
        expected: String,
        /// Digest computed over the payload
        computed: String,
    },

    /// Key material had the wrong shape
    #[error("invalid key material: {0}")]
    KeyFormat(String),

    /// Signature had the wrong shape
    #[error("invalid signature encoding: {0}")]
    SignatureFormat(String),

    /// Signature did not verify against the trusted key
    #[error("signature verification failed for key '{0}'")]
    SignatureInvalid(String),

    /// The signing key is not in the trust store
    #[error("unknown signing key '{0}'")]
    UnknownKey(String),

    /// Trust store file could not be read or written
    #[error("trust store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Trust store file could not be parsed
    #[error("trust store parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
