//! Checksum and signature verification for Ignition
//!
//! This crate provides the verification primitives the update engine relies
//! on before any payload touches a device:
//!
//! - [`checksum`]: SHA-1/SHA-256 payload digests as declared by releases
//! - [`ed25519`]: Ed25519 verification of detached signatures
//! - [`trust_store`]: the file-backed set of vendor public keys
//!
//! The engine only ever *verifies* incoming artifacts; nothing in this crate
//! creates signatures. Tests construct signing keys directly from
//! `ed25519-dalek` to produce fixtures.
//!
//! # Example
//!
//! ```
//! use ignition_crypto::{Checksum, ChecksumKind};
//!
//! let payload = b"firmware payload";
//! let checksum = Checksum::compute(ChecksumKind::Sha256, payload);
//! assert!(checksum.matches(payload));
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod checksum;
pub mod ed25519;
pub mod error;
pub mod trust_store;

pub use checksum::{Checksum, ChecksumKind};
pub use ed25519::{PublicKey, Signature};
pub use error::CryptoError;
pub use trust_store::{TrustEntry, TrustStore};

/// A specialized `Result` type for verification operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
