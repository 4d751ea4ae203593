//! Ed25519 verification of detached signatures.
//!
//! The engine never signs anything; keys arrive via the trust store and
//! signatures arrive inside cabinet archives or next to remote metadata.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// An Ed25519 public key with its stable identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKey {
    /// Raw public key bytes
    pub key_bytes: [u8; 32],
    /// Stable identifier referenced by signature documents
    pub key_id: String,
    /// Optional comment or provenance note
    pub comment: Option<String>,
}

impl PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32], key_id: impl Into<String>) -> Self {
        Self {
            key_bytes: bytes,
            key_id: key_id.into(),
            comment: None,
        }
    }

    /// Decode a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str, key_id: impl Into<String>) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyFormat("key is not 32 bytes".to_string()))?;
        Ok(Self::from_bytes(bytes, key_id))
    }

    /// Encode the key bytes as base64 for persistence.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key_bytes)
    }

    /// Verify a detached signature over `data` with this key.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.key_bytes)
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.signature_bytes);
        key.verify(data, &sig)
            .map_err(|_| CryptoError::SignatureInvalid(self.key_id.clone()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.key_bytes.ct_eq(&other.key_bytes))
    }
}

impl Eq for PublicKey {}

/// A detached Ed25519 signature.
#[derive(Debug, Clone)]
pub struct Signature {
    /// Raw signature bytes
    pub signature_bytes: [u8; 64],
}

impl Signature {
    /// Create a signature from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self {
            signature_bytes: bytes,
        }
    }

    /// Decode a base64-encoded 64-byte signature.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::SignatureFormat(e.to_string()))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CryptoError::SignatureFormat("signature is not 64 bytes".to_string()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Encode as base64 for transport.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.signature_bytes)
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.signature_bytes.ct_eq(&other.signature_bytes))
    }
}

impl Eq for Signature {}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn test_keypair() -> (SigningKey, PublicKey) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public = PublicKey::from_bytes(signing.verifying_key().to_bytes(), "vendor-test");
        (signing, public)
    }

    #[test]
    fn test_verify_roundtrip() -> Result<(), CryptoError> {
        let (signing, public) = test_keypair();
        let data = b"metadata document";
        let sig = Signature::from_bytes(signing.sign(data).to_bytes());
        public.verify(data, &sig)?;
        Ok(())
    }

    #[test]
    fn test_verify_rejects_tampered_data() {
        let (signing, public) = test_keypair();
        let sig = Signature::from_bytes(signing.sign(b"original").to_bytes());
        let err = public.verify(b"tampered", &sig);
        assert!(matches!(err, Err(CryptoError::SignatureInvalid(_))));
    }

    #[test]
    fn test_base64_roundtrip() -> Result<(), CryptoError> {
        let (signing, public) = test_keypair();
        let sig = Signature::from_bytes(signing.sign(b"x").to_bytes());
        let decoded = Signature::from_base64(&sig.to_base64())?;
        assert_eq!(sig, decoded);
        let key = PublicKey::from_base64(&public.to_base64(), "vendor-test")?;
        assert_eq!(key, public);
        Ok(())
    }

    #[test]
    fn test_bad_lengths_rejected() {
        assert!(Signature::from_base64("c2hvcnQ=").is_err());
        assert!(PublicKey::from_base64("c2hvcnQ=", "k").is_err());
    }
}
