//! Trust store for vendor public keys
//!
//! A file-backed set of Ed25519 public keys keyed by their stable key id.
//! Remotes and cabinet signature bundles reference keys by id; anything
//! signed by a key that is not present here is untrusted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ed25519::{PublicKey, Signature};
use crate::error::CryptoError;

/// A trusted key with bookkeeping metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntry {
    /// The public key
    pub public_key: PublicKey,
    /// When this entry was added
    pub added_at: chrono::DateTime<chrono::Utc>,
    /// Optional provenance note
    pub reason: Option<String>,
}

/// File-backed store of trusted public keys.
pub struct TrustStore {
    entries: HashMap<String, TrustEntry>,
    store_path: Option<PathBuf>,
}

impl TrustStore {
    /// Open or create a trust store backed by a file.
    pub fn open(store_path: PathBuf) -> Result<Self, CryptoError> {
        let mut store = Self {
            entries: HashMap::new(),
            store_path: Some(store_path.clone()),
        };
        if store_path.exists() {
            store.load_from_file(&store_path)?;
        }
        Ok(store)
    }

    /// Create an in-memory trust store (for testing and emulation).
    pub fn in_memory() -> Self {
        Self {
            entries: HashMap::new(),
            store_path: None,
        }
    }

    fn load_from_file(&mut self, path: &Path) -> Result<(), CryptoError> {
        let content = std::fs::read_to_string(path)?;
        self.entries = serde_json::from_str(&content)?;
        debug!(keys = self.entries.len(), "loaded trust store");
        Ok(())
    }

    /// Persist the store if it is file-backed.
    pub fn save(&self) -> Result<(), CryptoError> {
        if let Some(ref path) = self.store_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(&self.entries)?;
            std::fs::write(path, content)?;
        }
        Ok(())
    }

    /// Add a key; replaces any previous key with the same id.
    pub fn add_key(&mut self, key: PublicKey, reason: Option<String>) -> Result<(), CryptoError> {
        if self.entries.contains_key(&key.key_id) {
            warn!(key_id = %key.key_id, "replacing existing trust store key");
        }
        self.entries.insert(
            key.key_id.clone(),
            TrustEntry {
                public_key: key,
                added_at: chrono::Utc::now(),
                reason,
            },
        );
        self.save()
    }

    /// Remove a key by id, returning whether it existed.
    pub fn remove_key(&mut self, key_id: &str) -> Result<bool, CryptoError> {
        let removed = self.entries.remove(key_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Look up a key by id.
    pub fn key(&self, key_id: &str) -> Option<&PublicKey> {
        self.entries.get(key_id).map(|e| &e.public_key)
    }

    /// Number of trusted keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify a detached signature by key id.
    ///
    /// Unknown keys are an error distinct from a bad signature so callers
    /// can render "untrusted" rather than "corrupt".
    pub fn verify(
        &self,
        key_id: &str,
        data: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let key = self
            .key(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;
        key.verify(data, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_verify_through_store() -> Result<(), CryptoError> {
        let signing = SigningKey::from_bytes(&[3u8; 32]);
        let public = PublicKey::from_bytes(signing.verifying_key().to_bytes(), "vendor-a");

        let mut store = TrustStore::in_memory();
        store.add_key(public, Some("unit test".to_string()))?;

        let sig = Signature::from_bytes(signing.sign(b"doc").to_bytes());
        store.verify("vendor-a", b"doc", &sig)?;

        let err = store.verify("vendor-b", b"doc", &sig);
        assert!(matches!(err, Err(CryptoError::UnknownKey(_))));
        Ok(())
    }

    #[test]
    fn test_file_backed_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("trust.json");

        let signing = SigningKey::from_bytes(&[9u8; 32]);
        let public = PublicKey::from_bytes(signing.verifying_key().to_bytes(), "vendor-z");

        {
            let mut store = TrustStore::open(path.clone())?;
            assert!(store.is_empty());
            store.add_key(public, None)?;
        }

        let store = TrustStore::open(path)?;
        assert_eq!(store.len(), 1);
        assert!(store.key("vendor-z").is_some());
        Ok(())
    }

    #[test]
    fn test_remove_key() -> Result<(), CryptoError> {
        let signing = SigningKey::from_bytes(&[5u8; 32]);
        let public = PublicKey::from_bytes(signing.verifying_key().to_bytes(), "gone");
        let mut store = TrustStore::in_memory();
        store.add_key(public, None)?;
        assert!(store.remove_key("gone")?);
        assert!(!store.remove_key("gone")?);
        Ok(())
    }
}
