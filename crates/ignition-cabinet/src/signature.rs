//! Detached signature bundles.
//!
//! A cabinet may carry one `.jcat` entry: a JSON document listing, per
//! archive entry, one or more detached signatures with the id of the vendor
//! key that made them. Verification walks the bundle against the trust
//! store; any unknown key or failed verification makes the whole cabinet
//! untrusted.

use std::collections::HashMap;

use ignition_crypto::{Signature, TrustStore};
use ignition_errors::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How much of a cabinet verified against the trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustLevel {
    /// No usable signatures
    #[default]
    Untrusted,
    /// Every payload blob carries a valid signature
    PayloadSigned,
    /// Every metadata document carries a valid signature
    MetadataSigned,
    /// Both payloads and metadata are fully signed
    BothSigned,
}

impl TrustLevel {
    /// Combine per-class verdicts into one level.
    pub fn from_parts(metadata_signed: bool, payload_signed: bool) -> Self {
        match (metadata_signed, payload_signed) {
            (true, true) => TrustLevel::BothSigned,
            (true, false) => TrustLevel::MetadataSigned,
            (false, true) => TrustLevel::PayloadSigned,
            (false, false) => TrustLevel::Untrusted,
        }
    }

    /// Whether the metadata documents verified.
    pub fn metadata_signed(self) -> bool {
        matches!(self, TrustLevel::MetadataSigned | TrustLevel::BothSigned)
    }

    /// Whether the payload blobs verified.
    pub fn payload_signed(self) -> bool {
        matches!(self, TrustLevel::PayloadSigned | TrustLevel::BothSigned)
    }
}

/// One signature over one archive entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBlob {
    /// Signature scheme; only `ed25519` is understood
    pub kind: String,
    /// Trust store key id that allegedly made this signature
    pub key_id: String,
    /// Base64 signature bytes
    pub data: String,
}

/// All signatures over one archive entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureItem {
    /// Basename of the covered archive entry
    pub id: String,
    /// Signatures, any one of which may satisfy verification
    pub blobs: Vec<SignatureBlob>,
}

/// A parsed detached signature bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBundle {
    /// Format version; currently always 1
    pub version: u32,
    /// Per-entry signature items
    pub items: Vec<SignatureItem>,
}

impl SignatureBundle {
    /// Parse a bundle from its JSON entry bytes.
    pub fn parse_json(bytes: &[u8]) -> Result<Self> {
        let bundle: SignatureBundle = serde_json::from_slice(bytes)
            .map_err(|e| UpdateError::invalid_file(format!("bad signature bundle: {e}")))?;
        if bundle.version != 1 {
            return Err(UpdateError::invalid_file(format!(
                "unsupported signature bundle version {}",
                bundle.version
            )));
        }
        Ok(bundle)
    }

    /// Serialize for embedding into an archive (fixture builders).
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| UpdateError::internal(format!("bundle serialize failed: {e}")))
    }

    /// Index items by lowercased entry basename.
    pub fn by_basename(&self) -> HashMap<String, &SignatureItem> {
        self.items
            .iter()
            .map(|item| (item.id.to_ascii_lowercase(), item))
            .collect()
    }

    /// Verify one covered entry against the trust store.
    ///
    /// Returns `Ok(true)` when a signature verified, `Ok(false)` when the
    /// bundle simply does not cover the entry, and an error for a covered
    /// entry whose signatures all fail: that is tampering, not absence.
    pub fn verify_entry(
        &self,
        entry_name: &str,
        data: &[u8],
        trust_store: &TrustStore,
    ) -> Result<bool> {
        let key = entry_name.to_ascii_lowercase();
        let Some(item) = self.items.iter().find(|i| i.id.to_ascii_lowercase() == key) else {
            return Ok(false);
        };

        let mut last_failure = None;
        for blob in &item.blobs {
            if blob.kind != "ed25519" {
                last_failure = Some(format!("unsupported signature kind '{}'", blob.kind));
                continue;
            }
            let signature = match Signature::from_base64(&blob.data) {
                Ok(s) => s,
                Err(e) => {
                    last_failure = Some(e.to_string());
                    continue;
                }
            };
            match trust_store.verify(&blob.key_id, data, &signature) {
                Ok(()) => {
                    debug!(entry = entry_name, key_id = %blob.key_id, "signature verified");
                    return Ok(true);
                }
                Err(e) => last_failure = Some(e.to_string()),
            }
        }

        Err(UpdateError::signature_invalid(format!(
            "entry '{entry_name}': {}",
            last_failure.unwrap_or_else(|| "no signatures in item".to_string())
        )))
    }
}
