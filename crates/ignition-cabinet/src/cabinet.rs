//! The assembled cabinet: archive + components + signatures.

use ignition_crypto::TrustStore;
use ignition_errors::{Result, UpdateError};
use tracing::{info, warn};

use crate::archive::{Archive, ParseLimits};
use crate::metadata::{Component, ComponentDocument, Release};
use crate::signature::{SignatureBundle, TrustLevel};

fn is_metadata_name(basename: &str) -> bool {
    basename.ends_with(".metainfo.xml") || basename.ends_with(".xml")
}

fn is_signature_name(basename: &str) -> bool {
    basename.ends_with(".jcat")
}

/// A parsed vendor cabinet.
///
/// Holds the container, the merged component list from every metadata
/// document in archive order, and the optional detached signature bundle.
#[derive(Debug, Clone)]
pub struct Cabinet {
    archive: Archive,
    components: Vec<Component>,
    bundle: Option<SignatureBundle>,
}

impl Cabinet {
    /// Parse a cabinet from raw archive bytes.
    ///
    /// Structural requirements: at least one metadata document, at least
    /// one payload blob, at most one signature bundle, and every release
    /// location that is not a URI must resolve to an archive basename.
    pub fn parse(bytes: &[u8], limits: &ParseLimits) -> Result<Self> {
        let archive = Archive::parse(bytes, limits)?;

        let mut components = Vec::new();
        let mut bundle = None;
        let mut payload_count = 0usize;

        for entry in archive.entries() {
            let basename = entry.basename();
            if is_signature_name(&basename) {
                if bundle.is_some() {
                    return Err(UpdateError::invalid_file(
                        "cabinet has more than one signature bundle",
                    ));
                }
                bundle = Some(SignatureBundle::parse_json(&entry.data)?);
            } else if is_metadata_name(&basename) {
                let doc = ComponentDocument::parse_xml(&entry.data)
                    .map_err(|e| e.prefixed(format!("parse metadata '{}'", entry.name)))?;
                components.extend(doc.components);
            } else {
                payload_count += 1;
            }
        }

        if components.is_empty() {
            return Err(UpdateError::invalid_file(
                "cabinet has no metadata documents",
            ));
        }
        if payload_count == 0 {
            return Err(UpdateError::invalid_file("cabinet has no payload blobs"));
        }

        let cabinet = Self {
            archive,
            components,
            bundle,
        };
        cabinet.validate_locations()?;

        info!(
            components = cabinet.components.len(),
            payloads = payload_count,
            signed = cabinet.bundle.is_some(),
            "parsed cabinet"
        );
        Ok(cabinet)
    }

    fn validate_locations(&self) -> Result<()> {
        for component in &self.components {
            for release in &component.releases {
                if release.locations.is_empty() {
                    return Err(UpdateError::invalid_file(format!(
                        "release {} of {} has no payload location",
                        release.version, component.id
                    )));
                }
                let resolvable = release
                    .locations
                    .iter()
                    .any(|loc| self.archive.entry(loc).is_some());
                if !resolvable {
                    return Err(UpdateError::invalid_file(format!(
                        "release {} of {} references no entry inside the archive",
                        release.version, component.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Components merged from all metadata documents, archive order.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// The underlying container.
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// A payload blob by basename, case-insensitively.
    pub fn blob(&self, name: &str) -> Result<&[u8]> {
        self.archive.blob(name)
    }

    /// The payload bytes for a release: the first location resolving to an
    /// archive entry.
    pub fn payload(&self, release: &Release) -> Result<&[u8]> {
        for location in &release.locations {
            if let Some(entry) = self.archive.entry(location) {
                return Ok(&entry.data);
            }
        }
        Err(UpdateError::not_found(format!(
            "no archive entry for release {}",
            release.version
        )))
    }

    /// Verify the signature bundle against a trust store.
    ///
    /// An absent bundle, an unknown key or a failed verification all yield
    /// [`TrustLevel::Untrusted`]; this never errors, untrusted cabinets are
    /// a policy decision for the caller.
    pub fn verify(&self, trust_store: &TrustStore) -> TrustLevel {
        let Some(ref bundle) = self.bundle else {
            return TrustLevel::Untrusted;
        };

        let mut metadata_signed = true;
        let mut payload_signed = true;
        for entry in self.archive.entries() {
            let basename = entry.basename();
            if is_signature_name(&basename) {
                continue;
            }
            let covered = match bundle.verify_entry(&basename, &entry.data, trust_store) {
                Ok(covered) => covered,
                Err(e) => {
                    warn!(entry = %entry.name, error = %e, "signature verification failed");
                    return TrustLevel::Untrusted;
                }
            };
            if is_metadata_name(&basename) {
                metadata_signed &= covered;
            } else {
                payload_signed &= covered;
            }
        }

        TrustLevel::from_parts(metadata_signed, payload_signed)
    }

    /// Re-emit the cabinet deterministically; see [`Archive::write`].
    pub fn write(&self) -> Vec<u8> {
        self.archive.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::signature::{SignatureBlob, SignatureItem};
    use ed25519_dalek::{Signer, SigningKey};
    use ignition_crypto::{PublicKey, Signature};

    const METADATA: &str = r#"<components origin="test">
      <component>
        <id>com.vendor.widget.firmware</id>
        <provides><firmware type="flashed">11112222-3333-4444-5555-666677778888</firmware></provides>
        <releases>
          <release version="1.0.0.1">
            <location>payload.bin</location>
            <checksum target="content" type="sha256">PLACEHOLDER</checksum>
          </release>
        </releases>
      </component>
    </components>"#;

    fn metadata_with_checksum(payload: &[u8]) -> String {
        let sum = ignition_crypto::Checksum::compute(ignition_crypto::ChecksumKind::Sha256, payload);
        METADATA.replace("PLACEHOLDER", &sum.value)
    }

    fn sample_bytes() -> Vec<u8> {
        let payload = b"firmware-payload-bytes";
        let metadata = metadata_with_checksum(payload);
        ArchiveBuilder::new()
            .add("payload.bin", payload)
            .and_then(|b| b.add("widget.metainfo.xml", metadata.as_bytes()))
            .map(|b| b.build().write())
            .unwrap_or_default()
    }

    #[test]
    fn test_parse_and_lookup() -> Result<()> {
        let cabinet = Cabinet::parse(&sample_bytes(), &ParseLimits::default())?;
        assert_eq!(cabinet.components().len(), 1);
        let release = &cabinet.components()[0].releases[0];
        assert_eq!(cabinet.payload(release)?, b"firmware-payload-bytes");
        Ok(())
    }

    #[test]
    fn test_missing_metadata_rejected() {
        let bytes = ArchiveBuilder::new()
            .add("payload.bin", b"xx")
            .map(|b| b.build().write())
            .unwrap_or_default();
        assert!(Cabinet::parse(&bytes, &ParseLimits::default()).is_err());
    }

    #[test]
    fn test_missing_payload_rejected() {
        let bytes = ArchiveBuilder::new()
            .add("only.metainfo.xml", b"<components/>")
            .map(|b| b.build().write())
            .unwrap_or_default();
        assert!(Cabinet::parse(&bytes, &ParseLimits::default()).is_err());
    }

    #[test]
    fn test_dangling_location_rejected() {
        let metadata = r#"<components><component>
            <id>a.b.c</id>
            <releases><release version="1"><location>missing.bin</location></release></releases>
        </component></components>"#;
        let bytes = ArchiveBuilder::new()
            .add("payload.bin", b"xx")
            .and_then(|b| b.add("m.metainfo.xml", metadata.as_bytes()))
            .map(|b| b.build().write())
            .unwrap_or_default();
        assert!(Cabinet::parse(&bytes, &ParseLimits::default()).is_err());
    }

    #[test]
    fn test_write_roundtrip_identity() -> Result<()> {
        let bytes = sample_bytes();
        let cabinet = Cabinet::parse(&bytes, &ParseLimits::default())?;
        assert_eq!(cabinet.write(), bytes);
        Ok(())
    }

    fn signed_cabinet_bytes(sign_payload: bool) -> Vec<u8> {
        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let payload: &[u8] = b"firmware-payload-bytes";
        let metadata = metadata_with_checksum(payload);

        let mut items = vec![SignatureItem {
            id: "widget.metainfo.xml".to_string(),
            blobs: vec![SignatureBlob {
                kind: "ed25519".to_string(),
                key_id: "vendor".to_string(),
                data: Signature::from_bytes(signing.sign(metadata.as_bytes()).to_bytes())
                    .to_base64(),
            }],
        }];
        if sign_payload {
            items.push(SignatureItem {
                id: "payload.bin".to_string(),
                blobs: vec![SignatureBlob {
                    kind: "ed25519".to_string(),
                    key_id: "vendor".to_string(),
                    data: Signature::from_bytes(signing.sign(payload).to_bytes()).to_base64(),
                }],
            });
        }
        let bundle = SignatureBundle { version: 1, items };

        ArchiveBuilder::new()
            .add("payload.bin", payload)
            .and_then(|b| b.add("widget.metainfo.xml", metadata.as_bytes()))
            .and_then(|b| b.add("widget.jcat", &bundle.to_json().unwrap_or_default()))
            .map(|b| b.build().write())
            .unwrap_or_default()
    }

    fn vendor_store() -> TrustStore {
        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let mut store = TrustStore::in_memory();
        let _ = store.add_key(
            PublicKey::from_bytes(signing.verifying_key().to_bytes(), "vendor"),
            None,
        );
        store
    }

    #[test]
    fn test_verify_both_signed() -> Result<()> {
        let cabinet = Cabinet::parse(&signed_cabinet_bytes(true), &ParseLimits::default())?;
        assert_eq!(cabinet.verify(&vendor_store()), TrustLevel::BothSigned);
        Ok(())
    }

    #[test]
    fn test_verify_metadata_only() -> Result<()> {
        let cabinet = Cabinet::parse(&signed_cabinet_bytes(false), &ParseLimits::default())?;
        assert_eq!(cabinet.verify(&vendor_store()), TrustLevel::MetadataSigned);
        Ok(())
    }

    #[test]
    fn test_verify_unknown_key_is_untrusted() -> Result<()> {
        let cabinet = Cabinet::parse(&signed_cabinet_bytes(true), &ParseLimits::default())?;
        let empty_store = TrustStore::in_memory();
        assert_eq!(cabinet.verify(&empty_store), TrustLevel::Untrusted);
        Ok(())
    }

    #[test]
    fn test_unsigned_cabinet_is_untrusted() -> Result<()> {
        let cabinet = Cabinet::parse(&sample_bytes(), &ParseLimits::default())?;
        assert_eq!(cabinet.verify(&vendor_store()), TrustLevel::Untrusted);
        Ok(())
    }
}
