//! The remote description.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a remote's content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteKind {
    /// Signed metadata and payloads fetched from URIs
    Download,
    /// A filesystem directory of cabinet archives, scanned on demand
    LocalDirectory,
    /// A single cabinet archive treated as one source
    LocalFile,
}

/// A named, ordered, trusted source of updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    /// Stable remote id, recorded in release provenance
    pub id: String,
    /// Source kind
    pub kind: RemoteKind,
    /// Whether the remote takes part in refresh and matching
    pub enabled: bool,
    /// Human-readable title
    pub title: Option<String>,
    /// Metadata URI (or path for local kinds)
    pub metadata_uri: String,
    /// Detached signature URI; required for download remotes
    pub signature_uri: Option<String>,
    /// Endpoint install reports may be posted to
    pub report_uri: Option<String>,
    /// Refresh when the cached metadata is older than this
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    /// Ordering between remotes offering the same release, higher wins
    pub priority: i32,
    /// Upload reports without prompting
    pub automatic_reports: bool,
    /// Metadata must carry a verifying signature; only private test
    /// remotes turn this off
    #[serde(default = "default_true")]
    pub signed_metadata: bool,
    /// Payloads from this remote are expected to be signed
    #[serde(default)]
    pub signed_payload: bool,
    /// Trust store key ids the metadata signature must verify against
    pub key_ids: Vec<String>,
}

fn default_true() -> bool {
    true
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Remote {
    /// A download remote with the default one-day refresh policy.
    pub fn download(id: &str, metadata_uri: &str, signature_uri: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: RemoteKind::Download,
            enabled: true,
            title: None,
            metadata_uri: metadata_uri.to_string(),
            signature_uri: Some(signature_uri.to_string()),
            report_uri: None,
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            priority: 0,
            automatic_reports: false,
            signed_metadata: true,
            signed_payload: false,
            key_ids: Vec::new(),
        }
    }

    /// A local directory remote.
    pub fn local_directory(id: &str, path: &str) -> Self {
        Self {
            kind: RemoteKind::LocalDirectory,
            signature_uri: None,
            ..Self::download(id, path, "")
        }
    }

    /// A single local cabinet.
    pub fn local_file(id: &str, path: &str) -> Self {
        Self {
            kind: RemoteKind::LocalFile,
            signature_uri: None,
            ..Self::download(id, path, "")
        }
    }

    /// Declare the keys metadata must be signed with.
    pub fn with_key_ids(mut self, key_ids: &[&str]) -> Self {
        self.key_ids = key_ids.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Set the report upload endpoint.
    pub fn with_report_uri(mut self, uri: &str) -> Self {
        self.report_uri = Some(uri.to_string());
        self
    }

    /// Set the refresh policy.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the matching priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
