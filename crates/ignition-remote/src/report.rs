//! Install report upload payloads.
//!
//! After an install settles, its history row may be posted to the remote's
//! report endpoint as JSON. Building the document is the engine's job;
//! actually posting it belongs to the client binary, gated on the remote's
//! automatic-reports flag or an explicit operator request.

use ignition_history::HistoryEntry;
use ignition_errors::{Result, UpdateError};
use serde::{Deserialize, Serialize};

/// One report row, a trimmed projection of a history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    /// Device name at install time
    pub device_name: String,
    /// Plugin that drove the install
    pub plugin: String,
    /// Version before
    pub old_version: Option<String>,
    /// Version installed
    pub new_version: String,
    /// Payload checksum, ties the report to an exact release
    pub release_checksum: Option<String>,
    /// Terminal state as its wire name
    pub state: ignition_history::UpdateState,
    /// Error kind for failed installs
    pub error_kind: Option<ignition_errors::ErrorKind>,
    /// Error message for failed installs
    pub error_message: Option<String>,
    /// When the attempt settled
    pub modified: chrono::DateTime<chrono::Utc>,
}

/// The JSON document posted to a report endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPayload {
    /// Payload schema version
    pub report_version: u32,
    /// Reports for one remote
    pub reports: Vec<ReportRow>,
}

impl ReportPayload {
    /// Build a payload from settled history rows belonging to `remote_id`.
    pub fn build(remote_id: &str, entries: &[HistoryEntry]) -> Self {
        let reports = entries
            .iter()
            .filter(|e| e.remote_id.as_deref() == Some(remote_id))
            .filter(|e| e.state.is_settled())
            .map(|e| ReportRow {
                device_name: e.device_name.clone(),
                plugin: e.plugin.clone(),
                old_version: e.old_version.clone(),
                new_version: e.new_version.clone(),
                release_checksum: e.release_checksum.clone(),
                state: e.state,
                error_kind: e.error_kind,
                error_message: e.error_message.clone(),
                modified: e.modified,
            })
            .collect();
        Self {
            report_version: 2,
            reports,
        }
    }

    /// Whether there is anything worth posting.
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Serialize for upload.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| UpdateError::internal(format!("report serialize failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ignition_device::DeviceId;
    use ignition_history::UpdateState;

    fn settled_entry(remote_id: &str, state: UpdateState) -> HistoryEntry {
        let mut entry = HistoryEntry::begin(
            DeviceId::from_raw("dev"),
            DeviceId::from_raw("comp"),
            "Widget",
            "emulated",
            Some("1.0"),
            "1.1",
        )
        .with_release(Some("sha256:abc".to_string()), Some(remote_id.to_string()));
        entry.state = state;
        entry
    }

    #[test]
    fn test_build_filters_by_remote_and_state() {
        let entries = vec![
            settled_entry("lvfs", UpdateState::Success),
            settled_entry("lvfs", UpdateState::Failed),
            settled_entry("other", UpdateState::Success),
            settled_entry("lvfs", UpdateState::Pending),
        ];
        let payload = ReportPayload::build("lvfs", &entries);
        assert_eq!(payload.reports.len(), 2);
        assert_eq!(payload.report_version, 2);
    }

    #[test]
    fn test_json_shape() -> Result<()> {
        let payload = ReportPayload::build("lvfs", &[settled_entry("lvfs", UpdateState::Success)]);
        let json = payload.to_json()?;
        let text = String::from_utf8_lossy(&json);
        assert!(text.contains("\"report_version\": 2"));
        assert!(text.contains("\"new_version\": \"1.1\""));
        Ok(())
    }
}
