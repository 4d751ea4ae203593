//! Durable install history for Ignition
//!
//! One row per install attempt, persisted through an atomic file replace so
//! a power cut mid-write leaves either the old journal or the new one,
//! never a torn file. The orchestrator appends a `Pending` row before
//! touching a device and finalizes it exactly once; rows in
//! `NeedsActivation` are the only ones resumable after a reboot.

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

use std::path::PathBuf;

use ignition_device::DeviceId;
use ignition_errors::{ErrorKind, Result, UpdateError};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The state of one install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    /// Install is running or was interrupted by a crash
    Pending,
    /// Firmware written and verified
    Success,
    /// Install failed; error fields say why
    Failed,
    /// Firmware staged, waiting for a separate activation
    NeedsActivation,
    /// Firmware staged, waiting for a system reboot
    NeedsReboot,
}

impl UpdateState {
    /// Whether the row is terminal.
    pub fn is_settled(self) -> bool {
        !matches!(self, UpdateState::Pending)
    }

    /// Legal row transitions: pending settles once, and a staged update
    /// may later resolve when its activation runs.
    pub fn can_transition_to(self, next: UpdateState) -> bool {
        match self {
            UpdateState::Pending => next != UpdateState::Pending,
            UpdateState::NeedsActivation => {
                matches!(next, UpdateState::Success | UpdateState::Failed)
            }
            _ => false,
        }
    }
}

/// One persisted install attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unique id for the attempt
    pub attempt_id: uuid::Uuid,
    /// The device updated
    pub device_id: DeviceId,
    /// Its composite unit
    pub composite_id: DeviceId,
    /// Device name at install time, for rendering old rows
    pub device_name: String,
    /// Plugin that drove the install
    pub plugin: String,
    /// Version before
    pub old_version: Option<String>,
    /// Version the release would install
    pub new_version: String,
    /// Checksum of the payload that was written
    pub release_checksum: Option<String>,
    /// Which remote the release came from
    pub remote_id: Option<String>,
    /// When the attempt began
    pub created: chrono::DateTime<chrono::Utc>,
    /// When the attempt settled
    pub modified: chrono::DateTime<chrono::Utc>,
    /// Attempt state
    pub state: UpdateState,
    /// First error observed, if any
    pub error_kind: Option<ErrorKind>,
    /// First error message observed, if any
    pub error_message: Option<String>,
    /// Whether the row was uploaded to the remote's report endpoint
    pub reported: bool,
}

impl HistoryEntry {
    /// Start a new pending attempt.
    pub fn begin(
        device_id: DeviceId,
        composite_id: DeviceId,
        device_name: &str,
        plugin: &str,
        old_version: Option<&str>,
        new_version: &str,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            attempt_id: uuid::Uuid::new_v4(),
            device_id,
            composite_id,
            device_name: device_name.to_string(),
            plugin: plugin.to_string(),
            old_version: old_version.map(str::to_string),
            new_version: new_version.to_string(),
            release_checksum: None,
            remote_id: None,
            created: now,
            modified: now,
            state: UpdateState::Pending,
            error_kind: None,
            error_message: None,
            reported: false,
        }
    }

    /// Attach release provenance.
    pub fn with_release(mut self, checksum: Option<String>, remote_id: Option<String>) -> Self {
        self.release_checksum = checksum;
        self.remote_id = remote_id;
        self
    }
}

/// The durable history store.
pub struct HistoryStore {
    path: Option<PathBuf>,
    entries: RwLock<Vec<HistoryEntry>>,
}

impl HistoryStore {
    /// Open or create a file-backed store.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes)
                .map_err(|e| UpdateError::invalid_file(format!("corrupt history store: {e}")))?
        } else {
            Vec::new()
        };
        debug!(rows = entries.len(), path = %path.display(), "opened history store");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// An in-memory store, used with the no-history install flag and in
    /// tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Vec::new()),
        }
    }

    async fn persist(&self, entries: &[HistoryEntry]) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| UpdateError::internal(format!("history serialize failed: {e}")))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Append a pending attempt.
    ///
    /// At most one pending row may exist per composite id; a second one
    /// means either a concurrent install slipped past the engine lock or a
    /// crashed attempt was never recovered, and both are refused.
    pub async fn begin(&self, entry: HistoryEntry) -> Result<uuid::Uuid> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries
            .iter()
            .find(|e| e.composite_id == entry.composite_id && e.state == UpdateState::Pending)
        {
            return Err(UpdateError::internal(format!(
                "install already pending for composite {} (attempt {})",
                entry.composite_id, existing.attempt_id
            )));
        }
        let attempt_id = entry.attempt_id;
        info!(attempt = %attempt_id, device = %entry.device_id, version = %entry.new_version, "history: begin");
        entries.push(entry);
        self.persist(&entries).await?;
        Ok(attempt_id)
    }

    /// Settle an attempt.
    ///
    /// The only legal in-place mutations: pending to a terminal state, and
    /// needs-activation to success or failed once the activation runs. The
    /// first error wins.
    pub async fn settle(
        &self,
        attempt_id: uuid::Uuid,
        state: UpdateState,
        error: Option<&UpdateError>,
    ) -> Result<()> {
        if state == UpdateState::Pending {
            return Err(UpdateError::invalid_args("cannot settle a row to pending"));
        }
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.attempt_id == attempt_id)
            .ok_or_else(|| UpdateError::not_found(format!("no history attempt {attempt_id}")))?;
        if !entry.state.can_transition_to(state) {
            return Err(UpdateError::internal(format!(
                "attempt {attempt_id} already settled as {:?}",
                entry.state
            )));
        }
        entry.state = state;
        entry.modified = chrono::Utc::now();
        if let Some(error) = error {
            if entry.error_kind.is_none() {
                entry.error_kind = Some(error.kind());
                entry.error_message = Some(error.message.clone());
            } else {
                warn!(attempt = %attempt_id, "keeping first recorded error");
            }
        }
        info!(attempt = %attempt_id, state = ?state, "history: settle");
        self.persist(&entries).await
    }

    /// Mark a settled row as uploaded.
    pub async fn mark_reported(&self, attempt_id: uuid::Uuid) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.attempt_id == attempt_id)
            .ok_or_else(|| UpdateError::not_found(format!("no history attempt {attempt_id}")))?;
        entry.reported = true;
        entry.modified = chrono::Utc::now();
        self.persist(&entries).await
    }

    /// All rows, oldest first.
    pub async fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().await.clone()
    }

    /// Rows for one device.
    pub async fn by_device(&self, device_id: &DeviceId) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| &e.device_id == device_id)
            .cloned()
            .collect()
    }

    /// The pending row for a composite unit, if any.
    pub async fn pending_for(&self, composite_id: &DeviceId) -> Option<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| &e.composite_id == composite_id && e.state == UpdateState::Pending)
            .cloned()
    }

    /// Settled rows not yet uploaded anywhere.
    pub async fn unreported(&self) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.state.is_settled() && !e.reported)
            .cloned()
            .collect()
    }

    /// Rows resumable after a reboot: staged updates awaiting activation.
    pub async fn resumable(&self) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.state == UpdateState::NeedsActivation)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(composite: &str) -> HistoryEntry {
        HistoryEntry::begin(
            DeviceId::from_raw(format!("{composite}-dev")),
            DeviceId::from_raw(composite),
            "Widget",
            "emulated",
            Some("1.0.0.0"),
            "1.0.0.1",
        )
    }

    #[tokio::test]
    async fn test_begin_and_settle() -> Result<()> {
        let store = HistoryStore::in_memory();
        let id = store.begin(sample_entry("comp-a")).await?;

        store.settle(id, UpdateState::Success, None).await?;
        let rows = store.entries().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, UpdateState::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_exclusivity_per_composite() -> Result<()> {
        let store = HistoryStore::in_memory();
        store.begin(sample_entry("comp-a")).await?;

        // same composite: refused
        assert!(store.begin(sample_entry("comp-a")).await.is_err());
        // unrelated composite: fine
        store.begin(sample_entry("comp-b")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_first_error_wins() -> Result<()> {
        let store = HistoryStore::in_memory();
        let id = store.begin(sample_entry("comp-a")).await?;

        let first = UpdateError::new(ErrorKind::WriteProtected, "nvm locked");
        store.settle(id, UpdateState::Failed, Some(&first)).await?;

        // double settle is refused, so the first error stays
        let second = UpdateError::timeout("late timeout");
        assert!(
            store
                .settle(id, UpdateState::Failed, Some(&second))
                .await
                .is_err()
        );

        let rows = store.entries().await;
        assert_eq!(rows[0].error_kind, Some(ErrorKind::WriteProtected));
        assert_eq!(rows[0].error_message.as_deref(), Some("nvm locked"));
        Ok(())
    }

    #[tokio::test]
    async fn test_resumable_is_needs_activation_only() -> Result<()> {
        let store = HistoryStore::in_memory();
        let a = store.begin(sample_entry("comp-a")).await?;
        let b = store.begin(sample_entry("comp-b")).await?;
        let c = store.begin(sample_entry("comp-c")).await?;

        store.settle(a, UpdateState::NeedsActivation, None).await?;
        store.settle(b, UpdateState::NeedsReboot, None).await?;
        store.settle(c, UpdateState::Success, None).await?;

        let resumable = store.resumable().await;
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].attempt_id, a);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreported_and_mark_reported() -> Result<()> {
        let store = HistoryStore::in_memory();
        let a = store.begin(sample_entry("comp-a")).await?;
        store.settle(a, UpdateState::Success, None).await?;

        assert_eq!(store.unreported().await.len(), 1);
        store.mark_reported(a).await?;
        assert!(store.unreported().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");

        let id = {
            let store = HistoryStore::open(path.clone()).await?;
            let id = store.begin(sample_entry("comp-a")).await?;
            store.settle(id, UpdateState::NeedsActivation, None).await?;
            id
        };

        let store = HistoryStore::open(path).await?;
        let resumable = store.resumable().await;
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].attempt_id, id);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_store_is_invalid_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.json");
        tokio::fs::write(&path, b"{ not json").await?;

        let err = HistoryStore::open(path).await;
        assert!(err.is_err_and(|e| e.kind() == ErrorKind::InvalidFile));
        Ok(())
    }
}
