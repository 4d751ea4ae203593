//! Persisted engine configuration.
//!
//! A per-system config file with an optional per-user override merged on
//! top, plus the handful of environment variables operators reach for when
//! something is broken. Key names are part of the on-disk contract and so
//! keep their historical spelling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ignition_errors::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-remote configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Whether the remote takes part in refresh and matching
    #[serde(rename = "Enabled", default)]
    pub enabled: Option<bool>,
    /// Overridden report endpoint
    #[serde(rename = "ReportURI", default)]
    pub report_uri: Option<String>,
    /// Upload reports without prompting
    #[serde(rename = "AutomaticReports", default)]
    pub automatic_reports: Option<bool>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the history store, metadata cache, trust store
    /// and lock file
    #[serde(skip)]
    pub state_dir: PathBuf,

    /// Register the emulated test devices at startup
    #[serde(rename = "TestDevices", default)]
    pub test_devices: bool,

    /// Idle shutdown for the embedding daemon, seconds
    #[serde(rename = "IdleTimeout", default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Write a message-of-the-day file after updates
    #[serde(rename = "UpdateMotd", default)]
    pub update_motd: bool,

    /// Largest cabinet archive accepted, bytes
    #[serde(rename = "ArchiveSizeMax", default = "default_archive_size_max")]
    pub archive_size_max: u64,

    /// Uids trusted to drive privileged operations
    #[serde(rename = "TrustedUids", default)]
    pub trusted_uids: Vec<u32>,

    /// Per-remote overrides keyed by remote id
    #[serde(rename = "Remotes", default)]
    pub remotes: HashMap<String, RemoteConfig>,

    /// Weakened TLS verification for broken proxies (diagnostic only);
    /// surfaced to whatever fetcher the embedding binary wires in
    #[serde(skip)]
    pub disable_ssl_strict: bool,

    /// Verbose progress profiling
    #[serde(skip)]
    pub verbose: bool,

    /// Alternate service-unit identity when running confined
    #[serde(skip)]
    pub snap_name: Option<String>,
}

fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_values(
                    base.entry(key).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn default_idle_timeout() -> u64 {
    7200
}

fn default_archive_size_max() -> u64 {
    128 * 1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/ignition"),
            test_devices: false,
            idle_timeout_secs: default_idle_timeout(),
            update_motd: false,
            archive_size_max: default_archive_size_max(),
            trusted_uids: Vec::new(),
            remotes: HashMap::new(),
            disable_ssl_strict: false,
            verbose: false,
            snap_name: None,
        }
    }
}

impl EngineConfig {
    /// Config rooted at a state directory, environment applied.
    pub fn for_state_dir(state_dir: PathBuf) -> Self {
        let mut config = Self {
            state_dir,
            ..Self::default()
        };
        config.apply_env();
        config
    }

    /// Load the system config, merge a user override if present, apply
    /// the environment.
    pub fn load(state_dir: PathBuf, user_config: Option<&Path>) -> Result<Self> {
        let mut config = Self::for_state_dir(state_dir);
        let system_path = config.config_path();
        if system_path.exists() {
            config.merge_file(&system_path)?;
        }
        if let Some(user_path) = user_config {
            if user_path.exists() {
                config.merge_file(user_path)?;
            }
        }
        config.apply_env();
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let overlay: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| UpdateError::invalid_file(format!("bad config {}: {e}", path.display())))?;
        let mut base = serde_json::to_value(&*self)
            .map_err(|e| UpdateError::internal(format!("config serialize failed: {e}")))?;
        merge_values(&mut base, overlay);

        let state_dir = std::mem::take(&mut self.state_dir);
        let env = (self.disable_ssl_strict, self.verbose, self.snap_name.take());
        *self = serde_json::from_value(base)
            .map_err(|e| UpdateError::invalid_file(format!("bad config {}: {e}", path.display())))?;
        self.state_dir = state_dir;
        (self.disable_ssl_strict, self.verbose, self.snap_name) = env;
        debug!(path = %path.display(), "merged config file");
        Ok(())
    }

    fn apply_env(&mut self) {
        if std::env::var_os("DISABLE_SSL_STRICT").is_some() {
            self.disable_ssl_strict = true;
        }
        if std::env::var_os("IGNITION_VERBOSE").is_some() {
            self.verbose = true;
        }
        self.snap_name = std::env::var("SNAP_NAME").ok().filter(|s| !s.is_empty());
    }

    /// Persist the system config file.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| UpdateError::internal(format!("config serialize failed: {e}")))?;
        std::fs::write(self.config_path(), json)?;
        Ok(())
    }

    /// Path of the system config file.
    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("engine.json")
    }

    /// Path of the history store.
    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("history.json")
    }

    /// Path of the trust store.
    pub fn trust_store_path(&self) -> PathBuf {
        self.state_dir.join("trust.json")
    }

    /// Directory of the metadata cache.
    pub fn metadata_cache_dir(&self) -> PathBuf {
        self.state_dir.join("metadata")
    }

    /// Path of the process lock.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("engine.lock")
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(7200));
        assert_eq!(config.archive_size_max, 128 * 1024 * 1024);
        assert!(!config.test_devices);
    }

    #[test]
    fn test_load_merges_user_over_system() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let state_dir = dir.path().to_path_buf();

        std::fs::write(
            state_dir.join("engine.json"),
            br#"{"TestDevices": true, "ArchiveSizeMax": 1024}"#,
        )?;
        let user = dir.path().join("user.json");
        std::fs::write(&user, br#"{"TestDevices": true, "ArchiveSizeMax": 4096}"#)?;

        let config = EngineConfig::load(state_dir, Some(&user))?;
        assert!(config.test_devices);
        assert_eq!(config.archive_size_max, 4096);
        Ok(())
    }

    #[test]
    fn test_bad_config_is_invalid_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("engine.json"), b"not json")?;
        let err = EngineConfig::load(dir.path().to_path_buf(), None);
        assert!(err.is_err_and(|e| e.kind() == ignition_errors::ErrorKind::InvalidFile));
        Ok(())
    }

    #[test]
    fn test_remote_sections_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = EngineConfig::for_state_dir(dir.path().to_path_buf());
        config.remotes.insert(
            "lvfs".to_string(),
            RemoteConfig {
                enabled: Some(false),
                report_uri: Some("https://example.com/report".to_string()),
                automatic_reports: Some(true),
            },
        );
        config.save()?;

        let loaded = EngineConfig::load(dir.path().to_path_buf(), None)?;
        let lvfs = loaded.remotes.get("lvfs").cloned().unwrap_or_default();
        assert_eq!(lvfs.enabled, Some(false));
        assert_eq!(lvfs.automatic_reports, Some(true));
        Ok(())
    }
}
