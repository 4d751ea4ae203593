//! The remote set and its merged metadata index.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use ignition_cabinet::metadata::{Component, ComponentDocument};
use ignition_cabinet::signature::SignatureBundle;
use ignition_crypto::TrustStore;
use ignition_errors::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::fetcher::MetadataFetcher;
use crate::remote::{Remote, RemoteKind};

/// Metadata older than this draws a soft staleness warning.
const STALE_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A component together with the remote it came from.
#[derive(Debug, Clone)]
pub struct IndexedComponent {
    /// The remote's id
    pub remote_id: String,
    /// The remote's priority at index time
    pub priority: i32,
    /// The component itself
    pub component: Component,
}

/// What one refresh did.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    /// Whether anything was fetched
    pub refreshed: bool,
    /// Components now indexed for the remote
    pub components: usize,
    /// Set when some enabled remote's metadata is older than 30 days
    pub stale_warning: Option<String>,
}

struct RemoteState {
    remote: Remote,
    fetched_at: Option<chrono::DateTime<chrono::Utc>>,
    components: Vec<Component>,
    cabinet_paths: Vec<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    fetched_at: HashMap<String, chrono::DateTime<chrono::Utc>>,
}

/// The persistent set of trusted update sources.
pub struct RemoteSet {
    inner: RwLock<Vec<RemoteState>>,
    cache_dir: Option<PathBuf>,
}

impl RemoteSet {
    /// An empty set with no on-disk cache.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
            cache_dir: None,
        }
    }

    /// An empty set caching fetched metadata under `cache_dir`.
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
            cache_dir: Some(cache_dir),
        }
    }

    /// Add a remote; replaces an existing one with the same id.
    pub async fn add_remote(&self, remote: Remote) {
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.iter_mut().find(|s| s.remote.id == remote.id) {
            state.remote = remote;
            return;
        }
        debug!(remote = %remote.id, kind = ?remote.kind, "added remote");
        inner.push(RemoteState {
            remote,
            fetched_at: None,
            components: Vec::new(),
            cabinet_paths: Vec::new(),
        });
    }

    /// Snapshot of the configured remotes.
    pub async fn remotes(&self) -> Vec<Remote> {
        self.inner.read().await.iter().map(|s| s.remote.clone()).collect()
    }

    /// Look up one remote.
    pub async fn get(&self, remote_id: &str) -> Option<Remote> {
        self.inner
            .read()
            .await
            .iter()
            .find(|s| s.remote.id == remote_id)
            .map(|s| s.remote.clone())
    }

    /// Enable or disable a remote.
    ///
    /// Disabling drops its indexed metadata so a disabled remote can never
    /// satisfy a match.
    pub async fn set_enabled(&self, remote_id: &str, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let state = inner
            .iter_mut()
            .find(|s| s.remote.id == remote_id)
            .ok_or_else(|| UpdateError::not_found(format!("no remote '{remote_id}'")))?;
        state.remote.enabled = enabled;
        if !enabled {
            state.components.clear();
            state.cabinet_paths.clear();
            state.fetched_at = None;
        }
        info!(remote = %remote_id, enabled, "remote toggled");
        Ok(())
    }

    /// Whether the remote's cached metadata has outlived its TTL.
    pub async fn refresh_needed(&self, remote_id: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        let state = inner
            .iter()
            .find(|s| s.remote.id == remote_id)
            .ok_or_else(|| UpdateError::not_found(format!("no remote '{remote_id}'")))?;
        Ok(match state.fetched_at {
            None => true,
            Some(at) => age_of(at) > state.remote.refresh_interval,
        })
    }

    /// Refresh one remote.
    ///
    /// Download remotes fetch the signature first, then the metadata, and
    /// reject the pair unless the signature verifies against the remote's
    /// declared keys. Local kinds rescan the filesystem. A no-op unless
    /// the TTL has lapsed or `force` is set.
    pub async fn refresh(
        &self,
        remote_id: &str,
        fetcher: &dyn MetadataFetcher,
        trust_store: &TrustStore,
        force: bool,
    ) -> Result<RefreshOutcome> {
        if !force && !self.refresh_needed(remote_id).await? {
            return Ok(RefreshOutcome {
                refreshed: false,
                components: self.component_count(remote_id).await,
                stale_warning: self.stale_warning().await,
            });
        }

        let remote = self
            .get(remote_id)
            .await
            .ok_or_else(|| UpdateError::not_found(format!("no remote '{remote_id}'")))?;
        if !remote.enabled {
            return Err(UpdateError::nothing_to_do(format!(
                "remote '{remote_id}' is disabled"
            )));
        }

        let mut components = Vec::new();
        let mut cabinet_paths = Vec::new();

        match remote.kind {
            RemoteKind::Download => {
                let metadata_bytes = if remote.signed_metadata {
                    let signature_uri = remote.signature_uri.as_deref().ok_or_else(|| {
                        UpdateError::invalid_args(format!(
                            "download remote '{remote_id}' has no signature URI"
                        ))
                    })?;
                    let signature_bytes = fetcher.fetch(signature_uri).await?;
                    let metadata_bytes = fetcher.fetch(&remote.metadata_uri).await?;
                    verify_metadata(&remote, &signature_bytes, &metadata_bytes, trust_store)?;
                    metadata_bytes
                } else {
                    fetcher.fetch(&remote.metadata_uri).await?
                };
                components = ComponentDocument::parse_xml(&metadata_bytes)?.components;

                self.cache_metadata(remote_id, &metadata_bytes).await?;
            }
            RemoteKind::LocalDirectory => {
                let mut dir = tokio::fs::read_dir(&remote.metadata_uri).await?;
                while let Some(entry) = dir.next_entry().await? {
                    let path = entry.path();
                    let is_cabinet = path
                        .extension()
                        .is_some_and(|e| e.eq_ignore_ascii_case("cab"));
                    if is_cabinet {
                        cabinet_paths.push(path);
                    }
                }
                cabinet_paths.sort();
            }
            RemoteKind::LocalFile => {
                cabinet_paths.push(PathBuf::from(&remote.metadata_uri));
            }
        }

        let count = components.len();
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.iter_mut().find(|s| s.remote.id == remote_id) {
            state.components = components;
            state.cabinet_paths = cabinet_paths;
            state.fetched_at = Some(chrono::Utc::now());
        }
        drop(inner);
        self.save_cache_state().await?;

        info!(remote = %remote_id, components = count, "refreshed remote");
        Ok(RefreshOutcome {
            refreshed: true,
            components: count,
            stale_warning: self.stale_warning().await,
        })
    }

    async fn component_count(&self, remote_id: &str) -> usize {
        self.inner
            .read()
            .await
            .iter()
            .find(|s| s.remote.id == remote_id)
            .map(|s| s.components.len())
            .unwrap_or(0)
    }

    /// The age of the most stale enabled remote with any metadata.
    pub async fn oldest_age(&self) -> Option<Duration> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|s| s.remote.enabled)
            .filter_map(|s| s.fetched_at.map(age_of))
            .max()
    }

    async fn stale_warning(&self) -> Option<String> {
        let age = self.oldest_age().await?;
        if age > STALE_AGE {
            Some(format!(
                "metadata is {} days old; consider refreshing",
                age.as_secs() / 86_400
            ))
        } else {
            None
        }
    }

    /// Components matching any of the given hardware-ids, across all
    /// enabled remotes, ordered by remote priority descending.
    pub async fn components_for_guids(&self, guids: &[String]) -> Vec<IndexedComponent> {
        let inner = self.inner.read().await;
        let mut found: Vec<IndexedComponent> = inner
            .iter()
            .filter(|s| s.remote.enabled)
            .flat_map(|s| {
                s.components
                    .iter()
                    .filter(|c| c.matches_any_guid(guids.iter().map(String::as_str)))
                    .map(|c| IndexedComponent {
                        remote_id: s.remote.id.clone(),
                        priority: s.remote.priority,
                        component: c.clone(),
                    })
            })
            .collect();
        found.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.remote_id.cmp(&b.remote_id)));
        found
    }

    /// Cabinet paths contributed by local remotes.
    pub async fn local_cabinets(&self) -> Vec<(String, PathBuf)> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|s| s.remote.enabled)
            .flat_map(|s| {
                s.cabinet_paths
                    .iter()
                    .map(|p| (s.remote.id.clone(), p.clone()))
            })
            .collect()
    }

    async fn cache_metadata(&self, remote_id: &str, bytes: &[u8]) -> Result<()> {
        let Some(ref dir) = self.cache_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(format!("{remote_id}.xml")), bytes).await?;
        Ok(())
    }

    async fn save_cache_state(&self) -> Result<()> {
        let Some(ref dir) = self.cache_dir else {
            return Ok(());
        };
        let inner = self.inner.read().await;
        let state = CacheState {
            fetched_at: inner
                .iter()
                .filter_map(|s| s.fetched_at.map(|at| (s.remote.id.clone(), at)))
                .collect(),
        };
        drop(inner);
        tokio::fs::create_dir_all(dir).await?;
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| UpdateError::internal(format!("cache state serialize failed: {e}")))?;
        tokio::fs::write(dir.join("state.json"), json).await?;
        Ok(())
    }

    /// Re-populate the index from the on-disk metadata cache.
    ///
    /// Called at startup so matching works before the first refresh; a
    /// missing or partial cache is not an error.
    pub async fn load_cached(&self) -> Result<()> {
        let Some(ref dir) = self.cache_dir else {
            return Ok(());
        };
        let state_path = dir.join("state.json");
        if !tokio::fs::try_exists(&state_path).await.unwrap_or(false) {
            return Ok(());
        }
        let state: CacheState = serde_json::from_slice(&tokio::fs::read(&state_path).await?)
            .map_err(|e| UpdateError::invalid_file(format!("corrupt cache state: {e}")))?;

        let mut inner = self.inner.write().await;
        for remote_state in inner.iter_mut() {
            let id = remote_state.remote.id.clone();
            let Some(&fetched_at) = state.fetched_at.get(&id) else {
                continue;
            };
            let path = dir.join(format!("{id}.xml"));
            match tokio::fs::read(&path).await {
                Ok(bytes) => match ComponentDocument::parse_xml(&bytes) {
                    Ok(doc) => {
                        remote_state.components = doc.components;
                        remote_state.fetched_at = Some(fetched_at);
                        debug!(remote = %id, components = remote_state.components.len(), "loaded cached metadata");
                    }
                    Err(e) => warn!(remote = %id, error = %e, "discarding corrupt cached metadata"),
                },
                Err(e) => warn!(remote = %id, error = %e, "cached metadata unreadable"),
            }
        }
        Ok(())
    }
}

impl Default for RemoteSet {
    fn default() -> Self {
        Self::new()
    }
}

fn age_of(at: chrono::DateTime<chrono::Utc>) -> Duration {
    (chrono::Utc::now() - at).to_std().unwrap_or(Duration::ZERO)
}

fn verify_metadata(
    remote: &Remote,
    signature_bytes: &[u8],
    metadata_bytes: &[u8],
    trust_store: &TrustStore,
) -> Result<()> {
    let bundle = SignatureBundle::parse_json(signature_bytes)?;
    for item in &bundle.items {
        for blob in &item.blobs {
            if !remote.key_ids.is_empty() && !remote.key_ids.contains(&blob.key_id) {
                continue;
            }
            let Ok(signature) = ignition_crypto::Signature::from_base64(&blob.data) else {
                continue;
            };
            if trust_store
                .verify(&blob.key_id, metadata_bytes, &signature)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
    Err(UpdateError::signature_invalid(format!(
        "metadata for remote '{}' did not verify against its declared keys",
        remote.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FileFetcher;
    use std::path::Path;
    use ed25519_dalek::{Signer, SigningKey};
    use ignition_cabinet::signature::{SignatureBlob, SignatureItem};
    use ignition_crypto::PublicKey;

    const METADATA: &str = r#"<components origin="unit">
      <component>
        <id>com.vendor.widget.firmware</id>
        <provides><firmware type="flashed">2d47f29b-83a2-4f26-a3e9-367ea01e3e6a</firmware></provides>
        <releases><release version="2.0.0.0"><location>https://x/fw.cab</location></release></releases>
      </component>
    </components>"#;

    fn signed_fixture(dir: &Path, key_id: &str) -> (Remote, TrustStore) {
        let signing = SigningKey::from_bytes(&[8u8; 32]);
        let metadata_path = dir.join("firmware.xml");
        let signature_path = dir.join("firmware.xml.jcat");
        std::fs::write(&metadata_path, METADATA).unwrap_or_default();

        let bundle = SignatureBundle {
            version: 1,
            items: vec![SignatureItem {
                id: "firmware.xml".to_string(),
                blobs: vec![SignatureBlob {
                    kind: "ed25519".to_string(),
                    key_id: key_id.to_string(),
                    data: ignition_crypto::Signature::from_bytes(
                        signing.sign(METADATA.as_bytes()).to_bytes(),
                    )
                    .to_base64(),
                }],
            }],
        };
        std::fs::write(&signature_path, bundle.to_json().unwrap_or_default())
            .unwrap_or_default();

        let remote = Remote::download(
            "unit",
            &metadata_path.display().to_string(),
            &signature_path.display().to_string(),
        )
        .with_key_ids(&[key_id]);

        let mut store = TrustStore::in_memory();
        let _ = store.add_key(
            PublicKey::from_bytes(signing.verifying_key().to_bytes(), key_id),
            None,
        );
        (remote, store)
    }

    #[tokio::test]
    async fn test_refresh_and_match() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (remote, store) = signed_fixture(dir.path(), "vendor");

        let set = RemoteSet::new();
        set.add_remote(remote).await;

        let outcome = set.refresh("unit", &FileFetcher, &store, false).await?;
        assert!(outcome.refreshed);
        assert_eq!(outcome.components, 1);

        let guids = vec!["2d47f29b-83a2-4f26-a3e9-367ea01e3e6a".to_string()];
        let found = set.components_for_guids(&guids).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].remote_id, "unit");

        // within TTL the second refresh is a no-op
        let outcome = set.refresh("unit", &FileFetcher, &store, false).await?;
        assert!(!outcome.refreshed);
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_rejects_bad_signature() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (remote, _) = signed_fixture(dir.path(), "vendor");

        let set = RemoteSet::new();
        set.add_remote(remote).await;

        // trust store without the vendor key
        let empty = TrustStore::in_memory();
        let err = set.refresh("unit", &FileFetcher, &empty, true).await;
        assert!(err.is_err_and(|e| e.kind() == ignition_errors::ErrorKind::SignatureInvalid));
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_remote_never_matches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (remote, store) = signed_fixture(dir.path(), "vendor");

        let set = RemoteSet::new();
        set.add_remote(remote).await;
        set.refresh("unit", &FileFetcher, &store, true).await?;
        set.set_enabled("unit", false).await?;

        let guids = vec!["2d47f29b-83a2-4f26-a3e9-367ea01e3e6a".to_string()];
        assert!(set.components_for_guids(&guids).await.is_empty());
        assert!(set.refresh("unit", &FileFetcher, &store, true).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_local_directory_scan() -> Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("one.cab"), b"x").await?;
        tokio::fs::write(dir.path().join("two.CAB"), b"x").await?;
        tokio::fs::write(dir.path().join("ignored.txt"), b"x").await?;

        let set = RemoteSet::new();
        set.add_remote(Remote::local_directory(
            "localdir",
            &dir.path().display().to_string(),
        ))
        .await;
        let store = TrustStore::in_memory();
        set.refresh("localdir", &FileFetcher, &store, true).await?;

        let cabs = set.local_cabinets().await;
        assert_eq!(cabs.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_survives_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = dir.path().join("cache");
        let (remote, store) = signed_fixture(dir.path(), "vendor");

        {
            let set = RemoteSet::with_cache_dir(cache.clone());
            set.add_remote(remote.clone()).await;
            set.refresh("unit", &FileFetcher, &store, true).await?;
        }

        let set = RemoteSet::with_cache_dir(cache);
        set.add_remote(remote).await;
        set.load_cached().await?;

        let guids = vec!["2d47f29b-83a2-4f26-a3e9-367ea01e3e6a".to_string()];
        assert_eq!(set.components_for_guids(&guids).await.len(), 1);
        assert!(!set.refresh_needed("unit").await?);
        Ok(())
    }
}
