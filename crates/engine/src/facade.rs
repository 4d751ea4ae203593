//! The engine facade.
//!
//! One owned value constructed at startup, passed explicitly to whatever
//! embeds it; tests construct their own. Owns the device registry, plugin
//! set, remote set, history store and trust store, and exposes the coarse
//! verbs the CLI and daemon surface. Installs on unrelated composite units
//! may interleave; installs on the same unit serialize on a per-composite
//! lock, and the device/plugin pair is frozen for the duration.

use std::collections::HashMap;
use std::sync::Arc;

use ignition_cabinet::{Cabinet, ParseFlags, ParseLimits, TrustLevel};
use ignition_crypto::{PublicKey, TrustStore};
use ignition_device::{Device, DeviceFlags, DeviceId, DeviceRegistry};
use ignition_errors::{ErrorKind, Result, UpdateError};
use ignition_history::{HistoryEntry, HistoryStore, UpdateState};
use ignition_plugin::{DeviceHandler, InstallFlags, PluginRegistry};
use ignition_progress::Progress;
use ignition_remote::{
    FileFetcher, IndexedComponent, MetadataFetcher, Remote, RemoteSet, ReportPayload,
};
use ignition_version::Version;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::emulated::EmulatedPlugin;
use crate::lock::ProcessLock;
use crate::orchestrator::{InstallReport, Orchestrator};
use crate::requirements::ClientCapabilities;
use crate::resolver::{ResolvedInstall, resolve_cabinet};

/// An available update for one device.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    /// Remote offering the release
    pub remote_id: String,
    /// Component id
    pub component_id: String,
    /// The release itself
    pub release: ignition_cabinet::metadata::Release,
}

/// What a refresh pass did.
#[derive(Debug, Clone, Default)]
pub struct RefreshSummary {
    /// Remotes actually fetched
    pub refreshed: usize,
    /// Remotes skipped because their cache was fresh
    pub skipped: usize,
    /// Soft warning when some metadata is very stale
    pub stale_warning: Option<String>,
}

/// A coarse security posture summary.
#[derive(Debug, Clone, Default)]
pub struct SecuritySummary {
    /// Devices known
    pub devices_total: usize,
    /// Devices accepting updates
    pub devices_updatable: usize,
    /// Enabled remotes
    pub remotes_enabled: usize,
    /// Keys in the trust store
    pub trusted_keys: usize,
    /// Age of the most stale metadata, days
    pub metadata_age_days: Option<u64>,
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    plugins: PluginRegistry,
    fetcher: Arc<dyn MetadataFetcher>,
    client: ClientCapabilities,
    process_lock: bool,
}

impl EngineBuilder {
    /// Start building with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            plugins: PluginRegistry::new(),
            fetcher: Arc::new(FileFetcher),
            client: ClientCapabilities::standard(),
            process_lock: true,
        }
    }

    /// Register a device-family plugin.
    pub fn register_plugin(mut self, handler: Arc<dyn DeviceHandler>) -> Self {
        self.plugins.register(handler);
        self
    }

    /// Use a different metadata fetcher (the daemon wires HTTP in here).
    pub fn with_fetcher(mut self, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Override the advertised client capabilities.
    pub fn with_client(mut self, client: ClientCapabilities) -> Self {
        self.client = client;
        self
    }

    /// Skip the exclusive process lock; test instances share state dirs.
    pub fn without_process_lock(mut self) -> Self {
        self.process_lock = false;
        self
    }

    /// Construct the engine: acquire the lock, open the stores, load the
    /// cached metadata, and register the emulated device when configured.
    pub async fn build(mut self) -> Result<Engine> {
        let lock = if self.process_lock {
            Some(ProcessLock::acquire(&self.config.lock_path())?)
        } else {
            None
        };

        let history = Arc::new(HistoryStore::open(self.config.history_path()).await?);
        let trust_store = TrustStore::open(self.config.trust_store_path())
            .map_err(|e| UpdateError::invalid_file(format!("trust store: {e}")))?;
        let remotes = Arc::new(RemoteSet::with_cache_dir(self.config.metadata_cache_dir()));

        let registry = DeviceRegistry::new();
        let emulated = if self.config.test_devices {
            let plugin = Arc::new(EmulatedPlugin::new());
            self.plugins.register(plugin.clone());
            let device = EmulatedPlugin::make_device("emu:test:0", "Test Widget", "1.2.3.4");
            registry.add(device).await;
            Some(plugin)
        } else {
            None
        };

        let plugins = Arc::new(self.plugins);
        let orchestrator = Orchestrator::new(registry.clone(), plugins.clone(), history.clone());

        let engine = Engine {
            config: self.config,
            registry,
            plugins,
            remotes,
            history,
            trust_store: RwLock::new(trust_store),
            fetcher: self.fetcher,
            client: self.client,
            orchestrator,
            composite_locks: Mutex::new(HashMap::new()),
            emulated,
            _lock: lock,
        };
        engine.load_remote_definitions().await?;
        engine.remotes.load_cached().await?;
        info!(plugins = engine.plugins.len(), "engine ready");
        Ok(engine)
    }
}

/// The process-wide engine value.
pub struct Engine {
    config: EngineConfig,
    registry: DeviceRegistry,
    plugins: Arc<PluginRegistry>,
    remotes: Arc<RemoteSet>,
    history: Arc<HistoryStore>,
    trust_store: RwLock<TrustStore>,
    fetcher: Arc<dyn MetadataFetcher>,
    client: ClientCapabilities,
    orchestrator: Orchestrator,
    composite_locks: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    emulated: Option<Arc<EmulatedPlugin>>,
    _lock: Option<ProcessLock>,
}

impl Engine {
    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The device registry handle.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The emulated plugin, when `TestDevices` is configured.
    pub fn emulated(&self) -> Option<&Arc<EmulatedPlugin>> {
        self.emulated.as_ref()
    }

    /// All known devices, priority order.
    pub async fn devices(&self) -> Vec<Device> {
        self.registry.all().await
    }

    /// A multi-line debug dump of one device, with whatever extra fields
    /// its plugin wants to append.
    pub fn describe_device(&self, device: &Device) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "{} [{}]", device.name, device.id);
        let _ = writeln!(out, "  Plugin: {}", device.plugin);
        let _ = writeln!(
            out,
            "  Version: {} ({})",
            device.version.as_deref().unwrap_or("?"),
            device.version_format
        );
        if let Some(ref bootloader) = device.version_bootloader {
            let _ = writeln!(out, "  VersionBootloader: {bootloader}");
        }
        if let Some(ref branch) = device.branch {
            let _ = writeln!(out, "  Branch: {branch}");
        }
        let _ = writeln!(out, "  CompositeId: {}", device.composite_id);
        for guid in &device.guids {
            let _ = writeln!(out, "  Guid: {guid}");
        }
        let _ = writeln!(out, "  Flags: {:?}", device.flags);
        if !device.problems.is_empty() {
            let _ = writeln!(out, "  Problems: {:?}", device.problems);
        }
        if let Ok(handler) = self.plugins.handler_for(device) {
            handler.device_to_string(device, &mut out);
        }
        out
    }

    /// Add a device and run its plugin's probe and setup.
    pub async fn add_device(&self, device: Device) -> Result<DeviceId> {
        let handler = self.plugins.handler_for(&device)?;
        let id = self.registry.add(device).await;
        handler
            .probe(&self.registry, &id)
            .await
            .map_err(|e| e.prefixed("probe"))?;
        handler
            .setup(&self.registry, &id)
            .await
            .map_err(|e| e.prefixed("setup"))?;
        Ok(id)
    }

    /// Trust a vendor key.
    pub async fn add_trusted_key(&self, key: PublicKey, reason: Option<String>) -> Result<()> {
        self.trust_store
            .write()
            .await
            .add_key(key, reason)
            .map_err(|e| UpdateError::internal(format!("trust store: {e}")))
    }

    /// Load the persisted remote definitions, when present.
    async fn load_remote_definitions(&self) -> Result<()> {
        let path = self.config.state_dir.join("remotes.json");
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        let remotes: Vec<Remote> = serde_json::from_slice(&tokio::fs::read(&path).await?)
            .map_err(|e| UpdateError::invalid_file(format!("bad remotes.json: {e}")))?;
        for remote in remotes {
            self.add_remote(remote).await;
        }
        Ok(())
    }

    /// Add a remote, applying any persisted per-remote overrides.
    pub async fn add_remote(&self, mut remote: Remote) {
        if let Some(overrides) = self.config.remotes.get(&remote.id) {
            if let Some(enabled) = overrides.enabled {
                remote.enabled = enabled;
            }
            if let Some(ref uri) = overrides.report_uri {
                remote.report_uri = Some(uri.clone());
            }
            if let Some(automatic) = overrides.automatic_reports {
                remote.automatic_reports = automatic;
            }
        }
        self.remotes.add_remote(remote).await;
    }

    /// The configured remotes.
    pub async fn remotes(&self) -> Vec<Remote> {
        self.remotes.remotes().await
    }

    /// Enable or disable a remote, persisting the choice.
    pub async fn set_remote_enabled(&self, remote_id: &str, enabled: bool) -> Result<()> {
        self.remotes.set_enabled(remote_id, enabled).await?;
        let mut config = self.config.clone();
        config.remotes.entry(remote_id.to_string()).or_default().enabled = Some(enabled);
        config.save()?;
        Ok(())
    }

    /// Resolve a device selector: a device id, a unique id prefix, a
    /// hardware-id, or `*` when exactly one device is updatable.
    pub async fn select_device(&self, selector: &str) -> Result<Device> {
        let devices = self.registry.all().await;

        if selector == "*" {
            let mut updatable = devices.into_iter().filter(Device::is_updatable);
            return match (updatable.next(), updatable.next()) {
                (Some(device), None) => Ok(device),
                (None, _) => Err(UpdateError::not_found("no updatable devices")),
                (Some(_), Some(_)) => Err(UpdateError::invalid_args(
                    "more than one updatable device; pass a device id",
                )),
            };
        }

        let matches: Vec<Device> = devices
            .into_iter()
            .filter(|d| {
                d.id.as_str() == selector
                    || (selector.len() >= 8 && d.id.as_str().starts_with(selector))
                    || d.has_guid(selector)
            })
            .collect();
        match matches.len() {
            0 => Err(UpdateError::not_found(format!(
                "no device matches '{selector}'"
            ))),
            1 => Ok(matches.into_iter().next().ok_or_else(|| {
                UpdateError::internal("device vanished while selecting")
            })?),
            _ => Err(UpdateError::invalid_args(format!(
                "'{selector}' is ambiguous between {} devices",
                matches.len()
            ))),
        }
    }

    async fn composite_lock(&self, composite_id: &DeviceId) -> Arc<Mutex<()>> {
        let mut locks = self.composite_locks.lock().await;
        locks
            .entry(composite_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Install a cabinet onto the selected device's composite unit.
    ///
    /// Holds the per-composite lock for the duration, so concurrent
    /// installs on unrelated units interleave while a second install on
    /// the same unit waits its turn.
    pub async fn install(
        &self,
        selector: &str,
        cabinet_bytes: &[u8],
        install_flags: InstallFlags,
        parse_flags: ParseFlags,
        progress: &Progress,
        cancel: Option<mpsc::Receiver<()>>,
    ) -> Result<InstallReport> {
        let device = self.select_device(selector).await?;
        let lock = self.composite_lock(&device.composite_id).await;
        let _guard = lock.lock().await;

        let limits = ParseLimits {
            max_archive_size: self.config.archive_size_max as usize,
            ..ParseLimits::default()
        };
        let cabinet = Cabinet::parse(cabinet_bytes, &limits)?;
        let trust = cabinet.verify(&*self.trust_store.read().await);
        debug!(trust = ?trust, "cabinet trust level");

        if device.has_flag(DeviceFlags::SIGNED_PAYLOAD)
            && !trust.payload_signed()
            && !install_flags.contains(InstallFlags::FORCE)
        {
            return Err(UpdateError::signature_invalid(format!(
                "device {} only accepts signed payloads and the cabinet is {trust:?}",
                device.id
            )));
        }

        // the device set is frozen here: the snapshot taken under the
        // composite lock is what the orchestrator drives
        let siblings = self.registry.composite_set(&device.composite_id).await;
        let resolved = resolve_cabinet(
            &cabinet,
            &siblings,
            &self.client,
            install_flags,
            parse_flags,
            None,
        )?;

        self.orchestrator
            .install(
                &cabinet,
                &resolved,
                install_flags,
                parse_flags,
                progress,
                cancel,
            )
            .await
    }

    /// Every release the metadata index offers for the selected device,
    /// newest first, regardless of version direction.
    pub async fn releases_for(&self, selector: &str) -> Result<Vec<UpdateCandidate>> {
        let device = self.select_device(selector).await?;
        if !device.is_updatable() {
            return Err(UpdateError::not_supported(format!(
                "device {} is not updatable",
                device.id
            )));
        }
        let components = self.remotes.components_for_guids(&device.guids).await;

        let mut candidates = Vec::new();
        for IndexedComponent {
            remote_id,
            component,
            ..
        } in components
        {
            for release in &component.releases {
                candidates.push(UpdateCandidate {
                    remote_id: remote_id.clone(),
                    component_id: component.id.clone(),
                    release: release.clone(),
                });
            }
        }
        candidates.sort_by(|a, b| {
            Version::try_compare(&b.release.version, &a.release.version, device.version_format)
                .unwrap_or_else(|| b.release.version.cmp(&a.release.version))
        });
        Ok(candidates)
    }

    /// Updates available for the selected device from the metadata index,
    /// newest first. Upgrades only; downgrades are an explicit install.
    pub async fn updates_for(&self, selector: &str) -> Result<Vec<UpdateCandidate>> {
        let device = self.select_device(selector).await?;
        let candidates = self.releases_for(selector).await?;
        Ok(candidates
            .into_iter()
            .filter(|c| match device.version {
                Some(ref current) => {
                    Version::try_compare(&c.release.version, current, device.version_format)
                        .is_some_and(|o| o == std::cmp::Ordering::Greater)
                }
                None => true,
            })
            .collect())
    }

    /// Commit a staged update, resuming from its history row.
    pub async fn activate(&self, selector: &str, progress: &Progress) -> Result<()> {
        let device = self.select_device(selector).await?;
        let resumable = self.history.resumable().await;
        let row = resumable.iter().find(|e| e.device_id == device.id);

        if row.is_none() && !device.has_flag(DeviceFlags::NEEDS_ACTIVATION) {
            return Err(UpdateError::nothing_to_do(format!(
                "device {} has no update pending activation",
                device.id
            )));
        }

        let handler = self.plugins.handler_for(&device)?;
        handler
            .activate(&self.registry, &device.id, progress)
            .await
            .map_err(|e| e.prefixed("activate"))?;
        self.registry
            .update(&device.id, |d| {
                d.remove_flag(DeviceFlags::NEEDS_ACTIVATION);
                d.problems &= !ignition_device::DeviceProblems::UPDATE_PENDING;
            })
            .await?;

        if let Some(row) = row {
            self.history
                .settle(row.attempt_id, UpdateState::Success, None)
                .await?;
        }
        info!(device = %device.id, "activation complete");
        Ok(())
    }

    /// Hash on-device firmware and compare against the stored snapshot,
    /// falling back to release checksums from the metadata index.
    pub async fn verify(&self, selector: &str) -> Result<()> {
        let device = self.select_device(selector).await?;
        if !device.has_flag(DeviceFlags::CAN_VERIFY) {
            return Err(UpdateError::not_supported(format!(
                "device {} cannot self-verify",
                device.id
            )));
        }
        let handler = self.plugins.handler_for(&device)?;
        let actual = handler
            .verify(&self.registry, &device.id)
            .await
            .map_err(|e| e.prefixed("verify"))?;

        let expected = match self.load_verify_snapshot(&device.id).await? {
            Some(snapshot) => snapshot,
            None => {
                let Some(ref version) = device.version else {
                    return Err(UpdateError::not_supported(format!(
                        "device {} has no version to verify against",
                        device.id
                    )));
                };
                let components = self.remotes.components_for_guids(&device.guids).await;
                let checksums: Vec<_> = components
                    .iter()
                    .flat_map(|c| &c.component.releases)
                    .filter(|r| &r.version == version)
                    .flat_map(|r| r.checksums.clone())
                    .collect();
                if checksums.is_empty() {
                    return Err(UpdateError::not_found(format!(
                        "no stored or published checksums for version {version}"
                    )));
                }
                checksums
            }
        };

        if actual.iter().any(|a| expected.contains(a)) {
            Ok(())
        } else {
            Err(UpdateError::signature_invalid(format!(
                "device {} firmware does not match any expected checksum",
                device.id
            )))
        }
    }

    /// Snapshot the device's current on-device checksums for later
    /// [`Engine::verify`] calls.
    pub async fn verify_update(&self, selector: &str) -> Result<()> {
        let device = self.select_device(selector).await?;
        let handler = self.plugins.handler_for(&device)?;
        let checksums = handler
            .verify(&self.registry, &device.id)
            .await
            .map_err(|e| e.prefixed("verify"))?;
        self.store_verify_snapshot(&device.id, &checksums).await?;
        info!(device = %device.id, "verification snapshot stored");
        Ok(())
    }

    fn verify_snapshot_path(&self) -> std::path::PathBuf {
        self.config.state_dir.join("verify.json")
    }

    async fn load_verify_snapshot(
        &self,
        id: &DeviceId,
    ) -> Result<Option<Vec<ignition_crypto::Checksum>>> {
        let path = self.verify_snapshot_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await?;
        let all: HashMap<String, Vec<ignition_crypto::Checksum>> = serde_json::from_slice(&bytes)
            .map_err(|e| UpdateError::invalid_file(format!("corrupt verify store: {e}")))?;
        Ok(all.get(id.as_str()).cloned())
    }

    async fn store_verify_snapshot(
        &self,
        id: &DeviceId,
        checksums: &[ignition_crypto::Checksum],
    ) -> Result<()> {
        let path = self.verify_snapshot_path();
        let mut all: HashMap<String, Vec<ignition_crypto::Checksum>> =
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                serde_json::from_slice(&tokio::fs::read(&path).await?)
                    .map_err(|e| UpdateError::invalid_file(format!("corrupt verify store: {e}")))?
            } else {
                HashMap::new()
            };
        all.insert(id.as_str().to_string(), checksums.to_vec());
        let json = serde_json::to_vec_pretty(&all)
            .map_err(|e| UpdateError::internal(format!("verify store serialize failed: {e}")))?;
        tokio::fs::create_dir_all(&self.config.state_dir).await?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    /// Refresh enabled remotes whose cache has outlived its TTL.
    pub async fn refresh(&self, force: bool) -> Result<RefreshSummary> {
        let remotes = self.remotes.remotes().await;
        let mut summary = RefreshSummary::default();
        let mut first_error: Option<UpdateError> = None;
        let mut attempted = 0usize;

        for remote in remotes.iter().filter(|r| r.enabled) {
            attempted += 1;
            let trust = self.trust_store.read().await;
            let outcome = self
                .remotes
                .refresh(&remote.id, self.fetcher.as_ref(), &trust, force)
                .await;
            drop(trust);
            match outcome {
                Ok(outcome) => {
                    if outcome.refreshed {
                        summary.refreshed += 1;
                    } else {
                        summary.skipped += 1;
                    }
                    if summary.stale_warning.is_none() {
                        summary.stale_warning = outcome.stale_warning;
                    }
                }
                Err(e) => {
                    warn!(remote = %remote.id, error = %e, "refresh failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if attempted == 0 {
            return Err(UpdateError::nothing_to_do("no enabled remotes"));
        }
        if summary.refreshed == 0 && summary.skipped == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(summary)
    }

    /// Align devices to a best-known-configuration tag using the cabinets
    /// local remotes provide. Downgrades are implied by the tag.
    pub async fn sync(&self, tag: Option<&str>, progress: &Progress) -> Result<InstallReport> {
        let limits = ParseLimits {
            max_archive_size: self.config.archive_size_max as usize,
            ..ParseLimits::default()
        };
        let flags = InstallFlags::ALLOW_OLDER;
        let devices = self.registry.all().await;
        let mut outcomes = Vec::new();
        let mut cancelled = false;

        for (remote_id, path) in self.remotes.local_cabinets().await {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable cabinet");
                    continue;
                }
            };
            let cabinet = match Cabinet::parse(&bytes, &limits) {
                Ok(cabinet) => cabinet,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid cabinet");
                    continue;
                }
            };
            if let Some(tag) = tag {
                let tagged = cabinet
                    .components()
                    .iter()
                    .flat_map(|c| &c.releases)
                    .any(|r| r.tags.iter().any(|t| t == tag));
                if !tagged {
                    continue;
                }
            }

            let resolved: Vec<ResolvedInstall> = match resolve_cabinet(
                &cabinet,
                &devices,
                &self.client,
                flags,
                ParseFlags::default(),
                Some(&remote_id),
            ) {
                Ok(resolved) => resolved,
                Err(e) if e.kind() == ErrorKind::NothingToDo => continue,
                Err(e) if e.kind() == ErrorKind::NotSupported => continue,
                Err(e) => return Err(e),
            };

            let report = self
                .orchestrator
                .install(
                    &cabinet,
                    &resolved,
                    flags,
                    ParseFlags::default(),
                    progress,
                    None,
                )
                .await?;
            cancelled |= report.cancelled;
            outcomes.extend(report.outcomes);
        }

        if outcomes.is_empty() {
            return Err(UpdateError::nothing_to_do(match tag {
                Some(tag) => format!("nothing to sync for tag '{tag}'"),
                None => "nothing to sync".to_string(),
            }));
        }
        Ok(InstallReport {
            outcomes,
            cancelled,
        })
    }

    /// All history rows.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.entries().await
    }

    /// The history store handle.
    pub fn history_store(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Build report payloads for remotes that upload automatically.
    pub async fn pending_reports(&self) -> Vec<(Remote, ReportPayload)> {
        let unreported = self.history.unreported().await;
        let mut reports = Vec::new();
        for remote in self.remotes.remotes().await {
            if !remote.automatic_reports || remote.report_uri.is_none() {
                continue;
            }
            let payload = ReportPayload::build(&remote.id, &unreported);
            if !payload.is_empty() {
                reports.push((remote, payload));
            }
        }
        reports
    }

    /// The coarse security posture.
    pub async fn security_summary(&self) -> SecuritySummary {
        let devices = self.registry.all().await;
        let remotes = self.remotes.remotes().await;
        SecuritySummary {
            devices_total: devices.len(),
            devices_updatable: devices.iter().filter(|d| d.is_updatable()).count(),
            remotes_enabled: remotes.iter().filter(|r| r.enabled).count(),
            trusted_keys: self.trust_store.read().await.len(),
            metadata_age_days: self
                .remotes
                .oldest_age()
                .await
                .map(|age| age.as_secs() / 86_400),
        }
    }

    /// The cabinet trust level against the current trust store.
    pub async fn cabinet_trust(&self, cabinet: &Cabinet) -> TrustLevel {
        cabinet.verify(&*self.trust_store.read().await)
    }
}
