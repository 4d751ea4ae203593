//! The emulated device family.
//!
//! A plugin backed by no hardware at all, compiled in for two reasons: the
//! `TestDevices` config key registers a virtual updatable device so the
//! whole stack can be exercised on machines with nothing flashable, and
//! the integration suites script it to reproduce replug windows, reset
//! races and mid-composite failures that are hard to catch on real
//! hardware.
//!
//! Payloads are plain text; a leading `VER=<version>;` names the version
//! the device reports after a successful reload.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ignition_crypto::{Checksum, ChecksumKind};
use ignition_device::{Device, DeviceFlags, DeviceId, DeviceRegistry};
use ignition_errors::{ErrorKind, Result, UpdateError};
use ignition_plugin::{DeviceHandler, FirmwareTree, InstallFlags, poll_status};
use ignition_progress::Progress;
use ignition_version::VersionFormat;
use parking_lot::Mutex;
use tracing::debug;

/// How the emulated transport answers per scripted device.
#[derive(Debug, Clone, Default)]
pub struct EmulatedBehavior {
    /// `detach` opens a replug window
    pub detach_replug: bool,
    /// the replugged bootloader device actually re-appears
    pub replug_reappears: bool,
    /// `detach` resets the device before the transaction completes: the
    /// replug window opens and the call reports an internal error
    pub detach_reset_race: bool,
    /// `write_firmware` fails with this kind
    pub write_failure: Option<ErrorKind>,
    /// status reads after the transfer report busy this many times before
    /// going idle; more than the retry budget and the write times out
    pub busy_polls: u32,
    /// the written firmware stages and needs a separate activation
    pub needs_activation: bool,
    /// the written firmware needs a system reboot
    pub needs_reboot: bool,
}

#[derive(Debug, Clone, Default)]
struct StagedWrite {
    version: Option<String>,
    checksum: Option<Checksum>,
}

/// The emulated device-family plugin.
#[derive(Default)]
pub struct EmulatedPlugin {
    behaviors: Mutex<HashMap<DeviceId, EmulatedBehavior>>,
    staged: Mutex<HashMap<DeviceId, StagedWrite>>,
    composite_prepares: std::sync::atomic::AtomicUsize,
    composite_cleanups: std::sync::atomic::AtomicUsize,
}

/// The plugin name recorded on emulated devices.
pub const PLUGIN_NAME: &str = "emulated";

impl EmulatedPlugin {
    /// Create the plugin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior of one device.
    pub fn set_behavior(&self, id: &DeviceId, behavior: EmulatedBehavior) {
        self.behaviors.lock().insert(id.clone(), behavior);
    }

    /// How many composite prepare brackets ran.
    pub fn composite_prepares(&self) -> usize {
        self.composite_prepares
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// How many composite cleanup brackets ran.
    pub fn composite_cleanups(&self) -> usize {
        self.composite_cleanups
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    fn behavior(&self, id: &DeviceId) -> EmulatedBehavior {
        self.behaviors.lock().get(id).cloned().unwrap_or_default()
    }

    /// A virtual updatable device in runtime mode.
    pub fn make_device(physical: &str, name: &str, version: &str) -> Device {
        Device::new(PLUGIN_NAME, physical, "runtime", name)
            .with_version(version, VersionFormat::Quad)
            .with_instance_id(&format!("EMULATED\\{physical}"))
            .with_flags(DeviceFlags::UPDATABLE | DeviceFlags::EMULATED | DeviceFlags::CAN_VERIFY)
    }

    fn parse_payload_version(payload: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(payload).ok()?;
        let rest = text.strip_prefix("VER=")?;
        let end = rest.find(';')?;
        Some(rest[..end].to_string())
    }

    fn spawn_replug(registry: &DeviceRegistry, device: Device) {
        let registry = registry.clone();
        let id = device.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if registry.remove(&id).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mode = if device.has_flag(DeviceFlags::IS_BOOTLOADER) {
                    "runtime"
                } else {
                    "bootloader"
                };
                let physical = format!("emu-replug:{}", device.id);
                let mut replug = Device::new(PLUGIN_NAME, &physical, mode, &device.name);
                for guid in &device.guids {
                    replug.add_guid(guid);
                }
                if mode == "bootloader" {
                    replug.add_flag(DeviceFlags::IS_BOOTLOADER);
                }
                registry.add(replug).await;
            }
        });
    }
}

#[async_trait]
impl DeviceHandler for EmulatedPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn detach(
        &self,
        registry: &DeviceRegistry,
        id: &DeviceId,
        _progress: &Progress,
    ) -> Result<()> {
        let behavior = self.behavior(id);
        if !behavior.detach_replug && !behavior.detach_reset_race {
            registry
                .update(id, |d| d.add_flag(DeviceFlags::IS_BOOTLOADER))
                .await?;
            return Ok(());
        }

        let device = registry
            .update(id, |d| d.add_flag(DeviceFlags::WAIT_FOR_REPLUG))
            .await?;
        if behavior.replug_reappears {
            Self::spawn_replug(registry, device);
        }
        if behavior.detach_reset_race {
            return Err(UpdateError::internal(
                "device reset before completing the transaction",
            ));
        }
        Ok(())
    }

    async fn write_firmware(
        &self,
        registry: &DeviceRegistry,
        id: &DeviceId,
        firmware: &FirmwareTree,
        progress: &Progress,
        _flags: InstallFlags,
    ) -> Result<()> {
        let behavior = self.behavior(id);
        if let Some(kind) = behavior.write_failure {
            return Err(UpdateError::new(kind, "emulated transfer fault"));
        }

        let total = firmware.data.len().max(1) as u64;
        let chunk = 64usize;
        let mut written = 0u64;
        for block in firmware.data.chunks(chunk) {
            written += block.len() as u64;
            progress.set_fraction(written, total);
            tokio::task::yield_now().await;
        }

        // the transfer leaves the controller flushing; poll its status
        // register until it reports idle again
        let mut busy = behavior.busy_polls;
        poll_status(self, "idle status", || {
            let ready = busy == 0;
            busy = busy.saturating_sub(1);
            std::future::ready(Ok(ready))
        })
        .await
        .map_err(|e| e.prefixed("read status"))?;

        self.staged.lock().insert(
            id.clone(),
            StagedWrite {
                version: Self::parse_payload_version(&firmware.data),
                checksum: Some(Checksum::compute(ChecksumKind::Sha256, &firmware.data)),
            },
        );

        if behavior.needs_activation {
            registry
                .update(id, |d| d.add_flag(DeviceFlags::NEEDS_ACTIVATION))
                .await?;
        }
        if behavior.needs_reboot {
            registry
                .update(id, |d| d.add_flag(DeviceFlags::NEEDS_REBOOT))
                .await?;
        }
        debug!(device = %id, bytes = firmware.data.len(), "emulated write complete");
        Ok(())
    }

    async fn attach(
        &self,
        registry: &DeviceRegistry,
        id: &DeviceId,
        _progress: &Progress,
    ) -> Result<()> {
        if registry.contains(id).await {
            registry
                .update(id, |d| d.remove_flag(DeviceFlags::IS_BOOTLOADER))
                .await?;
        }
        Ok(())
    }

    async fn reload(&self, registry: &DeviceRegistry, id: &DeviceId) -> Result<()> {
        let staged = self.staged.lock().get(id).cloned().unwrap_or_default();
        let needs_activation = registry
            .get(id)
            .await
            .is_some_and(|d| d.has_flag(DeviceFlags::NEEDS_ACTIVATION));
        if let (false, Some(version)) = (needs_activation, staged.version) {
            registry
                .update(id, |d| d.version = Some(version.clone()))
                .await?;
        }
        Ok(())
    }

    async fn activate(
        &self,
        registry: &DeviceRegistry,
        id: &DeviceId,
        _progress: &Progress,
    ) -> Result<()> {
        let staged = self.staged.lock().get(id).cloned().unwrap_or_default();
        let Some(version) = staged.version else {
            return Err(UpdateError::nothing_to_do(format!(
                "device {id} has nothing staged"
            )));
        };
        registry
            .update(id, |d| {
                d.version = Some(version.clone());
                d.remove_flag(DeviceFlags::NEEDS_ACTIVATION);
                d.problems &= !ignition_device::DeviceProblems::UPDATE_PENDING;
            })
            .await?;
        Ok(())
    }

    fn device_to_string(&self, device: &Device, out: &mut String) {
        use std::fmt::Write as _;

        let staged = self.staged.lock().get(&device.id).cloned().unwrap_or_default();
        if let Some(version) = staged.version {
            let _ = writeln!(out, "  StagedVersion: {version}");
        }
        if let Some(checksum) = staged.checksum {
            let _ = writeln!(out, "  StagedChecksum: {checksum}");
        }
        if let Some(behavior) = self.behaviors.lock().get(&device.id) {
            let _ = writeln!(out, "  ScriptedBehavior: {behavior:?}");
        }
    }

    // the virtual controller answers instantly; a long retry cadence
    // would only slow the suites down
    fn retry_count(&self) -> u32 {
        8
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(1)
    }

    async fn composite_prepare(&self, _registry: &DeviceRegistry, _ids: &[DeviceId]) -> Result<()> {
        self.composite_prepares
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn composite_cleanup(&self, _registry: &DeviceRegistry, _ids: &[DeviceId]) -> Result<()> {
        self.composite_cleanups
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn verify(&self, _registry: &DeviceRegistry, id: &DeviceId) -> Result<Vec<Checksum>> {
        let staged = self.staged.lock().get(id).cloned().unwrap_or_default();
        staged
            .checksum
            .map(|c| vec![c])
            .ok_or_else(|| UpdateError::not_supported(format!("device {id} has nothing to hash")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_version_parse() {
        assert_eq!(
            EmulatedPlugin::parse_payload_version(b"VER=1.2.3.5;payload"),
            Some("1.2.3.5".to_string())
        );
        assert_eq!(EmulatedPlugin::parse_payload_version(b"no version"), None);
    }

    #[tokio::test]
    async fn test_detach_and_attach_modes() -> Result<()> {
        let plugin = EmulatedPlugin::new();
        let registry = DeviceRegistry::new();
        let device = EmulatedPlugin::make_device("emu:0", "Widget", "1.0.0.0");
        let id = registry.add(device).await;

        let progress = Progress::new();
        plugin.detach(&registry, &id, &progress).await?;
        assert!(
            registry
                .get(&id)
                .await
                .is_some_and(|d| d.has_flag(DeviceFlags::IS_BOOTLOADER))
        );
        plugin.attach(&registry, &id, &progress).await?;
        assert!(
            registry
                .get(&id)
                .await
                .is_some_and(|d| !d.has_flag(DeviceFlags::IS_BOOTLOADER))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_write_polls_status_until_idle() -> Result<()> {
        let plugin = EmulatedPlugin::new();
        let registry = DeviceRegistry::new();
        let id = registry
            .add(EmulatedPlugin::make_device("emu:0", "Widget", "1.0.0.0"))
            .await;
        plugin.set_behavior(
            &id,
            EmulatedBehavior {
                busy_polls: 3,
                ..EmulatedBehavior::default()
            },
        );

        let firmware = FirmwareTree::raw(b"VER=2.0.0.0;data");
        let progress = Progress::new();
        plugin
            .write_firmware(&registry, &id, &firmware, &progress, InstallFlags::default())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_write_times_out_when_status_stays_busy() -> Result<()> {
        let plugin = EmulatedPlugin::new();
        let registry = DeviceRegistry::new();
        let id = registry
            .add(EmulatedPlugin::make_device("emu:0", "Widget", "1.0.0.0"))
            .await;
        plugin.set_behavior(
            &id,
            EmulatedBehavior {
                busy_polls: plugin.retry_count() + 1,
                ..EmulatedBehavior::default()
            },
        );

        let firmware = FirmwareTree::raw(b"VER=2.0.0.0;data");
        let progress = Progress::new();
        let err = plugin
            .write_firmware(&registry, &id, &firmware, &progress, InstallFlags::default())
            .await;
        assert!(err.is_err_and(|e| e.kind() == ErrorKind::Timeout));
        Ok(())
    }

    #[tokio::test]
    async fn test_device_to_string_appends_staged_fields() -> Result<()> {
        let plugin = EmulatedPlugin::new();
        let registry = DeviceRegistry::new();
        let id = registry
            .add(EmulatedPlugin::make_device("emu:0", "Widget", "1.0.0.0"))
            .await;

        let firmware = FirmwareTree::raw(b"VER=2.0.0.0;data");
        let progress = Progress::new();
        plugin
            .write_firmware(&registry, &id, &firmware, &progress, InstallFlags::default())
            .await?;

        let device = registry
            .get(&id)
            .await
            .ok_or_else(|| UpdateError::internal("device gone"))?;
        let mut out = String::new();
        plugin.device_to_string(&device, &mut out);
        assert!(out.contains("StagedVersion: 2.0.0.0"));
        assert!(out.contains("StagedChecksum: sha256:"));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_stages_version_and_checksum() -> Result<()> {
        let plugin = EmulatedPlugin::new();
        let registry = DeviceRegistry::new();
        let id = registry
            .add(EmulatedPlugin::make_device("emu:0", "Widget", "1.0.0.0"))
            .await;

        let firmware = FirmwareTree::raw(b"VER=2.0.0.0;data");
        let progress = Progress::new();
        plugin
            .write_firmware(&registry, &id, &firmware, &progress, InstallFlags::default())
            .await?;
        plugin.reload(&registry, &id).await?;

        let device = registry.get(&id).await;
        assert_eq!(
            device.and_then(|d| d.version),
            Some("2.0.0.0".to_string())
        );
        assert_eq!(plugin.verify(&registry, &id).await?.len(), 1);
        Ok(())
    }
}
