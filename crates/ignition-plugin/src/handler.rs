//! The device-family capability trait.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ignition_cabinet::ParseFlags;
use ignition_crypto::Checksum;
use ignition_device::{Device, DeviceId, DeviceRegistry};
use ignition_errors::{Result, UpdateError};
use ignition_progress::Progress;
use tracing::trace;

use crate::InstallFlags;
use crate::firmware::FirmwareTree;

/// The capability set a device-family plugin may implement.
///
/// The orchestrator calls whichever methods a plugin overrides; the
/// defaults are identity transitions so a family that needs no detach, or
/// no separate reload, simply leaves those out. Only one operation on one
/// device is ever in flight at a time, so implementations need not be
/// reentrant.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// The plugin's stable name, recorded on every device it claims.
    fn name(&self) -> &str;

    /// Populate hardware-ids, version, size budget and flags from the
    /// low-level handle.
    async fn probe(&self, _registry: &DeviceRegistry, _id: &DeviceId) -> Result<()> {
        Ok(())
    }

    /// Read current version, branch and any instance-id components.
    async fn setup(&self, _registry: &DeviceRegistry, _id: &DeviceId) -> Result<()> {
        Ok(())
    }

    /// Normalize a payload stream into the family's firmware layout.
    async fn prepare_firmware(&self, payload: &[u8], _flags: ParseFlags) -> Result<FirmwareTree> {
        Ok(FirmwareTree::raw(payload))
    }

    /// Declare the write-phase step weights on the given progress node.
    fn set_progress(&self, _progress: &Progress) {}

    /// Transition the device into its bootloader or programming mode.
    async fn detach(
        &self,
        _registry: &DeviceRegistry,
        _id: &DeviceId,
        _progress: &Progress,
    ) -> Result<()> {
        Ok(())
    }

    /// Perform the transfer; may flag needs-reboot or needs-activation on
    /// the device.
    async fn write_firmware(
        &self,
        _registry: &DeviceRegistry,
        _id: &DeviceId,
        _firmware: &FirmwareTree,
        _progress: &Progress,
        _flags: InstallFlags,
    ) -> Result<()> {
        Ok(())
    }

    /// Return the device to runtime mode.
    async fn attach(
        &self,
        _registry: &DeviceRegistry,
        _id: &DeviceId,
        _progress: &Progress,
    ) -> Result<()> {
        Ok(())
    }

    /// Re-read post-update identity.
    async fn reload(&self, _registry: &DeviceRegistry, _id: &DeviceId) -> Result<()> {
        Ok(())
    }

    /// Commit a staged update, typically after a reboot.
    async fn activate(
        &self,
        _registry: &DeviceRegistry,
        _id: &DeviceId,
        _progress: &Progress,
    ) -> Result<()> {
        Ok(())
    }

    /// Hash the on-device firmware for comparison against release
    /// checksums.
    async fn verify(&self, _registry: &DeviceRegistry, id: &DeviceId) -> Result<Vec<Checksum>> {
        Err(UpdateError::not_supported(format!(
            "device {id} cannot self-verify"
        )))
    }

    /// One-shot preparation bracketing a whole composite set.
    async fn composite_prepare(&self, _registry: &DeviceRegistry, _ids: &[DeviceId]) -> Result<()> {
        Ok(())
    }

    /// One-shot cleanup bracketing a whole composite set; runs on every
    /// exit path.
    async fn composite_cleanup(&self, _registry: &DeviceRegistry, _ids: &[DeviceId]) -> Result<()> {
        Ok(())
    }

    /// Copy family-specific state onto the device that re-appeared after a
    /// replug; the registry has already carried the generic flag subset.
    fn replace(&self, _device: &mut Device, _donor: &Device) {}

    /// Append family-specific debug fields to a device dump.
    fn device_to_string(&self, _device: &Device, _out: &mut String) {}

    /// Bounded attempts for [`poll_status`] loops.
    fn retry_count(&self) -> u32 {
        100
    }

    /// Sleep between [`poll_status`] attempts.
    fn retry_delay(&self) -> Duration {
        Duration::from_millis(300)
    }
}

/// Drive a read-status polling loop under the plugin's retry policy.
///
/// The only failure the update flow retries locally: probing a device
/// status register until it reports ready, bounded by the plugin's
/// [`DeviceHandler::retry_count`] with its [`DeviceHandler::retry_delay`]
/// between attempts. Probe errors surface immediately; running out of
/// attempts is a timeout.
pub async fn poll_status<F, Fut>(
    handler: &dyn DeviceHandler,
    what: &str,
    mut ready: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let attempts = handler.retry_count();
    for attempt in 0..attempts {
        if ready().await? {
            trace!(what, attempt, "status poll settled");
            return Ok(());
        }
        tokio::time::sleep(handler.retry_delay()).await;
    }
    Err(UpdateError::timeout(format!(
        "device did not report {what} within {attempts} status polls"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BareHandler;

    impl DeviceHandler for BareHandler {
        fn name(&self) -> &str {
            "bare"
        }
    }

    #[tokio::test]
    async fn test_defaults_are_identity() -> Result<()> {
        let handler = BareHandler;
        let registry = DeviceRegistry::new();
        let id = DeviceId::from_raw("x");
        let progress = Progress::new();

        handler.probe(&registry, &id).await?;
        handler.detach(&registry, &id, &progress).await?;
        handler.attach(&registry, &id, &progress).await?;
        handler.reload(&registry, &id).await?;
        handler.composite_prepare(&registry, &[]).await?;
        handler.composite_cleanup(&registry, &[]).await?;

        let tree = handler
            .prepare_firmware(b"abc", ParseFlags::default())
            .await?;
        assert_eq!(tree.data, b"abc");

        assert!(handler.verify(&registry, &id).await.is_err());
        assert_eq!(handler.retry_count(), 100);
        Ok(())
    }

    struct ImpatientHandler;

    impl DeviceHandler for ImpatientHandler {
        fn name(&self) -> &str {
            "impatient"
        }

        fn retry_count(&self) -> u32 {
            4
        }

        fn retry_delay(&self) -> Duration {
            Duration::from_millis(1)
        }
    }

    #[tokio::test]
    async fn test_poll_status_settles() -> Result<()> {
        let handler = ImpatientHandler;
        let mut polls = 0u32;
        poll_status(&handler, "idle", || {
            polls += 1;
            let ready = polls >= 3;
            std::future::ready(Ok(ready))
        })
        .await?;
        assert_eq!(polls, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_status_exhausts_retry_budget() {
        let handler = ImpatientHandler;
        let result = poll_status(&handler, "idle", || std::future::ready(Ok(false))).await;
        assert!(
            result.is_err_and(|e| e.kind() == ignition_errors::ErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn test_poll_status_surfaces_probe_errors() {
        let handler = ImpatientHandler;
        let result = poll_status(&handler, "idle", || {
            std::future::ready(Err(UpdateError::new(
                ignition_errors::ErrorKind::ReadProtected,
                "status register locked",
            )))
        })
        .await;
        assert!(
            result.is_err_and(|e| e.kind() == ignition_errors::ErrorKind::ReadProtected)
        );
    }
}
