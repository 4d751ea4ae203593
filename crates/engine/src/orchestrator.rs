//! The install orchestrator.
//!
//! Drives a resolved composite set through the update protocol:
//!
//! ```text
//! IDLE -> PREPARED -> DETACHED -> WRITTEN -> ATTACHED -> RELOADED -> DONE
//! ```
//!
//! with composite prepare/cleanup bracketing the whole set, replug waits
//! after detach and attach, history rows transitioning pending to their
//! terminal state, and per-device progress under one root node. Composite
//! cleanup runs on every exit path, cancellation included, and a failure
//! never leaves a device sitting in its bootloader when a best-effort
//! attach can bring it back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ignition_cabinet::{Cabinet, ParseFlags};
use ignition_device::{Device, DeviceFlags, DeviceId, DeviceProblems, DeviceRegistry};
use ignition_errors::{ErrorKind, Result, UpdateError};
use ignition_history::{HistoryEntry, HistoryStore, UpdateState};
use ignition_plugin::{DeviceHandler, InstallFlags, PluginRegistry};
use ignition_progress::{Progress, ProgressStatus};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::resolver::ResolvedInstall;

/// How often the registry is polled while waiting for a replug.
const REPLUG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Terminal state of one device's branch of the install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Firmware written and reloaded
    Success,
    /// Firmware staged; a separate activation will commit it
    NeedsActivation,
    /// Firmware staged; a system reboot will commit it
    NeedsReboot,
    /// This device's branch failed
    Failed,
    /// Not attempted because an earlier sibling failed or the operation
    /// was cancelled
    Skipped,
}

/// One device's outcome.
#[derive(Debug, Clone)]
pub struct DeviceOutcome {
    /// The device
    pub device_id: DeviceId,
    /// What happened
    pub status: DeviceStatus,
    /// The first error observed, for failed branches
    pub error: Option<UpdateError>,
    /// The history row, when history was recorded
    pub attempt_id: Option<uuid::Uuid>,
}

/// Overall result of a composite install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    /// Every branch succeeded or staged
    Success,
    /// The operator cancelled mid-flight
    AbortedByUser,
    /// Some branches settled, some failed; devices are back in runtime
    /// mode
    FailedRecoverable,
    /// Nothing was installed
    Failed,
}

/// The per-device outcomes of one composite install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Outcomes in install order
    pub outcomes: Vec<DeviceOutcome>,
    /// Whether a cancellation fired
    pub cancelled: bool,
}

impl InstallReport {
    /// Collapse per-device outcomes into the coarse contract.
    pub fn status(&self) -> InstallStatus {
        if self.cancelled {
            return InstallStatus::AbortedByUser;
        }
        let failed = self
            .outcomes
            .iter()
            .any(|o| matches!(o.status, DeviceStatus::Failed | DeviceStatus::Skipped));
        if !failed {
            return InstallStatus::Success;
        }
        let any_settled = self.outcomes.iter().any(|o| {
            matches!(
                o.status,
                DeviceStatus::Success | DeviceStatus::NeedsActivation | DeviceStatus::NeedsReboot
            )
        });
        if any_settled {
            InstallStatus::FailedRecoverable
        } else {
            InstallStatus::Failed
        }
    }

    /// Whether anything is left waiting for a separate activation.
    pub fn needs_activation(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.status == DeviceStatus::NeedsActivation)
    }
}

/// Tracks a cancellation channel; once fired, stays fired.
struct CancelState {
    rx: Option<mpsc::Receiver<()>>,
    fired: bool,
}

impl CancelState {
    fn new(rx: Option<mpsc::Receiver<()>>) -> Self {
        Self { rx, fired: false }
    }

    fn fired(&mut self) -> bool {
        if !self.fired {
            if let Some(ref mut rx) = self.rx {
                self.fired = rx.try_recv().is_ok();
            }
        }
        self.fired
    }

    fn check(&mut self) -> Result<()> {
        if self.fired() {
            Err(cancelled())
        } else {
            Ok(())
        }
    }
}

fn cancelled() -> UpdateError {
    UpdateError::new(ErrorKind::PermissionDenied, "operation cancelled by user")
}

fn is_cancelled(error: &UpdateError) -> bool {
    error.kind() == ErrorKind::PermissionDenied && error.message.contains("cancelled")
}

/// The install orchestrator.
pub struct Orchestrator {
    registry: DeviceRegistry,
    plugins: Arc<PluginRegistry>,
    history: Arc<HistoryStore>,
}

impl Orchestrator {
    /// Create an orchestrator over shared engine state.
    pub fn new(
        registry: DeviceRegistry,
        plugins: Arc<PluginRegistry>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            registry,
            plugins,
            history,
        }
    }

    /// Run a resolved composite install to completion.
    ///
    /// `cancel` may deliver one message to abort between plugin calls; the
    /// in-flight call is always allowed to finish so the device is never
    /// abandoned mid-transfer.
    pub async fn install(
        &self,
        cabinet: &Cabinet,
        resolved: &[ResolvedInstall],
        install_flags: InstallFlags,
        parse_flags: ParseFlags,
        progress: &Progress,
        cancel: Option<mpsc::Receiver<()>>,
    ) -> Result<InstallReport> {
        if resolved.is_empty() {
            return Err(UpdateError::nothing_to_do("nothing resolved to install"));
        }
        if install_flags.contains(InstallFlags::ONLY_EMULATED) {
            for item in resolved {
                if !item.device.has_flag(DeviceFlags::EMULATED) {
                    return Err(UpdateError::not_supported(format!(
                        "device {} is not emulated",
                        item.device.id
                    )));
                }
            }
        }

        let mut cancel = CancelState::new(cancel);
        let by_plugin = self.group_by_plugin(resolved)?;

        for (handler, ids) in &by_plugin {
            handler
                .composite_prepare(&self.registry, ids)
                .await
                .map_err(|e| e.prefixed("composite prepare"))?;
        }

        let result = self
            .install_devices(cabinet, resolved, install_flags, parse_flags, progress, &mut cancel)
            .await;

        // cleanup runs no matter how the body exited
        for (handler, ids) in &by_plugin {
            if let Err(e) = handler.composite_cleanup(&self.registry, ids).await {
                warn!(plugin = handler.name(), error = %e, "composite cleanup failed");
            }
        }

        let report = result?;
        progress.finish();
        info!(status = ?report.status(), devices = report.outcomes.len(), "install finished");
        Ok(report)
    }

    fn group_by_plugin(
        &self,
        resolved: &[ResolvedInstall],
    ) -> Result<Vec<(Arc<dyn DeviceHandler>, Vec<DeviceId>)>> {
        let mut grouped: Vec<(Arc<dyn DeviceHandler>, Vec<DeviceId>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for item in resolved {
            let handler = self.plugins.handler_for(&item.device)?;
            let slot = *index.entry(handler.name().to_string()).or_insert_with(|| {
                grouped.push((handler.clone(), Vec::new()));
                grouped.len() - 1
            });
            grouped[slot].1.push(item.device.id.clone());
        }
        Ok(grouped)
    }

    async fn install_devices(
        &self,
        cabinet: &Cabinet,
        resolved: &[ResolvedInstall],
        install_flags: InstallFlags,
        parse_flags: ParseFlags,
        progress: &Progress,
        cancel: &mut CancelState,
    ) -> Result<InstallReport> {
        let mut outcomes = Vec::with_capacity(resolved.len());
        let mut abort_rest = false;

        // declare every device branch up front so the root percentage
        // only ever climbs as branches complete
        let nodes: Vec<Progress> = resolved
            .iter()
            .map(|item| progress.add_step(ProgressStatus::DeviceBusy, 1, Some(&item.device.name)))
            .collect();

        for (item, node) in resolved.iter().zip(&nodes) {
            if abort_rest || cancel.fired() {
                node.finish();
                outcomes.push(DeviceOutcome {
                    device_id: item.device.id.clone(),
                    status: DeviceStatus::Skipped,
                    error: None,
                    attempt_id: None,
                });
                continue;
            }

            let attempt_id = if install_flags.contains(InstallFlags::NO_HISTORY) {
                None
            } else {
                let entry = HistoryEntry::begin(
                    item.device.id.clone(),
                    item.device.composite_id.clone(),
                    &item.device.name,
                    &item.device.plugin,
                    item.device.version.as_deref(),
                    &item.release.version,
                )
                .with_release(
                    ignition_crypto::Checksum::best_of(&item.release.checksums)
                        .map(ToString::to_string),
                    item.remote_id.clone(),
                );
                Some(self.history.begin(entry).await?)
            };

            let outcome = self
                .run_device(cabinet, item, install_flags, parse_flags, node, cancel)
                .await;
            node.finish();

            match outcome {
                Ok(status) => {
                    let state = match status {
                        DeviceStatus::NeedsActivation => UpdateState::NeedsActivation,
                        DeviceStatus::NeedsReboot => UpdateState::NeedsReboot,
                        _ => UpdateState::Success,
                    };
                    if let Some(attempt_id) = attempt_id {
                        self.history.settle(attempt_id, state, None).await?;
                    }
                    outcomes.push(DeviceOutcome {
                        device_id: item.device.id.clone(),
                        status,
                        error: None,
                        attempt_id,
                    });
                }
                Err(error) => {
                    warn!(device = %item.device.id, error = %error, "device branch failed");
                    if let Some(attempt_id) = attempt_id {
                        self.history
                            .settle(attempt_id, UpdateState::Failed, Some(&error))
                            .await?;
                    }
                    if is_cancelled(&error) {
                        cancel.fired = true;
                    }
                    outcomes.push(DeviceOutcome {
                        device_id: item.device.id.clone(),
                        status: DeviceStatus::Failed,
                        error: Some(error),
                        attempt_id,
                    });
                    if !item.component.install_independently {
                        abort_rest = true;
                    }
                }
            }
        }

        Ok(InstallReport {
            outcomes,
            cancelled: cancel.fired,
        })
    }

    /// One device's walk through the state machine.
    async fn run_device(
        &self,
        cabinet: &Cabinet,
        item: &ResolvedInstall,
        install_flags: InstallFlags,
        parse_flags: ParseFlags,
        node: &Progress,
        cancel: &mut CancelState,
    ) -> std::result::Result<DeviceStatus, UpdateError> {
        let handler = self.plugins.handler_for(&item.device)?;
        let id = item.device.id.clone();

        self.check_guard_rails(&item.device, install_flags)?;

        let payload = cabinet.payload(&item.release)?;
        if let Some(max) = item.device.firmware_size_max {
            if payload.len() as u64 > max {
                return Err(UpdateError::invalid_file(format!(
                    "payload is {} bytes, device accepts at most {max}",
                    payload.len()
                )));
            }
        }

        let prepare_step = node.add_step(ProgressStatus::Loading, 5, Some("prepare-fw"));
        let detach_step = node.add_step(ProgressStatus::DeviceBusy, 5, Some("detach"));
        let write_step = node.add_step(ProgressStatus::DeviceWrite, 80, Some("write"));
        let attach_step = node.add_step(ProgressStatus::DeviceBusy, 5, Some("attach"));
        let reload_step = node.add_step(ProgressStatus::DeviceRead, 5, Some("reload"));

        let firmware = handler
            .prepare_firmware(payload, parse_flags)
            .await
            .map_err(|e| e.prefixed("prepare firmware"))?;
        prepare_step.finish();
        cancel.check()?;

        let result = self
            .run_transfer(
                &handler,
                &id,
                &firmware,
                install_flags,
                (&detach_step, &write_step, &attach_step, &reload_step),
                cancel,
            )
            .await;

        if result.is_err() {
            // never leave the device in an unattended bootloader: try to
            // attach before surfacing the failure, unless it is unplugged
            if self.registry.contains(&id).await {
                debug!(device = %id, "running best-effort attach after failure");
                if let Err(e) = handler.attach(&self.registry, &id, &attach_step).await {
                    debug!(device = %id, error = %e, "best-effort attach failed");
                }
            }
        }
        result?;

        let device = self
            .registry
            .get(&id)
            .await
            .ok_or_else(|| UpdateError::internal(format!("device {id} vanished after reload")))?;

        if device.has_flag(DeviceFlags::NEEDS_ACTIVATION) {
            self.registry
                .update(&id, |d| d.problems |= DeviceProblems::UPDATE_PENDING)
                .await?;
            return Ok(DeviceStatus::NeedsActivation);
        }
        if device.has_flag(DeviceFlags::NEEDS_REBOOT) {
            return Ok(DeviceStatus::NeedsReboot);
        }
        Ok(DeviceStatus::Success)
    }

    /// detach -> write -> attach -> reload, with replug settling.
    async fn run_transfer(
        &self,
        handler: &Arc<dyn DeviceHandler>,
        id: &DeviceId,
        firmware: &ignition_plugin::FirmwareTree,
        install_flags: InstallFlags,
        steps: (&Progress, &Progress, &Progress, &Progress),
        cancel: &mut CancelState,
    ) -> Result<()> {
        let (detach_step, write_step, attach_step, reload_step) = steps;

        let before = self.registry.get(id).await;
        match handler.detach(&self.registry, id, detach_step).await {
            Ok(()) => {}
            // the device may reset before completing the transaction; an
            // internal error on a device already waiting for replug is
            // that reset, not a failure. Applies to detach only.
            Err(e) if e.kind() == ErrorKind::Internal && self.waiting_replug(id).await => {
                debug!(device = %id, error = %e, "ignoring reset during detach");
            }
            Err(e) => return Err(e.prefixed("detach")),
        }
        self.settle_replug(handler, id, before.as_ref())
            .await
            .map_err(|e| e.prefixed("detach"))?;
        detach_step.finish();
        cancel.check()?;

        handler.set_progress(write_step);
        handler
            .write_firmware(&self.registry, id, firmware, write_step, install_flags)
            .await
            .map_err(|e| e.prefixed("write firmware"))?;
        write_step.finish();
        cancel.check()?;

        let before = self.registry.get(id).await;
        handler
            .attach(&self.registry, id, attach_step)
            .await
            .map_err(|e| e.prefixed("attach"))?;
        self.settle_replug(handler, id, before.as_ref())
            .await
            .map_err(|e| e.prefixed("attach"))?;
        attach_step.finish();

        handler
            .reload(&self.registry, id)
            .await
            .map_err(|e| e.prefixed("reload"))?;
        reload_step.finish();
        Ok(())
    }

    async fn waiting_replug(&self, id: &DeviceId) -> bool {
        self.registry
            .get(id)
            .await
            .is_some_and(|d| d.has_flag(DeviceFlags::WAIT_FOR_REPLUG))
    }

    /// Wait out a wait-for-replug window, if one was opened.
    ///
    /// Polls the registry until the device re-appears with the flag
    /// cleared (the registry preserves id continuity) or the device's
    /// remove-delay expires. After a successful replug the plugin's
    /// replace hook copies family state from the pre-replug snapshot.
    async fn settle_replug(
        &self,
        handler: &Arc<dyn DeviceHandler>,
        id: &DeviceId,
        donor: Option<&Device>,
    ) -> Result<()> {
        match self.registry.get(id).await {
            // flagged, or already disappeared with the replug in flight
            Some(d) if d.has_flag(DeviceFlags::WAIT_FOR_REPLUG) => {}
            None => {}
            Some(_) => return Ok(()),
        }

        let remove_delay = donor
            .map(|d| d.remove_delay)
            .unwrap_or(ignition_device::device::DEFAULT_REMOVE_DELAY);
        let deadline = Instant::now() + remove_delay;
        debug!(device = %id, delay = ?remove_delay, "waiting for replug");

        loop {
            self.registry.purge_expired().await;
            if let Some(device) = self.registry.get(id).await {
                if !device.has_flag(DeviceFlags::WAIT_FOR_REPLUG) {
                    if let Some(donor) = donor {
                        let donor = donor.clone();
                        let handler = handler.clone();
                        self.registry
                            .update(id, move |d| handler.replace(d, &donor))
                            .await?;
                    }
                    debug!(device = %id, "replug settled");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(UpdateError::timeout(format!(
                    "timeout waiting for replug of device {id}"
                )));
            }
            tokio::time::sleep(REPLUG_POLL_INTERVAL).await;
        }
    }

    fn check_guard_rails(&self, device: &Device, flags: InstallFlags) -> Result<()> {
        if flags.contains(InstallFlags::FORCE) {
            return Ok(());
        }
        if device.has_problem(DeviceProblems::BATTERY_LOW) {
            return Err(UpdateError::new(
                ErrorKind::BatteryLow,
                "battery too low to safely flash",
            ));
        }
        if device.has_problem(DeviceProblems::POWER_TOO_LOW) {
            return Err(UpdateError::new(
                ErrorKind::AcPowerRequired,
                "AC power required before flashing",
            ));
        }
        if device.has_problem(DeviceProblems::LID_CLOSED) {
            return Err(UpdateError::new(
                ErrorKind::LidClosed,
                "lid must be open while flashing",
            ));
        }
        if device.has_flag(DeviceFlags::LOCKED) {
            return Err(UpdateError::not_supported(format!(
                "device {} is locked",
                device.id
            )));
        }
        Ok(())
    }
}
