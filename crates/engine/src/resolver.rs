//! The release resolver.
//!
//! Given a parsed cabinet and a set of candidate devices, pick every
//! `(device, release)` pair that genuinely applies: hardware-id listed,
//! requirements satisfied, version policy permitting, payload checksum
//! verified. When nothing applies the caller gets the error from the
//! candidate that got furthest, which is almost always the diagnostic the
//! operator wants.

use ignition_cabinet::metadata::{Component, Release};
use ignition_cabinet::{Cabinet, ParseFlags};
use ignition_crypto::Checksum;
use ignition_device::Device;
use ignition_errors::{Result, UpdateError};
use ignition_plugin::InstallFlags;
use ignition_version::Version;
use tracing::debug;

use crate::requirements::{ClientCapabilities, RequirementContext, check_requirements};

/// One matched install unit.
#[derive(Debug, Clone)]
pub struct ResolvedInstall {
    /// The device to update
    pub device: Device,
    /// The component that matched it
    pub component: Component,
    /// The chosen release
    pub release: Release,
    /// Provenance, when the cabinet came from a remote
    pub remote_id: Option<String>,
}

/// How far a failed candidate got; higher is closer to applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchDepth {
    HardwareId,
    Requirements,
    VersionPolicy,
    Checksum,
}

struct BestError {
    depth: MatchDepth,
    error: UpdateError,
}

impl BestError {
    fn consider(slot: &mut Option<BestError>, depth: MatchDepth, error: UpdateError) {
        if slot.as_ref().is_none_or(|b| depth >= b.depth) {
            *slot = Some(BestError { depth, error });
        }
    }
}

/// Match every component in the cabinet against every candidate device.
///
/// Survivors are ordered by device priority descending, then by stable
/// device id.
pub fn resolve_cabinet(
    cabinet: &Cabinet,
    devices: &[Device],
    client: &ClientCapabilities,
    install_flags: InstallFlags,
    parse_flags: ParseFlags,
    remote_id: Option<&str>,
) -> Result<Vec<ResolvedInstall>> {
    let mut resolved: Vec<ResolvedInstall> = Vec::new();
    let mut best: Option<BestError> = None;

    for component in cabinet.components() {
        // metadata-only components (sibling requirement anchors, say)
        // contribute nothing to matching
        if component.releases.is_empty() {
            continue;
        }
        for device in devices {
            if !device.is_updatable() {
                BestError::consider(
                    &mut best,
                    MatchDepth::HardwareId,
                    UpdateError::not_supported(format!("device {} is not updatable", device.id)),
                );
                continue;
            }
            let listed = component.matches_any_guid(device.guids.iter().map(String::as_str))
                || parse_flags.contains(ParseFlags::IGNORE_VID_PID);
            if !listed {
                BestError::consider(
                    &mut best,
                    MatchDepth::HardwareId,
                    UpdateError::not_supported(format!(
                        "component {} lists none of the hardware ids of device {}",
                        component.id, device.id
                    )),
                );
                continue;
            }

            let ctx = RequirementContext {
                device,
                siblings: devices,
                cabinet_components: cabinet.components(),
                client,
            };
            if let Err(e) = check_requirements(component, &ctx, install_flags) {
                BestError::consider(&mut best, MatchDepth::Requirements, e);
                continue;
            }

            match pick_release(cabinet, component, device, install_flags, parse_flags) {
                Ok(release) => {
                    debug!(
                        device = %device.id,
                        component = %component.id,
                        version = %release.version,
                        "resolved release"
                    );
                    resolved.push(ResolvedInstall {
                        device: device.clone(),
                        component: component.clone(),
                        release,
                        remote_id: remote_id.map(str::to_string),
                    });
                }
                Err((depth, e)) => BestError::consider(&mut best, depth, e),
            }
        }
    }

    if resolved.is_empty() {
        return Err(match best {
            Some(best) => best.error,
            None => UpdateError::nothing_to_do("cabinet matches no connected device"),
        });
    }

    resolved.sort_by(|a, b| {
        b.device
            .priority
            .cmp(&a.device.priority)
            .then(a.device.id.cmp(&b.device.id))
    });
    // one release per device: the first survivor in component order wins
    resolved.dedup_by(|a, b| a.device.id == b.device.id);
    Ok(resolved)
}

/// The newest release of the component that the version policy and the
/// payload checksum both accept.
fn pick_release(
    cabinet: &Cabinet,
    component: &Component,
    device: &Device,
    install_flags: InstallFlags,
    parse_flags: ParseFlags,
) -> std::result::Result<Release, (MatchDepth, UpdateError)> {
    let mut releases: Vec<&Release> = component.releases.iter().collect();
    releases.sort_by(|a, b| {
        Version::try_compare(&b.version, &a.version, device.version_format)
            .unwrap_or_else(|| b.version.cmp(&a.version))
    });

    let mut last: Option<(MatchDepth, UpdateError)> = None;
    for release in releases {
        match version_policy(device, release, install_flags) {
            Ok(()) => {}
            Err(e) => {
                last.get_or_insert((MatchDepth::VersionPolicy, e));
                continue;
            }
        }
        match verify_payload(cabinet, release, parse_flags) {
            Ok(()) => return Ok(release.clone()),
            Err(e) => {
                last = Some((MatchDepth::Checksum, e));
            }
        }
    }
    Err(last.unwrap_or((
        MatchDepth::VersionPolicy,
        UpdateError::nothing_to_do(format!(
            "no release of component {} is applicable",
            component.id
        )),
    )))
}

/// Upgrade / downgrade / reinstall / branch-switch policy.
fn version_policy(device: &Device, release: &Release, flags: InstallFlags) -> Result<()> {
    use std::cmp::Ordering;

    let release_branch = release.branch.as_deref();
    if release_branch != device.branch.as_deref() {
        if !flags.contains(InstallFlags::ALLOW_BRANCH_SWITCH) {
            return Err(UpdateError::not_supported(format!(
                "release is on branch '{}', device is on '{}'; branch switching not requested",
                release_branch.unwrap_or("default"),
                device.branch.as_deref().unwrap_or("default"),
            )));
        }
        if !device.has_flag(ignition_device::DeviceFlags::HAS_MULTIPLE_BRANCHES) {
            return Err(UpdateError::not_supported(format!(
                "device {} does not advertise multiple branches",
                device.id
            )));
        }
        // a branch switch is allowed to move in any version direction
        return Ok(());
    }

    let Some(ref current) = device.version else {
        return Ok(());
    };
    let ordering = Version::try_compare(&release.version, current, device.version_format)
        .ok_or_else(|| {
            UpdateError::invalid_args(format!(
                "cannot compare '{}' and '{current}' as {}",
                release.version, device.version_format
            ))
        })?;

    match ordering {
        Ordering::Greater => Ok(()),
        Ordering::Equal if flags.contains(InstallFlags::ALLOW_REINSTALL) => Ok(()),
        Ordering::Equal => Err(UpdateError::nothing_to_do(format!(
            "device already has version {current}"
        ))),
        Ordering::Less if flags.contains(InstallFlags::ALLOW_OLDER) => Ok(()),
        Ordering::Less => Err(UpdateError::nothing_to_do(format!(
            "release {} is older than installed {current}",
            release.version
        ))),
    }
}

/// At least one declared checksum must match the payload bytes.
fn verify_payload(cabinet: &Cabinet, release: &Release, parse_flags: ParseFlags) -> Result<()> {
    let payload = cabinet.payload(release)?;

    if release.checksums.is_empty() {
        if parse_flags.contains(ParseFlags::IGNORE_CHECKSUM) {
            return Ok(());
        }
        return Err(UpdateError::invalid_file(format!(
            "release {} declares no payload checksum",
            release.version
        )));
    }

    let matched = release.checksums.iter().any(|c| c.matches(payload));
    if !matched && !parse_flags.contains(ParseFlags::IGNORE_CHECKSUM) {
        let best = Checksum::best_of(&release.checksums)
            .map(ToString::to_string)
            .unwrap_or_default();
        return Err(UpdateError::invalid_file(format!(
            "payload for release {} does not match its declared checksum {best}",
            release.version
        )));
    }
    Ok(())
}
