//! The requirements engine.
//!
//! Evaluates the declarative predicates a component carries against the
//! target device, its composite siblings and the driving client. All
//! predicates must hold; the error names the specific predicate that
//! failed so the operator sees *why* an update is withheld, and unknown
//! predicate kinds fail closed unless requirements are being ignored.

use std::collections::BTreeSet;

use ignition_cabinet::metadata::{CompareOp, Component, FirmwareTarget, Requirement};
use ignition_device::Device;
use ignition_errors::{Result, UpdateError};
use ignition_plugin::InstallFlags;
use ignition_version::{Version, VersionFormat};
use tracing::debug;

/// Features the driving client advertises, matched against `<client>`
/// requirements.
#[derive(Debug, Clone, Default)]
pub struct ClientCapabilities {
    features: BTreeSet<String>,
}

impl ClientCapabilities {
    /// No features at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// The feature set this engine's own orchestrator provides.
    pub fn standard() -> Self {
        let mut caps = Self::default();
        for feature in [
            "detach-action",
            "update-action",
            "attach-action",
            "replug",
            "requirements",
        ] {
            caps.add(feature);
        }
        caps
    }

    /// Advertise a feature.
    pub fn add(&mut self, feature: &str) {
        self.features.insert(feature.to_string());
    }

    /// Whether every requested feature is advertised.
    pub fn has_all<'a, I: IntoIterator<Item = &'a str>>(&self, features: I) -> bool {
        features.into_iter().all(|f| self.features.contains(f))
    }
}

/// Everything a requirement can be evaluated against.
pub struct RequirementContext<'a> {
    /// The device the release would install onto
    pub device: &'a Device,
    /// All present devices of the same composite unit, the target included
    pub siblings: &'a [Device],
    /// Every component in the cabinet, for resolving sibling predicates
    pub cabinet_components: &'a [Component],
    /// The driving client's advertised features
    pub client: &'a ClientCapabilities,
}

/// Check every requirement a component declares.
pub fn check_requirements(
    component: &Component,
    ctx: &RequirementContext<'_>,
    flags: InstallFlags,
) -> Result<()> {
    if flags.contains(InstallFlags::IGNORE_REQUIREMENTS) {
        debug!(component = %component.id, "skipping requirement checks");
        return Ok(());
    }
    for requirement in &component.requirements {
        check_one(component, requirement, ctx)?;
    }
    Ok(())
}

fn check_one(
    component: &Component,
    requirement: &Requirement,
    ctx: &RequirementContext<'_>,
) -> Result<()> {
    match requirement {
        Requirement::HardwareId { any_of } => {
            if !ctx.device.has_any_guid(any_of.iter().map(String::as_str)) {
                return Err(UpdateError::not_supported(format!(
                    "device {} has none of the required hardware ids [{}]",
                    ctx.device.id,
                    any_of.join(", ")
                )));
            }
        }
        Requirement::Firmware {
            target,
            compare,
            version,
        } => check_firmware(component, target, *compare, version, ctx)?,
        Requirement::Client { features } => {
            if !ctx.client.has_all(features.iter().map(String::as_str)) {
                return Err(UpdateError::not_supported(format!(
                    "client does not advertise all of [{}]",
                    features.join(", ")
                )));
            }
        }
        Requirement::VendorId { compare, value } => {
            let vendor_id = ctx.device.vendor_id.as_deref().unwrap_or("");
            if !compare_strings(*compare, vendor_id, value, VersionFormat::Plain)? {
                return Err(UpdateError::not_supported(format!(
                    "vendor id '{vendor_id}' does not satisfy {compare:?} '{value}'"
                )));
            }
        }
        Requirement::Unknown { element } => {
            return Err(UpdateError::not_supported(format!(
                "unknown requirement kind <{element}> fails closed"
            )));
        }
    }
    Ok(())
}

fn check_firmware(
    component: &Component,
    target: &FirmwareTarget,
    compare: CompareOp,
    version: &str,
    ctx: &RequirementContext<'_>,
) -> Result<()> {
    let (who, actual, format) = match target {
        FirmwareTarget::SelfVersion => (
            "device firmware".to_string(),
            ctx.device.version.clone(),
            ctx.device.version_format,
        ),
        FirmwareTarget::Bootloader => (
            "bootloader".to_string(),
            ctx.device.version_bootloader.clone(),
            ctx.device.version_format,
        ),
        FirmwareTarget::Sibling(component_id) => {
            let sibling = find_sibling(component_id, ctx).ok_or_else(|| {
                UpdateError::not_supported(format!(
                    "no composite sibling matches component '{component_id}' \
                     required by {}",
                    component.id
                ))
            })?;
            (
                format!("sibling '{component_id}'"),
                sibling.version.clone(),
                sibling.version_format,
            )
        }
    };

    let actual = actual.ok_or_else(|| {
        UpdateError::not_supported(format!("{who} has no version to compare against '{version}'"))
    })?;

    if !compare_strings(compare, &actual, version, format)? {
        return Err(UpdateError::not_supported(format!(
            "{who} version '{actual}' does not satisfy {compare:?} '{version}'"
        )));
    }
    Ok(())
}

/// Resolve a sibling component id to the composite device it names: the
/// sibling carrying any hardware-id the component provides.
fn find_sibling<'a>(component_id: &str, ctx: &RequirementContext<'a>) -> Option<&'a Device> {
    let component = ctx
        .cabinet_components
        .iter()
        .find(|c| c.id == component_id)?;
    ctx.siblings
        .iter()
        .find(|d| d.has_any_guid(component.provides.iter().map(String::as_str)))
}

/// Evaluate one comparison.
///
/// Ordering operators parse both sides under the device's version format,
/// falling back to byte-wise ordering when either side does not parse;
/// regex and glob match on the raw string.
pub fn compare_strings(
    op: CompareOp,
    actual: &str,
    expected: &str,
    format: VersionFormat,
) -> Result<bool> {
    use std::cmp::Ordering;

    let ordering = || {
        Version::try_compare(actual, expected, format)
            .unwrap_or_else(|| actual.cmp(expected))
    };

    Ok(match op {
        CompareOp::Eq => ordering() == Ordering::Equal,
        CompareOp::Ne => ordering() != Ordering::Equal,
        CompareOp::Gt => ordering() == Ordering::Greater,
        CompareOp::Ge => ordering() != Ordering::Less,
        CompareOp::Lt => ordering() == Ordering::Less,
        CompareOp::Le => ordering() != Ordering::Greater,
        CompareOp::Glob => glob_match(expected, actual),
        CompareOp::Regex => glob_match(&regex_to_glob(expected), actual),
    })
}

/// Shell-style glob: `*` any run, `?` any one character.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[char], value: &[char]) -> bool {
        match pattern.split_first() {
            None => value.is_empty(),
            Some(('*', rest)) => {
                (0..=value.len()).any(|skip| inner(rest, &value[skip..]))
            }
            Some(('?', rest)) => value
                .split_first()
                .is_some_and(|(_, tail)| inner(rest, tail)),
            Some((c, rest)) => value
                .split_first()
                .is_some_and(|(v, tail)| v == c && inner(rest, tail)),
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    inner(&pattern, &value)
}

/// The anchored regex subset vendor metadata actually uses, rewritten as
/// a glob: `.*` becomes `*`, a lone `.` becomes `?`, anchors drop.
fn regex_to_glob(pattern: &str) -> String {
    let pattern = pattern.strip_prefix('^').unwrap_or(pattern);
    let pattern = pattern.strip_suffix('$').unwrap_or(pattern);
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push('*');
                } else {
                    out.push('?');
                }
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ignition_cabinet::metadata::Release;
    use ignition_device::DeviceFlags;

    fn widget_device() -> Device {
        Device::new("emulated", "emu:0", "0", "Widget")
            .with_version("1.2.3.4", VersionFormat::Quad)
            .with_guid("2d47f29b-83a2-4f26-a3e9-367ea01e3e6a")
            .with_flags(DeviceFlags::UPDATABLE)
    }

    fn component_with(requirements: Vec<Requirement>) -> Component {
        Component {
            id: "com.vendor.widget.firmware".to_string(),
            provides: vec!["2d47f29b-83a2-4f26-a3e9-367ea01e3e6a".to_string()],
            requirements,
            releases: vec![Release::default()],
            ..Component::default()
        }
    }

    #[test]
    fn test_firmware_version_requirement() {
        let device = widget_device();
        let siblings = [device.clone()];
        let client = ClientCapabilities::standard();

        let component = component_with(vec![Requirement::Firmware {
            target: FirmwareTarget::SelfVersion,
            compare: CompareOp::Ge,
            version: "1.0.0.0".to_string(),
        }]);
        let ctx = RequirementContext {
            device: &device,
            siblings: &siblings,
            cabinet_components: std::slice::from_ref(&component),
            client: &client,
        };
        assert!(check_requirements(&component, &ctx, InstallFlags::default()).is_ok());

        let component = component_with(vec![Requirement::Firmware {
            target: FirmwareTarget::SelfVersion,
            compare: CompareOp::Ge,
            version: "2.0.0.0".to_string(),
        }]);
        let ctx = RequirementContext {
            device: &device,
            siblings: &siblings,
            cabinet_components: std::slice::from_ref(&component),
            client: &client,
        };
        let err = check_requirements(&component, &ctx, InstallFlags::default());
        assert!(err.is_err_and(|e| e.kind() == ignition_errors::ErrorKind::NotSupported));
    }

    #[test]
    fn test_sibling_requirement_names_the_predicate() {
        let device = widget_device();
        let mut pd = Device::new("emulated", "emu:0", "pd", "PD Controller")
            .with_version("2.9", VersionFormat::Pair)
            .with_guid("aaaa0000-0000-0000-0000-00000000pd00");
        pd.composite_id = device.composite_id.clone();

        let pd_component = Component {
            id: "com.vendor.widget.pd".to_string(),
            provides: vec!["aaaa0000-0000-0000-0000-00000000pd00".to_string()],
            ..Component::default()
        };
        let component = component_with(vec![Requirement::Firmware {
            target: FirmwareTarget::Sibling("com.vendor.widget.pd".to_string()),
            compare: CompareOp::Ge,
            version: "3.0".to_string(),
        }]);

        let siblings = [device.clone(), pd.clone()];
        let components = [component.clone(), pd_component];
        let client = ClientCapabilities::standard();
        let ctx = RequirementContext {
            device: &device,
            siblings: &siblings,
            cabinet_components: &components,
            client: &client,
        };

        let err = check_requirements(&component, &ctx, InstallFlags::default());
        let message = err.map_err(|e| e.message).err().unwrap_or_default();
        assert!(message.contains("com.vendor.widget.pd"));

        // and with ignore-requirements the same check passes
        assert!(
            check_requirements(&component, &ctx, InstallFlags::IGNORE_REQUIREMENTS).is_ok()
        );
    }

    #[test]
    fn test_client_requirement() {
        let device = widget_device();
        let siblings = [device.clone()];
        let component = component_with(vec![Requirement::Client {
            features: vec!["detach-action".to_string(), "cab-install".to_string()],
        }]);

        let poor = ClientCapabilities::standard();
        let ctx = RequirementContext {
            device: &device,
            siblings: &siblings,
            cabinet_components: std::slice::from_ref(&component),
            client: &poor,
        };
        assert!(check_requirements(&component, &ctx, InstallFlags::default()).is_err());

        let mut rich = ClientCapabilities::standard();
        rich.add("cab-install");
        let ctx = RequirementContext {
            device: &device,
            siblings: &siblings,
            cabinet_components: std::slice::from_ref(&component),
            client: &rich,
        };
        assert!(check_requirements(&component, &ctx, InstallFlags::default()).is_ok());
    }

    #[test]
    fn test_unknown_requirement_fails_closed() {
        let device = widget_device();
        let siblings = [device.clone()];
        let client = ClientCapabilities::standard();
        let component = component_with(vec![Requirement::Unknown {
            element: "temperature".to_string(),
        }]);
        let ctx = RequirementContext {
            device: &device,
            siblings: &siblings,
            cabinet_components: std::slice::from_ref(&component),
            client: &client,
        };
        assert!(check_requirements(&component, &ctx, InstallFlags::default()).is_err());
        assert!(
            check_requirements(&component, &ctx, InstallFlags::IGNORE_REQUIREMENTS).is_ok()
        );
    }

    #[test]
    fn test_vendor_id_requirement() -> Result<()> {
        let mut device = widget_device();
        device.vendor_id = Some("USB:0x273F".to_string());
        let siblings = [device.clone()];
        let client = ClientCapabilities::standard();

        let component = component_with(vec![Requirement::VendorId {
            compare: CompareOp::Eq,
            value: "USB:0x273F".to_string(),
        }]);
        let ctx = RequirementContext {
            device: &device,
            siblings: &siblings,
            cabinet_components: std::slice::from_ref(&component),
            client: &client,
        };
        check_requirements(&component, &ctx, InstallFlags::default())
    }

    #[test]
    fn test_glob_and_regex_compare() -> Result<()> {
        assert!(compare_strings(
            CompareOp::Glob,
            "RQR12.07_B0029",
            "RQR12.*",
            VersionFormat::Plain
        )?);
        assert!(!compare_strings(
            CompareOp::Glob,
            "RQR13.01",
            "RQR12.*",
            VersionFormat::Plain
        )?);
        assert!(compare_strings(
            CompareOp::Regex,
            "1.2.3",
            "^1\\.2\\..$",
            VersionFormat::Plain
        )?);
        assert!(compare_strings(
            CompareOp::Regex,
            "ABC-99",
            "ABC-.*",
            VersionFormat::Plain
        )?);
        Ok(())
    }

    #[test]
    fn test_glob_edge_cases() {
        assert!(glob_match("*", ""));
        assert!(glob_match("a*c", "abbbc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("??", "ab"));
    }
}
