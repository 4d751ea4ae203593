//! The device value.

use std::time::Duration;

use ignition_version::VersionFormat;
use serde::{Deserialize, Serialize};

use crate::flags::{DeviceFlags, DeviceProblems};
use crate::id::DeviceId;

/// Default grace window for a device to re-appear after a mode switch.
pub const DEFAULT_REMOVE_DELAY: Duration = Duration::from_secs(20);

/// One updatable device.
///
/// Created by a plugin on hotplug or coldplug, mutated only through
/// [`crate::DeviceRegistry`] operations, destroyed on unplug once the
/// remove-delay grace window has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable opaque identifier
    pub id: DeviceId,
    /// Shared across all devices of one physical unit; the parent owns it
    pub composite_id: DeviceId,
    /// Hardware-ids used as release match keys, lowercased
    pub guids: Vec<String>,
    /// Human-readable name
    pub name: String,
    /// Vendor name
    pub vendor: Option<String>,
    /// Vendor id in transport notation, e.g. `USB:0x273F`
    pub vendor_id: Option<String>,
    /// Name of the plugin that claimed the device
    pub plugin: String,
    /// Current firmware version
    pub version: Option<String>,
    /// Format the version strings use
    pub version_format: VersionFormat,
    /// Bootloader version, when distinct from the runtime one
    pub version_bootloader: Option<String>,
    /// Firmware branch currently installed
    pub branch: Option<String>,
    /// Largest payload the device will accept, in bytes
    pub firmware_size_max: Option<u64>,
    /// Grace window for replug matching
    #[serde(with = "duration_millis")]
    pub remove_delay: Duration,
    /// Vendor hint for how long an install takes
    pub install_duration: Option<Duration>,
    /// Durable attributes
    pub flags: DeviceFlags,
    /// Transient conditions
    pub problems: DeviceProblems,
    /// Install ordering inside a composite set, higher first
    pub priority: i32,
    /// Parent device, when part of a composite unit
    pub parent_id: Option<DeviceId>,
    /// Child devices
    pub child_ids: Vec<DeviceId>,
    /// When the device was first seen
    pub created: chrono::DateTime<chrono::Utc>,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Device {
    /// Create a device from its stable locators.
    pub fn new(plugin: &str, physical_id: &str, logical_id: &str, name: &str) -> Self {
        let id = DeviceId::from_locators(plugin, physical_id, logical_id);
        Self {
            composite_id: id.clone(),
            id,
            guids: Vec::new(),
            name: name.to_string(),
            vendor: None,
            vendor_id: None,
            plugin: plugin.to_string(),
            version: None,
            version_format: VersionFormat::default(),
            version_bootloader: None,
            branch: None,
            firmware_size_max: None,
            remove_delay: DEFAULT_REMOVE_DELAY,
            install_duration: None,
            flags: DeviceFlags::default(),
            problems: DeviceProblems::default(),
            priority: 0,
            parent_id: None,
            child_ids: Vec::new(),
            created: chrono::Utc::now(),
        }
    }

    /// Set the current version and its format.
    pub fn with_version(mut self, version: &str, format: VersionFormat) -> Self {
        self.version = Some(version.to_string());
        self.version_format = format;
        self
    }

    /// Add a raw hardware-id.
    pub fn with_guid(mut self, guid: &str) -> Self {
        self.add_guid(guid);
        self
    }

    /// Add an instance string, deriving its hardware-id.
    pub fn with_instance_id(mut self, instance: &str) -> Self {
        self.add_guid(&crate::id::guid_from_string(instance));
        self
    }

    /// Set initial flags.
    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Set the install priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the composite id shared with siblings.
    pub fn with_composite_id(mut self, composite_id: DeviceId) -> Self {
        self.composite_id = composite_id;
        self
    }

    /// Set the replug grace window.
    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = delay;
        self
    }

    /// Add a hardware-id if not already present.
    pub fn add_guid(&mut self, guid: &str) {
        let guid = guid.to_ascii_lowercase();
        if !self.guids.contains(&guid) {
            self.guids.push(guid);
        }
    }

    /// Whether the device carries the given hardware-id.
    pub fn has_guid(&self, guid: &str) -> bool {
        self.guids.iter().any(|g| g.eq_ignore_ascii_case(guid))
    }

    /// Whether any of the given hardware-ids match.
    pub fn has_any_guid<'a, I: IntoIterator<Item = &'a str>>(&self, guids: I) -> bool {
        guids.into_iter().any(|g| self.has_guid(g))
    }

    /// Whether the given flags are all set.
    pub fn has_flag(&self, flags: DeviceFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Set flags.
    pub fn add_flag(&mut self, flags: DeviceFlags) {
        self.flags |= flags;
    }

    /// Clear flags.
    pub fn remove_flag(&mut self, flags: DeviceFlags) {
        self.flags &= !flags;
    }

    /// Whether the given problems are all present.
    pub fn has_problem(&self, problems: DeviceProblems) -> bool {
        self.problems.contains(problems)
    }

    /// Whether an update may be offered at all.
    pub fn is_updatable(&self) -> bool {
        self.has_flag(DeviceFlags::UPDATABLE) || self.has_flag(DeviceFlags::UPDATABLE_HIDDEN)
    }

    /// Adopt identity and durable state from the device this one replaces
    /// after a replug.
    pub fn incorporate(&mut self, donor: &Device) {
        self.id = donor.id.clone();
        self.composite_id = donor.composite_id.clone();
        self.parent_id = donor.parent_id.clone();
        self.child_ids = donor.child_ids.clone();
        self.priority = donor.priority;
        self.created = donor.created;
        self.flags |= donor.flags.replug_carryover();
        for guid in &donor.guids {
            self.add_guid(guid);
        }
        if self.version.is_none() {
            self.version = donor.version.clone();
            self.version_format = donor.version_format;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let device = Device::new("emulated", "emu:0", "0", "Test Widget")
            .with_version("1.2.3.4", VersionFormat::Quad)
            .with_instance_id("USB\\VID_273F&PID_1004")
            .with_flags(DeviceFlags::UPDATABLE)
            .with_priority(2);

        assert_eq!(device.version.as_deref(), Some("1.2.3.4"));
        assert_eq!(device.guids.len(), 1);
        assert!(device.is_updatable());
        assert_eq!(device.priority, 2);
        assert_eq!(device.composite_id, device.id);
    }

    #[test]
    fn test_guid_dedup_and_case() {
        let mut device = Device::new("p", "x", "y", "n");
        device.add_guid("AABB0000-0000-0000-0000-000000000000");
        device.add_guid("aabb0000-0000-0000-0000-000000000000");
        assert_eq!(device.guids.len(), 1);
        assert!(device.has_guid("AABB0000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_incorporate_preserves_identity() {
        let mut old = Device::new("p", "x", "y", "runtime")
            .with_version("1.0.0.0", VersionFormat::Quad)
            .with_flags(DeviceFlags::UPDATABLE | DeviceFlags::WAIT_FOR_REPLUG)
            .with_guid("11110000-0000-0000-0000-000000000000");
        old.priority = 3;

        let mut replacement = Device::new("p", "x", "bootloader", "bootloader mode")
            .with_flags(DeviceFlags::IS_BOOTLOADER);
        replacement.incorporate(&old);

        assert_eq!(replacement.id, old.id);
        assert_eq!(replacement.priority, 3);
        assert!(replacement.has_flag(DeviceFlags::UPDATABLE));
        assert!(replacement.has_flag(DeviceFlags::IS_BOOTLOADER));
        assert!(!replacement.has_flag(DeviceFlags::WAIT_FOR_REPLUG));
        assert!(replacement.has_guid("11110000-0000-0000-0000-000000000000"));
    }
}
