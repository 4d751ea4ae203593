//! Stable device ids and hardware-id derivation.
//!
//! Both are content hashes: computing them twice over the same physical
//! locators or descriptor strings yields the same value, which is what
//! keeps identity stable across hotplug storms and replug mode switches.

use core::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Fixed namespace for name-based hardware-id derivation.
const GUID_NAMESPACE: [u8; 16] = [
    0x6b, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
];

/// A stable opaque device identifier.
///
/// Content-hashed from the plugin name and the device's physical and
/// logical locators, so the same physical device always computes the same
/// id no matter how many times it re-enumerates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Compute the id from the device's stable locators.
    pub fn from_locators(plugin: &str, physical_id: &str, logical_id: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(plugin.as_bytes());
        hasher.update(b":");
        hasher.update(physical_id.as_bytes());
        hasher.update(b":");
        hasher.update(logical_id.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed id, e.g. one read back from history.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive a hardware-id from a descriptor instance string.
///
/// Name-based RFC 4122 form over a fixed namespace: deterministic for the
/// same inputs, formatted as the usual lowercase 8-4-4-4-12.
pub fn guid_from_string(instance: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(GUID_NAMESPACE);
    hasher.update(instance.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format_guid(&bytes)
}

/// Whether a 16-byte candidate from a firmware table looks like a real
/// hardware-id: not all zero, and with a byte sum of at least 0xff.
pub fn guid_is_plausible(bytes: &[u8; 16]) -> bool {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    if sum == 0 {
        return false;
    }
    if sum < 0xff {
        return false;
    }
    true
}

fn format_guid(bytes: &[u8; 16]) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&bytes[0..4]),
        hex::encode(&bytes[4..6]),
        hex::encode(&bytes[6..8]),
        hex::encode(&bytes[8..10]),
        hex::encode(&bytes[10..16]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_is_deterministic() {
        let a = DeviceId::from_locators("usb-dock", "usb:02:00", "config0");
        let b = DeviceId::from_locators("usb-dock", "usb:02:00", "config0");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 40);
    }

    #[test]
    fn test_device_id_differs_by_locator() {
        let a = DeviceId::from_locators("usb-dock", "usb:02:00", "config0");
        let b = DeviceId::from_locators("usb-dock", "usb:02:01", "config0");
        let c = DeviceId::from_locators("usb-hub", "usb:02:00", "config0");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_guid_is_deterministic_and_shaped() {
        let a = guid_from_string("USB\\VID_273F&PID_1004");
        let b = guid_from_string("USB\\VID_273F&PID_1004");
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
        // version nibble is fixed by the derivation
        assert_eq!(a.as_bytes()[14], b'5');
    }

    #[test]
    fn test_guid_plausibility() {
        assert!(!guid_is_plausible(&[0u8; 16]));
        // sums below 0xff are descriptor padding, not ids
        let mut low = [0u8; 16];
        low[0] = 0xfe;
        assert!(!guid_is_plausible(&low));
        let mut exact = [0u8; 16];
        exact[0] = 0xff;
        assert!(guid_is_plausible(&exact));
        assert!(guid_is_plausible(&[0x11u8; 16]));
    }
}
