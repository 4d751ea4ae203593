//! Device flag and problem bitsets.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Describes durable attributes of a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DeviceFlags: u64 {
        /// Device is updatable in this or any other mode
        const UPDATABLE              = 1 << 0;
        /// Updatable, but hidden from default listings
        const UPDATABLE_HIDDEN       = 1 << 1;
        /// Metadata for this device exists upstream
        const SUPPORTED              = 1 << 2;
        /// Currently in bootloader mode
        const IS_BOOTLOADER          = 1 << 3;
        /// Requires a system reboot to apply firmware
        const NEEDS_REBOOT           = 1 << 4;
        /// Requires a system shutdown to apply firmware
        const NEEDS_SHUTDOWN         = 1 << 5;
        /// Staged update needs a separate activation step
        const NEEDS_ACTIVATION       = 1 << 6;
        /// The hardware is waiting to be replugged
        const WAIT_FOR_REPLUG        = 1 << 7;
        /// Only accepts signed payloads
        const SIGNED_PAYLOAD         = 1 << 8;
        /// Only accepts unsigned payloads
        const UNSIGNED_PAYLOAD       = 1 << 9;
        /// Can hash its own firmware for verification
        const CAN_VERIFY             = 1 << 10;
        /// Can verify a firmware image before writing it
        const CAN_VERIFY_IMAGE       = 1 << 11;
        /// Backed by an emulated transport, not real hardware
        const EMULATED               = 1 << 12;
        /// Records transport traffic for later emulation
        const EMULATION_TAG          = 1 << 13;
        /// Is locked and must be unlocked before updating
        const LOCKED                 = 1 << 14;
        /// More than one firmware branch is available
        const HAS_MULTIPLE_BRANCHES  = 1 << 15;
        /// Install result was reported upstream
        const REPORTED               = 1 << 16;
        /// Requires AC power before flashing
        const REQUIRE_AC             = 1 << 17;
        /// Install composite firmware on the parent before the children
        const INSTALL_PARENT_FIRST   = 1 << 18;
    }
}

bitflags! {
    /// Transient conditions preventing an update right now.
    ///
    /// Problems clear on their own when the condition passes; they are
    /// never persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DeviceProblems: u64 {
        /// System battery too low to safely flash
        const BATTERY_LOW        = 1 << 0;
        /// Laptop lid is closed
        const LID_CLOSED         = 1 << 1;
        /// Device did not answer its transport
        const UNREACHABLE        = 1 << 2;
        /// An update is staged and waiting for activation
        const UPDATE_PENDING     = 1 << 3;
        /// External power is required but absent
        const POWER_TOO_LOW      = 1 << 4;
        /// Another install on the same composite unit is running
        const IN_USE             = 1 << 5;
    }
}

impl DeviceFlags {
    /// The subset carried over to the replacement device on a replug.
    ///
    /// Mode flags like `IS_BOOTLOADER` must come from the new probe, not
    /// the donor.
    pub fn replug_carryover(self) -> Self {
        self & (DeviceFlags::UPDATABLE
            | DeviceFlags::SUPPORTED
            | DeviceFlags::NEEDS_REBOOT
            | DeviceFlags::NEEDS_ACTIVATION
            | DeviceFlags::SIGNED_PAYLOAD
            | DeviceFlags::UNSIGNED_PAYLOAD
            | DeviceFlags::EMULATED
            | DeviceFlags::HAS_MULTIPLE_BRANCHES)
    }
}
