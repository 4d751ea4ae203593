//! Plugin dispatch for Ignition
//!
//! Each device family ships a plugin implementing whatever subset of the
//! update capabilities its protocol needs: the orchestrator calls whichever
//! are present, and a capability a plugin does not override is an identity
//! transition, not an error.
//!
//! - [`handler`]: the [`DeviceHandler`] capability trait
//! - [`registry`]: the loaded plugin set and per-device dispatch
//! - [`firmware`]: the sealed firmware-kind registry and parse tree

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod firmware;
pub mod handler;
pub mod registry;

pub use firmware::{FirmwareKind, FirmwareKindRegistry, FirmwareTree};
pub use handler::{DeviceHandler, poll_status};
pub use registry::PluginRegistry;

bitflags::bitflags! {
    /// Operator-facing install policy flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstallFlags: u32 {
        /// Permit a downgrade
        const ALLOW_OLDER         = 1 << 0;
        /// Permit rewriting the already-installed version
        const ALLOW_REINSTALL     = 1 << 1;
        /// Permit switching firmware branch
        const ALLOW_BRANCH_SWITCH = 1 << 2;
        /// Skip the vendor-declared requirement checks
        const IGNORE_REQUIREMENTS = 1 << 3;
        /// Proceed past guard-rail problems
        const FORCE               = 1 << 4;
        /// Do not record a history row
        const NO_HISTORY          = 1 << 5;
        /// Refuse any device that is not emulated
        const ONLY_EMULATED       = 1 << 6;
        /// Do not consult remotes for missing metadata
        const NO_SEARCH           = 1 << 7;
    }
}
