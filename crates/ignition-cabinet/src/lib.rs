//! Cabinet archive handling for Ignition
//!
//! A cabinet is the signed container vendors ship firmware in: one or more
//! payload blobs, one or more XML metadata documents describing components
//! and their releases, and optionally a detached signature bundle covering
//! the other entries.
//!
//! # Architecture
//!
//! - [`archive`]: the deflate-compressed container itself; parsing keeps
//!   enough of the on-disk structure that [`archive::Archive::write`]
//!   re-emits the same bytes
//! - [`metadata`]: component/release/requirement documents parsed from the
//!   AppStream-style XML
//! - [`signature`]: the detached signature bundle and trust levels
//! - [`cabinet`]: the assembled view the release resolver consumes
//!
//! # Example
//!
//! ```no_run
//! use ignition_cabinet::{Cabinet, ParseLimits};
//!
//! # fn main() -> ignition_errors::Result<()> {
//! let bytes = std::fs::read("vendor-firmware.cab")?;
//! let cabinet = Cabinet::parse(&bytes, &ParseLimits::default())?;
//! for component in cabinet.components() {
//!     println!("{} with {} releases", component.id, component.releases.len());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod archive;
pub mod cabinet;
pub mod metadata;
pub mod signature;

pub use archive::{Archive, ArchiveBuilder, ArchiveEntry, ParseLimits};
pub use cabinet::Cabinet;
pub use metadata::{
    CompareOp, Component, ComponentDocument, Release, ReleaseUrgency, Requirement,
};
pub use signature::{SignatureBundle, TrustLevel};

bitflags::bitflags! {
    /// Flags relaxing individual validation steps during cabinet parse and
    /// release matching. All default off; each one is an explicit operator
    /// decision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParseFlags: u32 {
        /// Accept a payload whose declared checksums do not match
        const IGNORE_CHECKSUM = 1 << 0;
        /// Accept a release none of whose hardware-ids match the device
        const IGNORE_VID_PID  = 1 << 1;
    }
}
