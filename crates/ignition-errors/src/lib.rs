//! Centralized error types for Ignition
//!
//! This crate provides the unified error handling system for the Ignition
//! firmware update engine. Every fallible operation in the workspace
//! propagates a typed [`UpdateError`] rather than a plain string, so callers
//! can branch on the failure kind and the CLI can map it to the stable
//! exit-code contract.
//!
//! # Architecture
//!
//! - [`kind`]: the closed set of error kinds shared with persisted history
//!   rows and uploaded reports
//! - [`error`]: the [`UpdateError`] type carrying kind plus message
//! - [`prelude`]: convenience re-exports
//!
//! # Example
//!
//! ```
//! use ignition_errors::prelude::*;
//!
//! fn check_battery(percentage: u8) -> Result<()> {
//!     if percentage < 10 {
//!         return Err(UpdateError::new(
//!             ErrorKind::BatteryLow,
//!             "battery level too low to safely flash",
//!         ));
//!     }
//!     Ok(())
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod kind;
pub mod prelude;

pub use error::UpdateError;
pub use kind::{ErrorKind, ExitCode};

/// A specialized `Result` type for Ignition operations.
pub type Result<T> = std::result::Result<T, UpdateError>;
