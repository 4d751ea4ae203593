//! The Ignition firmware update engine
//!
//! Composes the device registry, plugin dispatch, release resolver,
//! requirements engine, install orchestrator, remote set and history
//! store into one [`Engine`] value with coarse operations: list devices,
//! find updates, install a cabinet, activate a staged update, verify
//! on-device firmware, refresh metadata, sync to a known-good tag.
//!
//! # Architecture
//!
//! - [`config`]: persisted configuration and environment knobs
//! - [`lock`]: the exclusive process lock over mutable state
//! - [`requirements`]: vendor-declared requirement evaluation
//! - [`resolver`]: cabinet-to-device release matching
//! - [`orchestrator`]: the composite install state machine
//! - [`emulated`]: the hardware-free device family used by `TestDevices`
//!   and the integration suites
//! - [`facade`]: the [`Engine`] itself
//!
//! # Example
//!
//! ```no_run
//! use ignition_engine::{EngineBuilder, EngineConfig};
//!
//! # async fn example() -> ignition_errors::Result<()> {
//! let config = EngineConfig::for_state_dir("/var/lib/ignition".into());
//! let engine = EngineBuilder::new(config).build().await?;
//! for device in engine.devices().await {
//!     println!("{}: {}", device.name, device.version.as_deref().unwrap_or("?"));
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod emulated;
pub mod facade;
pub mod lock;
pub mod orchestrator;
pub mod requirements;
pub mod resolver;

pub use config::{EngineConfig, RemoteConfig};
pub use facade::{Engine, EngineBuilder, RefreshSummary, SecuritySummary, UpdateCandidate};
pub use lock::ProcessLock;
pub use orchestrator::{DeviceOutcome, DeviceStatus, InstallReport, InstallStatus, Orchestrator};
pub use requirements::ClientCapabilities;
pub use resolver::{ResolvedInstall, resolve_cabinet};

pub use ignition_cabinet::ParseFlags;
pub use ignition_plugin::InstallFlags;
