//! Remote update sources for Ignition
//!
//! A remote is a named, trusted place updates come from: a download server
//! with signed metadata, a local directory of cabinets, or a single
//! cabinet file. The [`RemoteSet`] refreshes each remote's metadata on an
//! age policy, verifies it against the remote's declared keys, and merges
//! everything into one searchable index the release resolver queries.
//!
//! Fetching is abstracted behind [`MetadataFetcher`]; the filesystem
//! implementation lives here, the HTTP one belongs to the client binary.

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod fetcher;
pub mod remote;
pub mod report;
pub mod set;

pub use fetcher::{FileFetcher, MetadataFetcher};
pub use remote::{Remote, RemoteKind};
pub use report::ReportPayload;
pub use set::{IndexedComponent, RefreshOutcome, RemoteSet};
