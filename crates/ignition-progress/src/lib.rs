//! Hierarchical install progress for Ignition
//!
//! One install drives a tree of progress nodes: the orchestrator owns the
//! per-device node with its five weighted steps, plugins expand the write
//! step into their own sub-steps, and observers watch the root. Percentages
//! propagate upward as the weighted sum of children and are monotonic per
//! node within one operation: a late or duplicate update can never make a
//! node appear to move backwards.
//!
//! # Example
//!
//! ```
//! use ignition_progress::{Progress, ProgressStatus};
//!
//! let root = Progress::new();
//! let detach = root.add_step(ProgressStatus::DeviceBusy, 10, Some("detach"));
//! let write = root.add_step(ProgressStatus::DeviceWrite, 90, Some("write"));
//!
//! detach.finish();
//! write.set_percentage(50);
//! assert_eq!(root.percentage(), 55); // 10% + half of 90%
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

/// What the device is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    /// Nothing in flight
    #[default]
    Idle,
    /// Loading metadata or payloads
    Loading,
    /// Waiting on the device
    DeviceBusy,
    /// Transferring firmware to the device
    DeviceWrite,
    /// Reading back from the device
    DeviceRead,
    /// Verifying on-device contents
    DeviceVerify,
    /// Device is restarting or replugging
    DeviceRestart,
    /// Decompressing a payload
    Decompressing,
}

/// A snapshot published to observers whenever the root changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressUpdate {
    /// Root percentage, 0..=100
    pub percentage: u8,
    /// Status of the most recently active node
    pub status: ProgressStatus,
}

struct NodeInner {
    name: Option<String>,
    weight: u32,
    status: RwLock<ProgressStatus>,
    /// Direct percentage; ignored once the node has children.
    percentage: RwLock<u8>,
    children: RwLock<Vec<Arc<NodeInner>>>,
    parent: Weak<NodeInner>,
    root: Weak<RootShared>,
    started_at: Instant,
    finished_at: RwLock<Option<Instant>>,
}

struct RootShared {
    node: RwLock<Weak<NodeInner>>,
    tx: watch::Sender<ProgressUpdate>,
}

impl NodeInner {
    fn percentage(&self) -> u8 {
        let children = self.children.read();
        if children.is_empty() {
            return *self.percentage.read();
        }
        let total: u64 = children.iter().map(|c| u64::from(c.weight)).sum();
        if total == 0 {
            return *self.percentage.read();
        }
        let weighted: u64 = children
            .iter()
            .map(|c| u64::from(c.weight) * u64::from(c.percentage()))
            .sum();
        (weighted / total).min(100) as u8
    }
}

/// A handle onto one node of the progress tree.
///
/// Handles are cheap to clone and share; all mutation goes through short
/// critical sections that are never held across awaits.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<NodeInner>,
    shared: Arc<RootShared>,
}

impl Progress {
    /// Create a new root node.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressUpdate::default());
        let shared = Arc::new(RootShared {
            node: RwLock::new(Weak::new()),
            tx,
        });
        let inner = Arc::new(NodeInner {
            name: None,
            weight: 0,
            status: RwLock::new(ProgressStatus::Idle),
            percentage: RwLock::new(0),
            children: RwLock::new(Vec::new()),
            parent: Weak::new(),
            root: Arc::downgrade(&shared),
            started_at: Instant::now(),
            finished_at: RwLock::new(None),
        });
        *shared.node.write() = Arc::downgrade(&inner);
        Self { inner, shared }
    }

    /// Add a weighted child step.
    ///
    /// Weights are relative; they are normalized when percentages roll up.
    pub fn add_step(&self, status: ProgressStatus, weight: u32, name: Option<&str>) -> Progress {
        let child = Arc::new(NodeInner {
            name: name.map(str::to_string),
            weight,
            status: RwLock::new(status),
            percentage: RwLock::new(0),
            children: RwLock::new(Vec::new()),
            parent: Arc::downgrade(&self.inner),
            root: Arc::downgrade(&self.shared),
            started_at: Instant::now(),
            finished_at: RwLock::new(None),
        });
        self.inner.children.write().push(Arc::clone(&child));
        Progress {
            inner: child,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Set this node's percentage.
    ///
    /// Values are clamped to 0..=100 and regressions are ignored: the
    /// reported value for a node never decreases within one operation.
    pub fn set_percentage(&self, percentage: u8) {
        let percentage = percentage.min(100);
        {
            let mut current = self.inner.percentage.write();
            if percentage < *current {
                debug!(
                    node = self.inner.name.as_deref().unwrap_or("root"),
                    from = *current,
                    to = percentage,
                    "ignoring progress regression"
                );
                return;
            }
            *current = percentage;
        }
        if percentage == 100 {
            let mut finished = self.inner.finished_at.write();
            if finished.is_none() {
                *finished = Some(Instant::now());
            }
        }
        self.publish();
    }

    /// Convenience for transfer loops.
    pub fn set_fraction(&self, done: u64, total: u64) {
        if total == 0 {
            self.set_percentage(100);
        } else {
            self.set_percentage(((done.min(total) * 100) / total) as u8);
        }
    }

    /// Mark the node complete.
    pub fn finish(&self) {
        self.set_percentage(100);
    }

    /// Set the status tag; propagated to observers with the next snapshot.
    pub fn set_status(&self, status: ProgressStatus) {
        *self.inner.status.write() = status;
        self.publish();
    }

    /// The node's current status tag.
    pub fn status(&self) -> ProgressStatus {
        *self.inner.status.read()
    }

    /// The node's rolled-up percentage.
    pub fn percentage(&self) -> u8 {
        self.inner.percentage()
    }

    /// Subscribe to root snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ProgressUpdate> {
        self.shared.tx.subscribe()
    }

    fn publish(&self) {
        let Some(root) = self.shared.node.read().upgrade() else {
            return;
        };
        let update = ProgressUpdate {
            percentage: root.percentage(),
            status: *self.inner.status.read(),
        };
        // send only fails with no receivers, which is fine
        let _ = self.shared.tx.send_if_modified(|prev| {
            if *prev == update {
                false
            } else {
                trace!(percentage = update.percentage, "progress");
                *prev = update;
                true
            }
        });
    }

    /// Render per-step timings for verbose diagnostics.
    pub fn profile_report(&self) -> String {
        let mut out = String::new();
        self.profile_into(&mut out, 0);
        out
    }

    fn profile_into(&self, out: &mut String, depth: usize) {
        use std::fmt::Write as _;

        let elapsed = match *self.inner.finished_at.read() {
            Some(end) => end.duration_since(self.inner.started_at),
            None => self.inner.started_at.elapsed(),
        };
        let _ = writeln!(
            out,
            "{:indent$}{}: {}% in {:.1?}",
            "",
            self.inner.name.as_deref().unwrap_or("root"),
            self.percentage(),
            elapsed,
            indent = depth * 2
        );
        let children: Vec<Arc<NodeInner>> = self.inner.children.read().clone();
        for child in children {
            let handle = Progress {
                inner: child,
                shared: Arc::clone(&self.shared),
            };
            handle.profile_into(out, depth + 1);
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("name", &self.inner.name)
            .field("percentage", &self.percentage())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_rollup() {
        let root = Progress::new();
        let small = root.add_step(ProgressStatus::DeviceBusy, 10, Some("detach"));
        let big = root.add_step(ProgressStatus::DeviceWrite, 90, Some("write"));

        assert_eq!(root.percentage(), 0);
        small.finish();
        assert_eq!(root.percentage(), 10);
        big.set_percentage(50);
        assert_eq!(root.percentage(), 55);
        big.finish();
        assert_eq!(root.percentage(), 100);
    }

    #[test]
    fn test_regression_is_ignored() {
        let root = Progress::new();
        root.set_percentage(60);
        root.set_percentage(40);
        assert_eq!(root.percentage(), 60);
    }

    #[test]
    fn test_nested_steps() {
        let root = Progress::new();
        let write = root.add_step(ProgressStatus::DeviceWrite, 100, Some("write"));
        let erase = write.add_step(ProgressStatus::DeviceBusy, 1, Some("erase"));
        let flash = write.add_step(ProgressStatus::DeviceWrite, 3, Some("flash"));

        erase.finish();
        assert_eq!(root.percentage(), 25);
        flash.set_fraction(1, 2);
        assert_eq!(root.percentage(), 62);
        flash.finish();
        assert_eq!(root.percentage(), 100);
    }

    #[test]
    fn test_set_fraction_empty_total() {
        let root = Progress::new();
        root.set_fraction(0, 0);
        assert_eq!(root.percentage(), 100);
    }

    #[tokio::test]
    async fn test_watch_snapshots() {
        let root = Progress::new();
        let mut rx = root.subscribe();

        let step = root.add_step(ProgressStatus::DeviceWrite, 100, None);
        step.set_percentage(40);

        rx.changed().await.ok();
        let update = *rx.borrow();
        assert_eq!(update.percentage, 40);
        assert_eq!(update.status, ProgressStatus::DeviceWrite);
    }

    #[test]
    fn test_profile_report_contains_steps() {
        let root = Progress::new();
        let w = root.add_step(ProgressStatus::DeviceWrite, 100, Some("write"));
        w.finish();
        let report = root.profile_report();
        assert!(report.contains("root"));
        assert!(report.contains("write"));
    }
}
