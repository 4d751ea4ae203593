//! The device arena.
//!
//! All device state lives here, keyed by stable id. Mutation goes through
//! the write lock; observers get coalesced added/removed/changed events.
//! When a device disappears it is parked for its remove-delay; a device
//! re-appearing inside that window with a matching composite-id or
//! hardware-id takes over the parked identity and the whole round trip
//! collapses into a single `Changed` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ignition_errors::{Result, UpdateError};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::device::Device;
use crate::flags::DeviceFlags;
use crate::id::DeviceId;

/// Observation of a registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device appeared for the first time
    Added(DeviceId),
    /// A device left for good
    Removed(DeviceId),
    /// A device changed, including surviving a replug
    Changed(DeviceId),
}

struct ParkedDevice {
    device: Device,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceId, Device>,
    parked: HashMap<DeviceId, ParkedDevice>,
}

/// In-memory catalog of devices.
///
/// A handle onto shared state: clones are cheap and all observe the same
/// arena, so plugins may keep one for hotplug tasks.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    /// Subscribe to device events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Add a device, resolving replug continuity.
    ///
    /// If a parked device matches by composite-id or any hardware-id, the
    /// new instance adopts the parked identity and the registry emits one
    /// `Changed`; otherwise it is a plain `Added`. Returns the effective id.
    pub async fn add(&self, mut device: Device) -> DeviceId {
        let mut inner = self.inner.write().await;
        Self::expire_parked(&mut inner, &self.events);

        let donor_id = inner
            .parked
            .iter()
            .find(|(_, parked)| {
                parked.device.composite_id == device.composite_id
                    || parked
                        .device
                        .guids
                        .iter()
                        .any(|g| device.has_guid(g))
            })
            .map(|(id, _)| id.clone());

        if let Some(donor_id) = donor_id {
            if let Some(parked) = inner.parked.remove(&donor_id) {
                device.incorporate(&parked.device);
            }
            device.remove_flag(DeviceFlags::WAIT_FOR_REPLUG);
            let id = device.id.clone();
            info!(device = %id, name = %device.name, "device replugged");
            inner.devices.insert(id.clone(), device);
            let _ = self.events.send(DeviceEvent::Changed(id.clone()));
            return id;
        }

        let id = device.id.clone();
        debug!(device = %id, name = %device.name, plugin = %device.plugin, "device added");
        if let Some(parent_id) = device.parent_id.clone() {
            if let Some(parent) = inner.devices.get_mut(&parent_id) {
                if !parent.child_ids.contains(&id) {
                    parent.child_ids.push(id.clone());
                }
            }
        }
        inner.devices.insert(id.clone(), device);
        let _ = self.events.send(DeviceEvent::Added(id.clone()));
        id
    }

    /// Remove a device.
    ///
    /// A device with a replug grace window is parked instead of dropped;
    /// the `Removed` event fires only when the window expires without a
    /// matching re-appearance.
    pub async fn remove(&self, id: &DeviceId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let device = inner
            .devices
            .remove(id)
            .ok_or_else(|| UpdateError::not_found(format!("no device {id}")))?;

        if device.remove_delay > Duration::ZERO {
            debug!(device = %id, delay = ?device.remove_delay, "parking removed device");
            let deadline = Instant::now() + device.remove_delay;
            inner.parked.insert(id.clone(), ParkedDevice { device, deadline });
        } else {
            let _ = self.events.send(DeviceEvent::Removed(id.clone()));
        }
        Ok(())
    }

    /// Drop parked devices whose grace window has passed.
    pub async fn purge_expired(&self) {
        let mut inner = self.inner.write().await;
        Self::expire_parked(&mut inner, &self.events);
    }

    fn expire_parked(inner: &mut Inner, events: &broadcast::Sender<DeviceEvent>) {
        let now = Instant::now();
        let expired: Vec<DeviceId> = inner
            .parked
            .iter()
            .filter(|(_, parked)| parked.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            inner.parked.remove(&id);
            debug!(device = %id, "replug window expired");
            let _ = events.send(DeviceEvent::Removed(id));
        }
    }

    /// A snapshot of one device.
    pub async fn get(&self, id: &DeviceId) -> Option<Device> {
        self.inner.read().await.devices.get(id).cloned()
    }

    /// Whether the device is currently present (not parked, not gone).
    pub async fn contains(&self, id: &DeviceId) -> bool {
        self.inner.read().await.devices.contains_key(id)
    }

    /// Snapshots of every present device, ordered by priority then id.
    pub async fn all(&self) -> Vec<Device> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        devices
    }

    /// All present devices of one composite unit, install order.
    pub async fn composite_set(&self, composite_id: &DeviceId) -> Vec<Device> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| &d.composite_id == composite_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        devices
    }

    /// Mutate one device under the write lock, emitting `Changed`.
    pub async fn update<F>(&self, id: &DeviceId, mutate: F) -> Result<Device>
    where
        F: FnOnce(&mut Device),
    {
        let mut inner = self.inner.write().await;
        let device = inner
            .devices
            .get_mut(id)
            .ok_or_else(|| UpdateError::not_found(format!("no device {id}")))?;
        mutate(device);
        let snapshot = device.clone();
        let _ = self.events.send(DeviceEvent::Changed(id.clone()));
        Ok(snapshot)
    }

    /// Number of present devices.
    pub async fn len(&self) -> usize {
        self.inner.read().await.devices.len()
    }

    /// Whether no devices are present.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.devices.is_empty()
    }
}
