//! Shared device registry.
//!
//! Holds every known device, real and proxy, keyed by ID. Reads vastly
//! outnumber writes (every routed packet resolves here), so the map sits
//! behind a reader/writer lock and iteration always happens over a snapshot
//! taken outside the lock.

use super::{Device, DeviceId, Ordinal};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct Registry {
    devices: RwLock<HashMap<DeviceId, Arc<Device>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for a device.
    ///
    /// Refreshes of an existing device normally go through
    /// [`Device::observe`] on the shared record instead; `add` replaces the
    /// `Arc` itself.
    pub fn add(&self, device: Arc<Device>) {
        self.devices.write().insert(device.id().clone(), device);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// An ID-ordered copy for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    /// Find a device by (group, controller). Linear scan; when several
    /// devices carry the same ordinal the most recently observed wins.
    pub fn find_by_ordinal(&self, ordinal: Ordinal) -> Option<Arc<Device>> {
        if !ordinal.is_valid() {
            return None;
        }
        self.devices
            .read()
            .values()
            .filter(|d| d.ordinal() == ordinal)
            .max_by_key(|d| d.observed_at())
            .cloned()
    }
}
