//! Packet routing to registered devices.

use super::{Device, DeviceId, ListenerSet, Ordinal, PacketListener, Registry};
use crate::error::{Error, Result};
use crate::net::ResilientUdpSender;
use crate::protocol::Packet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes packets to devices by identity or ordinal.
///
/// Resolution order: an explicit ID wins; otherwise a valid (group,
/// controller) ordinal is looked up; otherwise the call fails with
/// [`Error::NoRoute`]. Each resolved device gets its own datagram sender so
/// per-device send failures stay independent.
///
/// Every attempted send is also published to registered listeners; the
/// snapshot sampler uses this to observe playback-originated traffic that
/// never crosses a proxy socket.
pub struct Router {
    registry: Arc<Registry>,
    senders: Mutex<HashMap<DeviceId, ResilientUdpSender>>,
    listeners: ListenerSet,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            senders: Mutex::new(HashMap::new()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) {
        self.listeners.remove(listener);
    }

    /// Route one packet. Transient send errors are logged, counted on the
    /// sender, and returned; there are no retries at this layer.
    pub fn route(&self, ordinal: Ordinal, id: &str, packet: &Packet) -> Result<()> {
        let device = self.resolve(ordinal, id)?;
        let wire = packet.encode();
        let addr = device.addr();

        let result = {
            let mut senders = self.senders.lock();
            let sender = senders
                .entry(device.id().clone())
                .or_insert_with(|| ResilientUdpSender::new(addr));
            // Discovery refreshes can move a device; retarget on change.
            if sender.target() != addr {
                *sender = ResilientUdpSender::new(addr);
            }
            sender.send(&wire)
        };

        match result {
            Ok(()) => {
                device.stats().record_sent(wire.len());
                self.listeners.notify(&device, packet, true);
                Ok(())
            }
            Err(e) => {
                log::warn!("failed to send to device {}: {}", device.id(), e);
                Err(e)
            }
        }
    }

    fn resolve(&self, ordinal: Ordinal, id: &str) -> Result<Arc<Device>> {
        if !id.is_empty() {
            return self
                .registry
                .get(id)
                .ok_or_else(|| Error::NoRoute(id.to_string()));
        }
        if ordinal.is_valid() {
            return self
                .registry
                .find_by_ordinal(ordinal)
                .ok_or_else(|| Error::NoRoute(ordinal.to_string()));
        }
        Err(Error::NoRoute("(no id, invalid ordinal)".to_string()))
    }

    /// Drop all per-device senders.
    pub fn shutdown(&self) {
        self.senders.lock().clear();
    }
}
