//! Device records and listener fan-out.
//!
//! Two kinds of device exist: **discovered** devices, observed on the
//! discovery channel, and **proxy** devices, synthesized by the proxy
//! manager to shadow a discovered device. Both share the same record shape;
//! the kind tag carries the shadowed device's ID for proxies. Cross
//! references between proxy and real devices are by ID, resolved through the
//! registry, so neither record owns the other.

pub mod registry;
pub mod router;
pub mod snapshot;

pub use registry::Registry;
pub use router::Router;
pub use snapshot::SnapshotManager;

use crate::protocol::{format_mac, DiscoveryHeaders, Packet};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Stable device identity: the canonical MAC string.
pub type DeviceId = String;

/// Derive the device ID for a MAC address.
pub fn id_from_mac(mac: &[u8; 6]) -> DeviceId {
    format_mac(mac)
}

/// A (group, controller) address, independent of MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ordinal {
    pub group: i32,
    pub controller: i32,
}

impl Ordinal {
    /// Sentinel for "no ordinal".
    pub const INVALID: Ordinal = Ordinal {
        group: -1,
        controller: -1,
    };

    pub fn new(group: i32, controller: i32) -> Self {
        Self { group, controller }
    }

    pub fn is_valid(&self) -> bool {
        self.group >= 0 && self.controller >= 0
    }
}

impl std::fmt::Display for Ordinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}, {}}}", self.group, self.controller)
    }
}

/// Discriminates discovered devices from the proxies that shadow them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Discovered,
    Proxy { proxied: DeviceId },
}

/// Byte and packet counters, updated lock-free from receive/send paths.
#[derive(Debug, Default)]
pub struct DeviceStats {
    bytes_received: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
}

impl DeviceStats {
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// A device record shared across the registry, router, and proxy manager.
///
/// Headers, address, and observation time have interior mutability so that
/// discovery refreshes update records in place while snapshots taken by
/// other threads keep working against the same `Arc`.
pub struct Device {
    id: DeviceId,
    kind: DeviceKind,
    created: SystemTime,
    headers: RwLock<DiscoveryHeaders>,
    addr: RwLock<SocketAddr>,
    observed: Mutex<Instant>,
    stats: DeviceStats,
}

impl Device {
    /// Create a discovered device record from its first headers.
    pub fn discovered(headers: DiscoveryHeaders, addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id: headers.mac_string(),
            kind: DeviceKind::Discovered,
            created: SystemTime::now(),
            headers: RwLock::new(headers),
            addr: RwLock::new(addr),
            observed: Mutex::new(Instant::now()),
            stats: DeviceStats::default(),
        })
    }

    /// Create a proxy device record shadowing `proxied`.
    pub fn proxy(headers: DiscoveryHeaders, addr: SocketAddr, proxied: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            id: headers.mac_string(),
            kind: DeviceKind::Proxy { proxied },
            created: SystemTime::now(),
            headers: RwLock::new(headers),
            addr: RwLock::new(addr),
            observed: Mutex::new(Instant::now()),
            stats: DeviceStats::default(),
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, DeviceKind::Proxy { .. })
    }

    /// The shadowed device's ID, for proxy devices.
    pub fn proxied_id(&self) -> Option<&DeviceId> {
        match &self.kind {
            DeviceKind::Proxy { proxied } => Some(proxied),
            DeviceKind::Discovered => None,
        }
    }

    pub fn headers(&self) -> DiscoveryHeaders {
        self.headers.read().clone()
    }

    pub fn ordinal(&self) -> Ordinal {
        let h = self.headers.read();
        Ordinal::new(h.group_ordinal, h.controller_ordinal)
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.read()
    }

    /// Refresh headers and address from a new discovery observation and bump
    /// the observed time.
    pub fn observe(&self, headers: DiscoveryHeaders, addr: SocketAddr) {
        *self.headers.write() = headers;
        *self.addr.write() = addr;
        *self.observed.lock() = Instant::now();
    }

    /// Bump the observed time without changing headers.
    pub fn touch(&self) {
        *self.observed.lock() = Instant::now();
    }

    pub fn observed_at(&self) -> Instant {
        *self.observed.lock()
    }

    pub fn observed_age(&self) -> Duration {
        self.observed.lock().elapsed()
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// A display-oriented snapshot of this device.
    pub fn info(&self) -> DeviceInfo {
        let headers = self.headers.read();
        DeviceInfo {
            id: self.id.clone(),
            kind: match &self.kind {
                DeviceKind::Discovered => "discovered",
                DeviceKind::Proxy { .. } => "proxy",
            },
            proxied_id: self.proxied_id().cloned(),
            address: *self.addr.read(),
            created: self.created,
            observed_age: self.observed_age(),
            strips: headers.strips_attached as u32,
            pixels: headers.pixels_per_strip as u32,
            group: headers.group_ordinal,
            controller: headers.controller_ordinal,
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            has_snapshot: false,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Display snapshot of a device, consumed by the control surface.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub kind: &'static str,
    pub proxied_id: Option<DeviceId>,
    pub address: SocketAddr,
    pub created: SystemTime,
    pub observed_age: Duration,
    pub strips: u32,
    pub pixels: u32,
    pub group: i32,
    pub controller: i32,
    pub bytes_received: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub has_snapshot: bool,
}

/// Receives packets observed for a device.
///
/// Listeners run on the receiving thread and must not block; slow consumers
/// interpose their own queue (the recorder does).
pub trait PacketListener: Send + Sync {
    /// `forwarded` is true when the packet was (or will be) delivered to the
    /// underlying device; false when forwarding was suppressed.
    fn on_packet(&self, device: &Arc<Device>, packet: &Packet, forwarded: bool);
}

/// Adapter turning a closure into a [`PacketListener`].
pub struct ListenerFn<F>(pub F);

impl<F> PacketListener for ListenerFn<F>
where
    F: Fn(&Arc<Device>, &Packet, bool) + Send + Sync,
{
    fn on_packet(&self, device: &Arc<Device>, packet: &Packet, forwarded: bool) {
        (self.0)(device, packet, forwarded)
    }
}

/// A set of packet listeners with identity-based removal.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn PacketListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener previously added; identity is the `Arc` allocation.
    pub fn remove(&self, listener: &Arc<dyn PacketListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn notify(&self, device: &Arc<Device>, packet: &Packet, forwarded: bool) {
        // Clone out so listeners run without holding the set lock.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_packet(device, packet, forwarded);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketBody;
    use std::sync::atomic::AtomicUsize;

    fn test_headers(mac: [u8; 6], group: i32, controller: i32) -> DiscoveryHeaders {
        DiscoveryHeaders {
            mac,
            group_ordinal: group,
            controller_ordinal: controller,
            strips_attached: 2,
            pixels_per_strip: 8,
            ..DiscoveryHeaders::default()
        }
    }

    #[test]
    fn test_ordinal_validity() {
        assert!(Ordinal::new(0, 0).is_valid());
        assert!(!Ordinal::INVALID.is_valid());
        assert!(!Ordinal::new(-1, 3).is_valid());
    }

    #[test]
    fn test_device_observe_updates_headers() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let d = Device::discovered(test_headers([0; 6], 1, 2), addr);
        assert_eq!(d.ordinal(), Ordinal::new(1, 2));

        let addr2: SocketAddr = "10.0.0.1:5001".parse().unwrap();
        d.observe(test_headers([0; 6], 3, 2), addr2);
        assert_eq!(d.ordinal(), Ordinal::new(3, 2));
        assert_eq!(d.addr(), addr2);
    }

    #[test]
    fn test_proxy_kind() {
        let addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let d = Device::proxy(
            test_headers([1; 6], 1, 2),
            addr,
            "00:11:22:33:44:55".to_string(),
        );
        assert!(d.is_proxy());
        assert_eq!(d.proxied_id().unwrap(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_listener_set_add_remove() {
        let set = ListenerSet::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let listener: Arc<dyn PacketListener> = Arc::new(ListenerFn(move |_: &Arc<Device>, _: &Packet, _: bool| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        set.add(Arc::clone(&listener));

        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let device = Device::discovered(test_headers([0; 6], 0, 0), addr);
        let packet = Packet {
            sequence: 0,
            body: PacketBody::StripStates(vec![crate::protocol::StripState::new(0, 1)]),
        };

        set.notify(&device, &packet, true);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        set.remove(&listener);
        set.notify(&device, &packet, true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }
}
