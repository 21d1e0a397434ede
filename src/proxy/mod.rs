//! Proxy device management.
//!
//! For every discovered device the manager materializes a proxy device: a
//! synthetic PixelPusher whose MAC is the configured 3-byte prefix followed
//! by the low 3 bytes of the real device's MAC, advertising the real
//! device's strip configuration on its own UDP socket. Packets arriving on
//! that socket are forwarded verbatim to the real device (unless a
//! forwarding lease is held) and delivered, parsed, to the listener set.
//!
//! Forwarding leases form a multiset keyed by holder identity. Forwarding is
//! enabled exactly when the multiset is empty; the player and the controller
//! hold distinct lease identities so either can suppress forwarding without
//! stepping on the other.

pub mod auto_resume;

pub use auto_resume::AutoResumeListener;

use crate::cancel::CancelToken;
use crate::device::{Device, DeviceId, ListenerSet, PacketListener, Registry};
use crate::error::{Error, Result};
use crate::net;
use crate::protocol::Packet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Largest datagram accepted on a proxy socket.
const MAX_PACKET_DATAGRAM: usize = 65536;

struct ProxyEntry {
    device: Arc<Device>,
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ManagerState {
    /// Real device ID -> proxy entry.
    proxies: HashMap<DeviceId, ProxyEntry>,
    /// Lease holder -> count.
    leases: HashMap<String, usize>,
    closed: bool,
}

/// Owns proxy devices and the forwarding lease multiset.
pub struct ProxyManager {
    prefix: [u8; 3],
    proxy_ip: Ipv4Addr,
    group_offset: i32,
    registry: Arc<Registry>,
    listeners: Arc<ListenerSet>,
    state: Mutex<ManagerState>,
    token: CancelToken,
}

impl ProxyManager {
    pub fn new(
        prefix: [u8; 3],
        proxy_ip: Ipv4Addr,
        group_offset: i32,
        registry: Arc<Registry>,
        token: CancelToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            proxy_ip,
            group_offset,
            registry,
            listeners: Arc::new(ListenerSet::new()),
            state: Mutex::new(ManagerState::default()),
            token,
        })
    }

    pub fn group_offset(&self) -> i32 {
        self.group_offset
    }

    /// True if the MAC carries this manager's proxy prefix.
    pub fn is_proxy_device_addr(&self, mac: &[u8; 6]) -> bool {
        mac[..3] == self.prefix
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) {
        self.listeners.remove(listener);
    }

    /// Take out a forwarding lease for `holder`. Multiset semantics: each
    /// add must be matched by a remove before the holder's lease clears.
    pub fn add_lease(&self, holder: &str) {
        let mut state = self.state.lock();
        *state.leases.entry(holder.to_string()).or_insert(0) += 1;
        log::debug!("lease added by {:?}; forwarding disabled", holder);
    }

    /// Return one lease held by `holder`. Returning a lease that is not held
    /// is a no-op.
    pub fn remove_lease(&self, holder: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.leases.get_mut(holder) {
            *count -= 1;
            if *count == 0 {
                state.leases.remove(holder);
            }
        }
        if state.leases.is_empty() {
            log::debug!("all leases returned; forwarding enabled");
        }
    }

    /// Forwarding is enabled iff no leases are held.
    pub fn forwarding(&self) -> bool {
        self.state.lock().leases.is_empty()
    }

    /// A stable snapshot of the current proxy devices, ID-ordered.
    pub fn proxy_devices(&self) -> Vec<Arc<Device>> {
        let state = self.state.lock();
        let mut devices: Vec<_> = state.proxies.values().map(|e| Arc::clone(&e.device)).collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    /// Create a proxy for a newly discovered device. Re-adding a device that
    /// already has a proxy is a no-op.
    pub fn add_device(self: &Arc<Self>, real: &Arc<Device>) -> Result<()> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::Cancelled);
            }
            if state.proxies.contains_key(real.id()) {
                return Ok(());
            }
        }

        let real_headers = real.headers();
        let mut mac = [0u8; 6];
        mac[..3].copy_from_slice(&self.prefix);
        mac[3..].copy_from_slice(&real_headers.mac[3..]);

        // The proxy inherits the real device's strip configuration and
        // answers on its own ephemeral port.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_read_timeout(Some(net::RECV_POLL_INTERVAL))?;
        let port = socket.local_addr()?.port();

        let mut headers = real_headers.clone();
        headers.mac = mac;
        headers.ip = self.proxy_ip;
        headers.my_port = port;
        headers.group_ordinal = real_headers.group_ordinal + self.group_offset;
        headers.delta_sequence = 0;

        let addr = SocketAddr::V4(SocketAddrV4::new(self.proxy_ip, port));
        let proxy_device = Device::proxy(headers, addr, real.id().clone());

        log::info!(
            "created proxy {} (port {}) for device {}",
            proxy_device.id(),
            port,
            real.id()
        );

        let token = self.token.child();
        let thread = {
            let manager = Arc::clone(self);
            let proxy_device = Arc::clone(&proxy_device);
            let real = Arc::clone(real);
            let thread_token = token.clone();
            std::thread::Builder::new()
                .name(format!("proxy-rx-{}", real.id()))
                .spawn(move || {
                    manager.receive_loop(socket, proxy_device, real, thread_token);
                })?
        };

        self.registry.add(Arc::clone(&proxy_device));
        let mut state = self.state.lock();
        if state.closed {
            // Close raced the pairing; tear the fresh proxy straight down.
            drop(state);
            token.cancel();
            self.registry.remove(proxy_device.id());
            let _ = thread.join();
            return Err(Error::Cancelled);
        }
        state.proxies.insert(
            real.id().clone(),
            ProxyEntry {
                device: proxy_device,
                token,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    /// Tear down the proxy paired with a removed real device.
    pub fn remove_device(&self, real_id: &str) {
        let entry = self.state.lock().proxies.remove(real_id);
        if let Some(mut entry) = entry {
            log::info!("removing proxy {} for device {}", entry.device.id(), real_id);
            entry.token.cancel();
            self.registry.remove(entry.device.id());
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
        }
    }

    /// Close all proxies and stop accepting new devices.
    pub fn close(&self) {
        let entries: Vec<ProxyEntry> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.proxies.drain().map(|(_, e)| e).collect()
        };
        for mut entry in entries {
            entry.token.cancel();
            self.registry.remove(entry.device.id());
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
        }
        log::debug!("proxy manager closed");
    }

    fn receive_loop(
        &self,
        socket: UdpSocket,
        proxy_device: Arc<Device>,
        real: Arc<Device>,
        token: CancelToken,
    ) {
        // Dedicated sender for forwarded traffic, kept apart from the
        // receive socket so the proxy's advertised port never shows up as
        // the forwarding source.
        let mut forward = net::ResilientUdpSender::new(real.addr());
        let mut buf = [0u8; MAX_PACKET_DATAGRAM];

        while !token.is_cancelled() {
            let (n, _src) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e) if net::is_timeout(e) => continue,
                Err(e) => {
                    if token.is_cancelled() {
                        break;
                    }
                    log::warn!("proxy {} receive error: {}", proxy_device.id(), e);
                    continue;
                }
            };

            proxy_device.stats().record_received(n);

            // Forwarding requires an empty lease set and a live real device.
            let forwarded = self.forwarding() && self.registry.contains(real.id());
            if forwarded {
                let real_addr = real.addr();
                if forward.target() != real_addr {
                    forward = net::ResilientUdpSender::new(real_addr);
                }
                match forward.send(&buf[..n]) {
                    Ok(()) => real.stats().record_sent(n),
                    Err(e) => {
                        log::warn!("failed to forward to {}: {}", real.id(), e);
                    }
                }
            }

            let pixels_per_strip = real.headers().pixels_per_strip;
            match Packet::decode(&buf[..n], pixels_per_strip) {
                Ok(packet) => self.listeners.notify(&real, &packet, forwarded),
                Err(e) => {
                    log::trace!("unparseable packet on proxy {}: {}", proxy_device.id(), e);
                }
            }
        }

        log::debug!("proxy {} receive loop stopped", proxy_device.id());
    }

    /// Deliver a packet straight to the listener set, standing in for the
    /// receive loop.
    #[cfg(test)]
    pub(crate) fn test_notify(&self, device: &Arc<Device>, packet: &Packet, forwarded: bool) {
        self.listeners.notify(device, packet, forwarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ListenerFn;
    use crate::protocol::{DiscoveryHeaders, PacketBody, StripState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PREFIX: [u8; 3] = [0xE1, 0x2E, 0xC7];

    fn manager(registry: &Arc<Registry>, group_offset: i32) -> Arc<ProxyManager> {
        ProxyManager::new(
            PREFIX,
            Ipv4Addr::new(127, 0, 0, 1),
            group_offset,
            Arc::clone(registry),
            CancelToken::new(),
        )
    }

    fn real_device(registry: &Arc<Registry>) -> (Arc<Device>, UdpSocket) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let headers = DiscoveryHeaders {
            mac: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            ip: Ipv4Addr::new(127, 0, 0, 1),
            group_ordinal: 2,
            controller_ordinal: 7,
            strips_attached: 4,
            pixels_per_strip: 128,
            my_port: socket.local_addr().unwrap().port(),
            ..DiscoveryHeaders::default()
        };
        let device = Device::discovered(headers, socket.local_addr().unwrap());
        registry.add(Arc::clone(&device));
        (device, socket)
    }

    fn pixel_packet() -> Packet {
        Packet {
            sequence: 3,
            body: PacketBody::StripStates(vec![StripState::new(1, 128)]),
        }
    }

    #[test]
    fn test_proxy_pairing() {
        let registry = Arc::new(Registry::new());
        let mgr = manager(&registry, 10);
        let (real, _socket) = real_device(&registry);

        mgr.add_device(&real).unwrap();
        let proxies = mgr.proxy_devices();
        assert_eq!(proxies.len(), 1);

        let proxy = &proxies[0];
        let headers = proxy.headers();
        assert_eq!(&headers.mac[..3], &PREFIX);
        assert_eq!(&headers.mac[3..], &[0x33, 0x44, 0x55]);
        assert_eq!(headers.group_ordinal, 12);
        assert_eq!(headers.controller_ordinal, 7);
        assert_eq!(headers.strips_attached, 4);
        assert_eq!(headers.pixels_per_strip, 128);
        assert_ne!(headers.my_port, 0);
        assert!(mgr.is_proxy_device_addr(&headers.mac));

        // The proxy is registered so the router can target it.
        assert!(registry.contains(proxy.id()));
        assert_eq!(proxy.proxied_id().unwrap(), real.id());

        // Adding the same device again is a no-op.
        mgr.add_device(&real).unwrap();
        assert_eq!(mgr.proxy_devices().len(), 1);

        mgr.close();
    }

    #[test]
    fn test_forwarding_path() {
        let registry = Arc::new(Registry::new());
        let mgr = manager(&registry, 0);
        let (real, real_socket) = real_device(&registry);
        mgr.add_device(&real).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let forwarded_flag = Arc::new(AtomicUsize::new(99));
        let (s, f) = (Arc::clone(&seen), Arc::clone(&forwarded_flag));
        mgr.add_listener(Arc::new(ListenerFn(move |_: &Arc<Device>, _: &Packet, fwd: bool| {
            s.fetch_add(1, Ordering::SeqCst);
            f.store(fwd as usize, Ordering::SeqCst);
        })));

        let proxy_port = mgr.proxy_devices()[0].headers().my_port;
        let wire = pixel_packet().encode();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&wire, ("127.0.0.1", proxy_port))
            .unwrap();

        // The exact datagram bytes arrive at the real device.
        let mut buf = [0u8; MAX_PACKET_DATAGRAM];
        let (n, _) = real_socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &wire[..]);

        // The listener saw one forwarded packet.
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(forwarded_flag.load(Ordering::SeqCst), 1);

        mgr.close();
    }

    #[test]
    fn test_lease_suppresses_forwarding() {
        let registry = Arc::new(Registry::new());
        let mgr = manager(&registry, 0);
        let (real, real_socket) = real_device(&registry);
        real_socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        mgr.add_device(&real).unwrap();

        let forwarded_flag = Arc::new(AtomicUsize::new(99));
        let f = Arc::clone(&forwarded_flag);
        mgr.add_listener(Arc::new(ListenerFn(move |_: &Arc<Device>, _: &Packet, fwd: bool| {
            f.store(fwd as usize, Ordering::SeqCst);
        })));

        mgr.add_lease("test");
        assert!(!mgr.forwarding());

        let proxy_port = mgr.proxy_devices()[0].headers().my_port;
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&pixel_packet().encode(), ("127.0.0.1", proxy_port))
            .unwrap();

        // Nothing reaches the real device, but the listener still runs with
        // forwarded = false.
        let mut buf = [0u8; 64];
        assert!(real_socket.recv_from(&mut buf).is_err());
        assert_eq!(forwarded_flag.load(Ordering::SeqCst), 0);

        mgr.close();
    }

    #[test]
    fn test_lease_multiset_semantics() {
        let registry = Arc::new(Registry::new());
        let mgr = manager(&registry, 0);

        assert!(mgr.forwarding());
        mgr.add_lease("h");
        mgr.add_lease("h");
        mgr.remove_lease("h");
        assert!(!mgr.forwarding());
        mgr.remove_lease("h");
        assert!(mgr.forwarding());

        // Distinct holders are independent.
        mgr.add_lease("a");
        mgr.add_lease("b");
        mgr.remove_lease("a");
        assert!(!mgr.forwarding());
        mgr.remove_lease("b");
        assert!(mgr.forwarding());

        // Removing an unheld lease is a no-op.
        mgr.remove_lease("ghost");
        assert!(mgr.forwarding());
    }

    #[test]
    fn test_remove_device_closes_proxy() {
        let registry = Arc::new(Registry::new());
        let mgr = manager(&registry, 0);
        let (real, _socket) = real_device(&registry);
        mgr.add_device(&real).unwrap();

        let proxy_id = mgr.proxy_devices()[0].id().clone();
        mgr.remove_device(real.id());

        assert!(mgr.proxy_devices().is_empty());
        assert!(!registry.contains(&proxy_id));
    }

    #[test]
    fn test_close_rejects_new_devices() {
        let registry = Arc::new(Registry::new());
        let mgr = manager(&registry, 0);
        let (real, _socket) = real_device(&registry);

        mgr.close();
        assert!(mgr.add_device(&real).is_err());
    }
}
