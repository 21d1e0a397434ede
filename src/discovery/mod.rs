//! Device discovery: registry upkeep, the broadcast listener, and the
//! proxy-side transmitter.
//!
//! The listener parses discovery datagrams and hands accepted headers to the
//! [`DiscoveryRegistry`], which upserts into the shared device registry.
//! A background sweeper expires devices that stop broadcasting. The
//! [`Transmitter`] is the outbound half, used to advertise proxy devices.

mod listener;
mod transmitter;

pub use listener::Listener;
pub use transmitter::Transmitter;

use crate::cancel::{run_every, CancelToken};
use crate::device::{Device, Registry};
use crate::error::Result;
use crate::protocol::DiscoveryHeaders;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Tracks discovered devices in the shared registry and expires the ones
/// that go quiet.
pub struct DiscoveryRegistry {
    devices: Arc<Registry>,
    expiration: Duration,
}

impl DiscoveryRegistry {
    pub fn new(devices: Arc<Registry>, expiration: Duration) -> Self {
        Self {
            devices,
            expiration,
        }
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Upsert a device from freshly observed headers. Returns the shared
    /// record and whether it was newly created.
    ///
    /// The device's packet address comes from the headers themselves: the
    /// advertised IP plus the advertised data port.
    pub fn observe(&self, headers: DiscoveryHeaders) -> (Arc<Device>, bool) {
        let id = headers.mac_string();
        let addr = SocketAddr::V4(SocketAddrV4::new(headers.ip, headers.my_port));

        if let Some(device) = self.devices.get(&id) {
            device.observe(headers, addr);
            (device, false)
        } else {
            let device = Device::discovered(headers, addr);
            log::info!("discovered new device {} at {}", id, addr);
            self.devices.add(Arc::clone(&device));
            (device, true)
        }
    }

    /// The discovered (non-proxy) devices.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .snapshot()
            .into_iter()
            .filter(|d| !d.is_proxy())
            .collect()
    }

    /// Remove devices whose observed age exceeds the expiration window,
    /// returning the removed records.
    pub fn sweep(&self) -> Vec<Arc<Device>> {
        let mut removed = Vec::new();
        for device in self.devices.snapshot() {
            if device.is_proxy() {
                continue;
            }
            if device.observed_age() > self.expiration {
                log::info!(
                    "expiring device {} (last observed {:?} ago)",
                    device.id(),
                    device.observed_age()
                );
                self.devices.remove(device.id());
                removed.push(device);
            }
        }
        removed
    }

    /// Spawn the expiration sweeper. `on_expire` runs for each removed
    /// device, off the registry lock.
    pub fn start_sweeper<F>(
        self: &Arc<Self>,
        token: CancelToken,
        on_expire: F,
    ) -> Result<JoinHandle<()>>
    where
        F: Fn(&Arc<Device>) + Send + 'static,
    {
        let registry = Arc::clone(self);
        let interval = (self.expiration / 4).max(Duration::from_millis(250));

        let handle = std::thread::Builder::new()
            .name("discovery-sweeper".to_string())
            .spawn(move || {
                let result = run_every(&token, interval, || {
                    for device in registry.sweep() {
                        on_expire(&device);
                    }
                    Ok(())
                });
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        log::error!("discovery sweeper failed: {}", e);
                    }
                }
                log::debug!("discovery sweeper stopped");
            })?;
        Ok(handle)
    }
}
