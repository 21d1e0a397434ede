//! Sampled pixel snapshots for device previews.

use super::{Device, DeviceId};
use crate::protocol::{Packet, StripState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct DeviceSnapshot {
    strips: BTreeMap<u8, StripState>,
    last_sample: Instant,
}

/// Keeps the most recently sampled strip state per device.
///
/// Sampling is rate limited per device; packets arriving inside the sample
/// window are dropped cheaply on the receive thread. Only pixel data packets
/// are sampled.
pub struct SnapshotManager {
    sample_rate: Duration,
    snapshots: Mutex<HashMap<DeviceId, DeviceSnapshot>>,
}

impl SnapshotManager {
    pub fn new(sample_rate: Duration) -> Self {
        Self {
            sample_rate,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Offer a packet for sampling.
    pub fn handle_packet(&self, device: &Arc<Device>, packet: &Packet) {
        let states = match packet.strip_states() {
            Some(states) => states,
            None => return,
        };

        let mut snapshots = self.snapshots.lock();
        let entry = snapshots.entry(device.id().clone());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let snap = e.get_mut();
                if snap.last_sample.elapsed() < self.sample_rate {
                    return;
                }
                for state in states {
                    snap.strips.insert(state.strip_number, state.clone());
                }
                snap.last_sample = Instant::now();
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                let mut strips = BTreeMap::new();
                for state in states {
                    strips.insert(state.strip_number, state.clone());
                }
                e.insert(DeviceSnapshot {
                    strips,
                    last_sample: Instant::now(),
                });
            }
        }
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.snapshots.lock().contains_key(id)
    }

    /// The sampled strips for a device, ordered by strip number.
    pub fn snapshot_for(&self, id: &str) -> Option<Vec<StripState>> {
        self.snapshots
            .lock()
            .get(id)
            .map(|s| s.strips.values().cloned().collect())
    }

    /// Drop the snapshot for a removed device.
    pub fn remove(&self, id: &str) {
        self.snapshots.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DiscoveryHeaders, PacketBody, Pixel};

    fn test_device() -> Arc<Device> {
        let headers = DiscoveryHeaders {
            mac: [0, 0, 0, 0, 0, 9],
            strips_attached: 2,
            pixels_per_strip: 2,
            ..DiscoveryHeaders::default()
        };
        Device::discovered(headers, "10.0.0.9:5000".parse().unwrap())
    }

    fn packet_with_pixel(strip: u8, p: Pixel) -> Packet {
        let mut state = StripState::new(strip, 2);
        state.set_pixel(0, p);
        Packet {
            sequence: 0,
            body: PacketBody::StripStates(vec![state]),
        }
    }

    #[test]
    fn test_first_packet_sampled() {
        let mgr = SnapshotManager::new(Duration::from_secs(10));
        let device = test_device();
        assert!(!mgr.has_snapshot(device.id()));

        mgr.handle_packet(&device, &packet_with_pixel(0, Pixel::new(1, 2, 3)));
        let strips = mgr.snapshot_for(device.id()).unwrap();
        assert_eq!(strips.len(), 1);
        assert_eq!(strips[0].pixel(0), Pixel::new(1, 2, 3));
    }

    #[test]
    fn test_rate_limit_drops_followup() {
        let mgr = SnapshotManager::new(Duration::from_secs(10));
        let device = test_device();

        mgr.handle_packet(&device, &packet_with_pixel(0, Pixel::new(1, 1, 1)));
        mgr.handle_packet(&device, &packet_with_pixel(0, Pixel::new(2, 2, 2)));

        let strips = mgr.snapshot_for(device.id()).unwrap();
        assert_eq!(strips[0].pixel(0), Pixel::new(1, 1, 1));
    }

    #[test]
    fn test_resamples_after_window() {
        let mgr = SnapshotManager::new(Duration::from_millis(1));
        let device = test_device();

        mgr.handle_packet(&device, &packet_with_pixel(0, Pixel::new(1, 1, 1)));
        std::thread::sleep(Duration::from_millis(5));
        mgr.handle_packet(&device, &packet_with_pixel(1, Pixel::new(2, 2, 2)));

        // Strips accumulate across samples.
        let strips = mgr.snapshot_for(device.id()).unwrap();
        assert_eq!(strips.len(), 2);
    }

    #[test]
    fn test_command_packets_ignored() {
        let mgr = SnapshotManager::new(Duration::from_secs(1));
        let device = test_device();
        let packet = Packet {
            sequence: 0,
            body: PacketBody::Command(crate::protocol::Command::Reset),
        };
        mgr.handle_packet(&device, &packet);
        assert!(!mgr.has_snapshot(device.id()));
    }

    #[test]
    fn test_remove() {
        let mgr = SnapshotManager::new(Duration::from_secs(1));
        let device = test_device();
        mgr.handle_packet(&device, &packet_with_pixel(0, Pixel::new(1, 1, 1)));
        mgr.remove(device.id());
        assert!(!mgr.has_snapshot(device.id()));
    }
}
