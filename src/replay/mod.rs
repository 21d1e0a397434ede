//! Recording and replay of proxied packet streams.

pub mod player;
pub mod recorder;

pub use player::{NoRouteDevice, PlaybackLeaser, Player, PlayerStatus, RouteFn};
pub use recorder::{Recorder, RecorderListener, RecorderStatus};

use crate::device::Device;
use crate::streamfile::DeviceEntry;

/// Build a stream device descriptor from a live device record.
pub fn device_entry(device: &Device) -> DeviceEntry {
    let headers = device.headers();
    DeviceEntry {
        id: device.id().clone(),
        group: headers.group_ordinal,
        controller: headers.controller_ordinal,
        pixels_per_strip: headers.pixels_per_strip,
        strips_attached: headers.strips_attached,
    }
}
