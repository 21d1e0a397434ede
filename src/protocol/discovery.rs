//! Discovery header encode/decode.
//!
//! Devices broadcast a fixed-layout header once a second. All multi-byte
//! fields are little-endian. Layout:
//!
//! ```text
//! offset  size  field
//!      0     6  mac
//!      6     4  ipv4
//!     10     1  device type (2 = PixelPusher)
//!     11     1  protocol version
//!     12     2  vendor id
//!     14     2  product id
//!     16     2  hardware revision
//!     18     2  software revision
//!     20     4  link speed (unused here)
//!     24     1  strips attached
//!     25     1  max strips per packet
//!     26     2  pixels per strip
//!     28     4  update period (us)
//!     32     4  power total (unused here)
//!     36     4  delta sequence
//!     40     4  controller ordinal (i32)
//!     44     4  group ordinal (i32)
//!     48     2  artnet universe
//!     50     2  artnet channel
//!     52     2  my port (extension; defaults to 9897 when absent)
//!     54     2  padding
//!     56     n  per-strip flag bytes, n = strips attached
//! ```
//!
//! Decoding tolerates headers truncated after the artnet channel (older
//! firmware omits the port extension and strip flags). Encoding always emits
//! the full layout.

use crate::error::{Error, Result};
use crate::protocol::{format_mac, parse_mac};
use std::net::Ipv4Addr;

/// UDP port devices broadcast discovery headers to.
pub const DISCOVERY_PORT: u16 = 7331;

/// Default data port assumed for headers that predate the port extension.
pub const DEFAULT_DEVICE_PORT: u16 = 9897;

/// Header length up to and including the artnet channel.
const BASE_LEN: usize = 52;
/// Header length including the port extension and padding.
const EXT_LEN: usize = 56;

/// Device type discriminator in the base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Etherdream,
    Lumiabridge,
    PixelPusher,
    Unknown(u8),
}

impl DeviceType {
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => DeviceType::Etherdream,
            1 => DeviceType::Lumiabridge,
            2 => DeviceType::PixelPusher,
            other => DeviceType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            DeviceType::Etherdream => 0,
            DeviceType::Lumiabridge => 1,
            DeviceType::PixelPusher => 2,
            DeviceType::Unknown(v) => v,
        }
    }
}

/// Parsed discovery headers for a PixelPusher device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryHeaders {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub device_type: DeviceType,
    pub protocol_version: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub hardware_revision: u16,
    pub software_revision: u16,
    pub link_speed: u32,

    pub strips_attached: u8,
    pub max_strips_per_packet: u8,
    pub pixels_per_strip: u16,
    pub update_period: u32,
    pub power_total: u32,
    pub delta_sequence: u32,
    pub controller_ordinal: i32,
    pub group_ordinal: i32,
    pub artnet_universe: u16,
    pub artnet_channel: u16,
    pub my_port: u16,
    pub strip_flags: Vec<u8>,
}

impl DiscoveryHeaders {
    /// Decode a discovery datagram.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BASE_LEN {
            return Err(Error::InvalidInput(format!(
                "discovery header too short: {} bytes",
                buf.len()
            )));
        }

        let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let i32_at = |o: usize| u32_at(o) as i32;

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[0..6]);

        let strips_attached = buf[24];

        let my_port = if buf.len() >= EXT_LEN - 2 {
            u16_at(52)
        } else {
            DEFAULT_DEVICE_PORT
        };

        // Strip flags follow the padded extension block when present.
        let mut strip_flags = Vec::new();
        if buf.len() >= EXT_LEN {
            let avail = buf.len() - EXT_LEN;
            let n = (strips_attached as usize).min(avail);
            strip_flags.extend_from_slice(&buf[EXT_LEN..EXT_LEN + n]);
        }

        Ok(Self {
            mac,
            ip: Ipv4Addr::new(buf[6], buf[7], buf[8], buf[9]),
            device_type: DeviceType::from_wire(buf[10]),
            protocol_version: buf[11],
            vendor_id: u16_at(12),
            product_id: u16_at(14),
            hardware_revision: u16_at(16),
            software_revision: u16_at(18),
            link_speed: u32_at(20),
            strips_attached,
            max_strips_per_packet: buf[25],
            pixels_per_strip: u16_at(26),
            update_period: u32_at(28),
            power_total: u32_at(32),
            delta_sequence: u32_at(36),
            controller_ordinal: i32_at(40),
            group_ordinal: i32_at(44),
            artnet_universe: u16_at(48),
            artnet_channel: u16_at(50),
            my_port,
            strip_flags,
        })
    }

    /// Encode to the full wire layout, including port extension and strip
    /// flags.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EXT_LEN + self.strips_attached as usize);
        buf.extend_from_slice(&self.mac);
        buf.extend_from_slice(&self.ip.octets());
        buf.push(self.device_type.to_wire());
        buf.push(self.protocol_version);
        buf.extend_from_slice(&self.vendor_id.to_le_bytes());
        buf.extend_from_slice(&self.product_id.to_le_bytes());
        buf.extend_from_slice(&self.hardware_revision.to_le_bytes());
        buf.extend_from_slice(&self.software_revision.to_le_bytes());
        buf.extend_from_slice(&self.link_speed.to_le_bytes());
        buf.push(self.strips_attached);
        buf.push(self.max_strips_per_packet);
        buf.extend_from_slice(&self.pixels_per_strip.to_le_bytes());
        buf.extend_from_slice(&self.update_period.to_le_bytes());
        buf.extend_from_slice(&self.power_total.to_le_bytes());
        buf.extend_from_slice(&self.delta_sequence.to_le_bytes());
        buf.extend_from_slice(&self.controller_ordinal.to_le_bytes());
        buf.extend_from_slice(&self.group_ordinal.to_le_bytes());
        buf.extend_from_slice(&self.artnet_universe.to_le_bytes());
        buf.extend_from_slice(&self.artnet_channel.to_le_bytes());
        buf.extend_from_slice(&self.my_port.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);

        let mut flags = self.strip_flags.clone();
        flags.resize(self.strips_attached as usize, 0);
        buf.extend_from_slice(&flags);

        buf
    }

    /// Canonical MAC string, used as the device ID.
    pub fn mac_string(&self) -> String {
        format_mac(&self.mac)
    }

    /// Set the MAC from a text address.
    pub fn set_mac_string(&mut self, s: &str) -> Result<()> {
        self.mac = parse_mac(s)?;
        Ok(())
    }
}

impl Default for DiscoveryHeaders {
    fn default() -> Self {
        Self {
            mac: [0; 6],
            ip: Ipv4Addr::UNSPECIFIED,
            device_type: DeviceType::PixelPusher,
            protocol_version: 1,
            vendor_id: 0,
            product_id: 0,
            hardware_revision: 0,
            software_revision: 0,
            link_speed: 0,
            strips_attached: 0,
            max_strips_per_packet: 1,
            pixels_per_strip: 0,
            update_period: 0,
            power_total: 0,
            delta_sequence: 0,
            controller_ordinal: 0,
            group_ordinal: 0,
            artnet_universe: 0,
            artnet_channel: 0,
            my_port: DEFAULT_DEVICE_PORT,
            strip_flags: Vec::new(),
        }
    }
}
