//! Data packet encode/decode.
//!
//! A packet starts with a 4-byte little-endian sequence number. The body is
//! either a command sub-packet, recognized by a 16-byte magic prefix, or one
//! or more strip state entries (`strip_number u8` followed by
//! `pixels_per_strip * 3` RGB bytes). Strip entries carry no length of their
//! own, so decoding needs the target device's pixels-per-strip value from
//! its discovery headers.

use crate::error::{Error, Result};
use crate::protocol::pixel::StripState;

/// Magic prefix marking a command sub-packet.
pub const COMMAND_MAGIC: [u8; 16] = [
    0x40, 0x09, 0x2D, 0xA6, 0x15, 0xA5, 0xDD, 0xE5, 0x6A, 0x9D, 0x4D, 0x5A, 0xCF, 0x09, 0xAF,
    0x50,
];

const CMD_RESET: u8 = 0x01;
const CMD_GLOBAL_BRIGHTNESS: u8 = 0x02;
const CMD_WIFI_CONFIGURE: u8 = 0x03;
const CMD_LED_CONFIGURE: u8 = 0x04;
const CMD_STRIP_BRIGHTNESS: u8 = 0x05;

/// A device command carried in a command sub-packet.
///
/// The WiFi and LED configuration commands carry firmware-defined payloads
/// that the proxy never interprets; they are kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reset,
    GlobalBrightness(u16),
    StripBrightness { strip: u8, brightness: u16 },
    WifiConfigure(Vec<u8>),
    LedConfigure(Vec<u8>),
}

impl Command {
    fn decode(buf: &[u8]) -> Result<Self> {
        let (&id, rest) = buf
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty command sub-packet".to_string()))?;

        match id {
            CMD_RESET => Ok(Command::Reset),
            CMD_GLOBAL_BRIGHTNESS => {
                if rest.len() < 2 {
                    return Err(Error::InvalidInput(
                        "short global brightness command".to_string(),
                    ));
                }
                Ok(Command::GlobalBrightness(u16::from_le_bytes([
                    rest[0], rest[1],
                ])))
            }
            CMD_STRIP_BRIGHTNESS => {
                if rest.len() < 3 {
                    return Err(Error::InvalidInput(
                        "short strip brightness command".to_string(),
                    ));
                }
                Ok(Command::StripBrightness {
                    strip: rest[0],
                    brightness: u16::from_le_bytes([rest[1], rest[2]]),
                })
            }
            CMD_WIFI_CONFIGURE => Ok(Command::WifiConfigure(rest.to_vec())),
            CMD_LED_CONFIGURE => Ok(Command::LedConfigure(rest.to_vec())),
            other => Err(Error::InvalidInput(format!("unknown command {:#04x}", other))),
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&COMMAND_MAGIC);
        match self {
            Command::Reset => buf.push(CMD_RESET),
            Command::GlobalBrightness(v) => {
                buf.push(CMD_GLOBAL_BRIGHTNESS);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Command::StripBrightness { strip, brightness } => {
                buf.push(CMD_STRIP_BRIGHTNESS);
                buf.push(*strip);
                buf.extend_from_slice(&brightness.to_le_bytes());
            }
            Command::WifiConfigure(payload) => {
                buf.push(CMD_WIFI_CONFIGURE);
                buf.extend_from_slice(payload);
            }
            Command::LedConfigure(payload) => {
                buf.push(CMD_LED_CONFIGURE);
                buf.extend_from_slice(payload);
            }
        }
    }
}

/// Packet body: one command, or one or more strip states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Command(Command),
    StripStates(Vec<StripState>),
}

/// A parsed data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    pub body: PacketBody,
}

impl Packet {
    /// Decode a datagram addressed to a device with the given
    /// pixels-per-strip configuration.
    pub fn decode(buf: &[u8], pixels_per_strip: u16) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::InvalidInput(format!(
                "packet too short: {} bytes",
                buf.len()
            )));
        }
        let sequence = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let rest = &buf[4..];

        if rest.starts_with(&COMMAND_MAGIC) {
            let command = Command::decode(&rest[COMMAND_MAGIC.len()..])?;
            return Ok(Packet {
                sequence,
                body: PacketBody::Command(command),
            });
        }

        let entry_len = 1 + pixels_per_strip as usize * 3;
        if rest.is_empty() || rest.len() % entry_len != 0 {
            return Err(Error::InvalidInput(format!(
                "packet body of {} bytes is not a whole number of {}-byte strip entries",
                rest.len(),
                entry_len
            )));
        }

        let states = rest
            .chunks_exact(entry_len)
            .map(|chunk| StripState::from_raw(chunk[0], chunk[1..].to_vec()))
            .collect();

        Ok(Packet {
            sequence,
            body: PacketBody::StripStates(states),
        })
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        match &self.body {
            PacketBody::Command(cmd) => cmd.encode_into(&mut buf),
            PacketBody::StripStates(states) => {
                for state in states {
                    buf.push(state.strip_number);
                    buf.extend_from_slice(state.raw());
                }
            }
        }
        buf
    }

    fn encoded_len(&self) -> usize {
        4 + match &self.body {
            PacketBody::Command(_) => COMMAND_MAGIC.len() + 16,
            PacketBody::StripStates(states) => {
                states.iter().map(|s| 1 + s.raw().len()).sum::<usize>()
            }
        }
    }

    /// The strip states in this packet, if it is a pixel data packet.
    pub fn strip_states(&self) -> Option<&[StripState]> {
        match &self.body {
            PacketBody::StripStates(states) => Some(states),
            PacketBody::Command(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pixel::Pixel;

    #[test]
    fn test_strip_packet_round_trip() {
        let mut strip = StripState::new(3, 4);
        strip.set_pixel(0, Pixel::new(255, 0, 0));
        strip.set_pixel(3, Pixel::new(0, 0, 255));
        let pkt = Packet {
            sequence: 42,
            body: PacketBody::StripStates(vec![strip]),
        };

        let wire = pkt.encode();
        assert_eq!(wire.len(), 4 + 1 + 12);
        let decoded = Packet::decode(&wire, 4).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn test_multi_strip_packet() {
        let pkt = Packet {
            sequence: 1,
            body: PacketBody::StripStates(vec![StripState::new(0, 2), StripState::new(1, 2)]),
        };
        let decoded = Packet::decode(&pkt.encode(), 2).unwrap();
        assert_eq!(decoded.strip_states().unwrap().len(), 2);
    }

    #[test]
    fn test_command_round_trip() {
        for cmd in [
            Command::Reset,
            Command::GlobalBrightness(0x8000),
            Command::StripBrightness {
                strip: 2,
                brightness: 100,
            },
            Command::WifiConfigure(b"ssid\0key\0\x01".to_vec()),
            Command::LedConfigure(vec![1, 2, 3, 4]),
        ] {
            let pkt = Packet {
                sequence: 7,
                body: PacketBody::Command(cmd),
            };
            // pixels_per_strip is irrelevant for command packets.
            let decoded = Packet::decode(&pkt.encode(), 0).unwrap();
            assert_eq!(decoded, pkt);
        }
    }

    #[test]
    fn test_decode_rejects_misaligned_body() {
        let mut wire = vec![0, 0, 0, 0];
        wire.extend_from_slice(&[1, 2, 3]); // not a whole 7-byte entry for 2 px
        assert!(Packet::decode(&wire, 2).is_err());
    }

    #[test]
    fn test_decode_rejects_empty_body() {
        assert!(Packet::decode(&[0, 0, 0, 0], 2).is_err());
        assert!(Packet::decode(&[0, 0], 2).is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut wire = vec![0, 0, 0, 0];
        wire.extend_from_slice(&COMMAND_MAGIC);
        wire.push(0x7F);
        assert!(Packet::decode(&wire, 2).is_err());
    }
}
