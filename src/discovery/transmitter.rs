//! Discovery broadcast transmitter.

use crate::error::Result;
use crate::net::ResilientUdpSender;
use crate::protocol::DiscoveryHeaders;
use parking_lot::Mutex;
use std::net::SocketAddr;

/// Broadcasts discovery headers on behalf of proxy devices.
///
/// Wraps a resilient sender so a transient socket failure never kills the
/// broadcast loop; the next broadcast re-opens the socket.
pub struct Transmitter {
    sender: Mutex<ResilientUdpSender>,
}

impl Transmitter {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            sender: Mutex::new(ResilientUdpSender::broadcast(target)),
        }
    }

    /// Broadcast one set of headers.
    pub fn broadcast(&self, headers: &DiscoveryHeaders) -> Result<()> {
        self.sender.lock().send(&headers.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    #[test]
    fn test_broadcast_delivers_headers() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let transmitter = Transmitter::new(receiver.local_addr().unwrap());

        let headers = DiscoveryHeaders {
            mac: [0xE1, 0x2E, 0xC7, 1, 2, 3],
            strips_attached: 2,
            pixels_per_strip: 16,
            ..DiscoveryHeaders::default()
        };
        transmitter.broadcast(&headers).unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        let decoded = DiscoveryHeaders::decode(&buf[..n]).unwrap();
        assert_eq!(decoded.mac_string(), "e1:2e:c7:01:02:03");
        assert_eq!(decoded.pixels_per_strip, 16);
    }
}
