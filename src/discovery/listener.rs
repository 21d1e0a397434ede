//! Discovery broadcast listener.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::net;
use crate::protocol::DiscoveryHeaders;
use std::net::UdpSocket;

/// Largest discovery datagram we accept; real headers are well under this.
const MAX_DISCOVERY_DATAGRAM: usize = 2048;

type FilterFn = Box<dyn Fn(&DiscoveryHeaders) -> bool + Send>;

/// Listens for discovery datagrams and hands parsed headers to a handler.
///
/// A caller-supplied filter runs before the handler; the proxy manager
/// installs one that rejects headers carrying its own MAC prefix so the
/// daemon never proxies its own proxies.
pub struct Listener {
    socket: UdpSocket,
    filter: Option<FilterFn>,
}

impl Listener {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            filter: None,
        }
    }

    /// Install a filter; headers for which it returns false are dropped.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&DiscoveryHeaders) -> bool + Send + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Receive until the token is cancelled, invoking `handler` for every
    /// accepted header. Parse failures and transient socket errors are
    /// logged and skipped.
    pub fn run<F>(self, token: &CancelToken, mut handler: F) -> Result<()>
    where
        F: FnMut(DiscoveryHeaders),
    {
        let mut buf = [0u8; MAX_DISCOVERY_DATAGRAM];
        loop {
            token.check()?;

            let (n, src) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e) if net::is_timeout(e) => continue,
                Err(e) => {
                    log::warn!("discovery receive error: {}", e);
                    continue;
                }
            };

            let headers = match DiscoveryHeaders::decode(&buf[..n]) {
                Ok(h) => h,
                Err(e) => {
                    log::debug!("ignoring bad discovery datagram from {}: {}", src, e);
                    continue;
                }
            };

            if let Some(filter) = &self.filter {
                if !filter(&headers) {
                    log::trace!("filtered discovery headers for {}", headers.mac_string());
                    continue;
                }
            }

            handler(headers);
        }
    }
}
