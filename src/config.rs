//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [network]
//! listen_address = "0.0.0.0:7331"
//! broadcast_address = "255.255.255.255:7331"
//!
//! [discovery]
//! expiration_secs = 60
//!
//! [proxy]
//! mac_prefix = "E1:2E:C7"
//! advertise_ip = "192.168.1.10"
//! group_offset = 0
//! broadcast_period_ms = 1000
//!
//! [playback]
//! max_lag_age_ms = 100
//! auto_resume_delay_ms = 0
//!
//! [storage]
//! root = "/var/lib/pixelproxy"
//! compression = "deflate"
//! compression_level = 6
//!
//! [snapshot]
//! enabled = false
//! sample_rate_ms = 2000
//! ```
//!
//! Every section and field is optional; the defaults above are what you get
//! with an empty file. `advertise_ip` is the one value most deployments must
//! set: it is the address proxy devices announce themselves under, so it has
//! to be reachable by the sending application.

use crate::error::{Error, Result};
use crate::protocol::parse_mac;
use crate::streamfile::Compression;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Network addresses for the discovery channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the discovery listener binds.
    ///
    /// **Format**: "host:port". A multicast host joins that group.
    pub listen_address: String,

    /// Address proxy discovery headers are broadcast to.
    pub broadcast_address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7331".to_string(),
            broadcast_address: "255.255.255.255:7331".to_string(),
        }
    }
}

/// Discovered-device bookkeeping.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Period of non-communication before a discovered device expires.
    ///
    /// **Units**: Seconds
    pub expiration_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            expiration_secs: 60,
        }
    }
}

/// Proxy device identity and advertisement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// 3-byte MAC prefix stamped on every proxy device.
    ///
    /// **Format**: "AA:BB:CC". Discovery headers carrying this prefix are
    /// ignored by the listener, so the daemon never proxies its own proxies.
    pub mac_prefix: String,

    /// IPv4 address proxy devices advertise in their headers. Must be
    /// reachable by the sending application.
    pub advertise_ip: String,

    /// Offset added to a real device's group when deriving its proxy's
    /// group. Keeps relative group ordering while separating the proxy
    /// ordinal space from the real one.
    pub group_offset: i32,

    /// Period between proxy discovery broadcasts.
    ///
    /// **Units**: Milliseconds
    pub broadcast_period_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mac_prefix: "E1:2E:C7".to_string(),
            advertise_ip: "127.0.0.1".to_string(),
            group_offset: 0,
            broadcast_period_ms: 1000,
        }
    }
}

/// Replay behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Maximum time an event may lag behind schedule before it is dropped
    /// instead of emitted. A fudge factor against host hiccups.
    ///
    /// **Units**: Milliseconds
    pub max_lag_age_ms: u64,

    /// Quiet period after which a paused playback auto-resumes, measured
    /// from the last packet seen on any proxy. 0 disables auto-resume.
    ///
    /// **Units**: Milliseconds
    pub auto_resume_delay_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_lag_age_ms: 100,
            auto_resume_delay_ms: 0,
        }
    }
}

/// Stream storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for recorded streams.
    pub root: String,

    /// Compression scheme for new streams: "deflate" or "none".
    pub compression: String,

    /// DEFLATE level, 0-9. Ignored when compression is "none".
    pub compression_level: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "/var/lib/pixelproxy".to_string(),
            compression: "deflate".to_string(),
            compression_level: 6,
        }
    }
}

/// In-memory pixel previews.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Keep sampled pixel state per device for previews.
    pub enabled: bool,

    /// Per-device sample interval.
    ///
    /// **Units**: Milliseconds
    pub sample_rate_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate_ms: 2000,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub proxy: ProxyConfig,
    pub playback: PlaybackConfig,
    pub storage: StorageConfig,
    pub snapshot: SnapshotConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;
        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.proxy_mac_prefix()?;
        self.proxy_advertise_ip()?;
        self.compression()?;
        crate::net::parse_addr(&self.network.listen_address)?;
        crate::net::parse_addr(&self.network.broadcast_address)?;
        if self.discovery.expiration_secs == 0 {
            return Err(Error::Config(
                "discovery.expiration_secs must be positive".to_string(),
            ));
        }
        if self.proxy.broadcast_period_ms == 0 {
            return Err(Error::Config(
                "proxy.broadcast_period_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The parsed 3-byte proxy MAC prefix.
    pub fn proxy_mac_prefix(&self) -> Result<[u8; 3]> {
        // Accept a full-width "AA:BB:CC" by parsing as a padded MAC.
        let padded = format!("{}:00:00:00", self.proxy.mac_prefix);
        let mac = parse_mac(&padded)
            .map_err(|_| Error::Config(format!("bad proxy.mac_prefix {:?}", self.proxy.mac_prefix)))?;
        Ok([mac[0], mac[1], mac[2]])
    }

    pub fn proxy_advertise_ip(&self) -> Result<Ipv4Addr> {
        self.proxy
            .advertise_ip
            .parse()
            .map_err(|_| Error::Config(format!("bad proxy.advertise_ip {:?}", self.proxy.advertise_ip)))
    }

    /// The configured stream compression scheme.
    pub fn compression(&self) -> Result<Compression> {
        match self.storage.compression.as_str() {
            "none" => Ok(Compression::None),
            "deflate" => {
                if self.storage.compression_level > 9 {
                    return Err(Error::Config(format!(
                        "storage.compression_level must be 0-9 (got {})",
                        self.storage.compression_level
                    )));
                }
                Ok(Compression::Deflate {
                    level: self.storage.compression_level,
                })
            }
            other => Err(Error::Config(format!(
                "unknown storage.compression {:?}",
                other
            ))),
        }
    }

    pub fn discovery_expiration(&self) -> Duration {
        Duration::from_secs(self.discovery.expiration_secs)
    }

    pub fn broadcast_period(&self) -> Duration {
        Duration::from_millis(self.proxy.broadcast_period_ms)
    }

    pub fn max_lag_age(&self) -> Duration {
        Duration::from_millis(self.playback.max_lag_age_ms)
    }

    pub fn auto_resume_delay(&self) -> Duration {
        Duration::from_millis(self.playback.auto_resume_delay_ms)
    }

    pub fn snapshot_sample_rate(&self) -> Duration {
        Duration::from_millis(self.snapshot.sample_rate_ms)
    }
}
