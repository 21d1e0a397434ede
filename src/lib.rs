//! PixelProxy - recording and replaying proxy for PixelPusher LED controllers
//!
//! The daemon sits between a sending application and a fleet of PixelPusher
//! devices. For every device it discovers it advertises a synthetic proxy
//! device and forwards packets addressed to the proxy on to the real
//! hardware, while recording the traffic to disk and replaying stored
//! streams on demand.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod net;
pub mod protocol;
pub mod proxy;
pub mod replay;
pub mod storage;
pub mod streamfile;
pub mod system;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use config::Config;
pub use controller::Controller;
pub use error::{Error, Result};
