//! Error types for PixelProxy
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Silent (Not Logged as Errors)
//!
//! - **`Cancelled`**: The owning cancellation token fired. Every blocking
//!   loop returns this on shutdown; callers treat it as a clean exit.
//!
//! ## Per-Packet Errors (Count and Continue)
//!
//! - **`InvalidInput`**: A datagram failed to parse, a MAC string was
//!   malformed, or an address could not be resolved. The offending input is
//!   dropped and the receive loop continues.
//!
//! - **`Encoding`**: A packet cannot be represented in a stream file. The
//!   recorder skips the event with a warning and keeps recording.
//!
//! - **`NoRoute`**: The router found no device for the requested identity.
//!   The player counts these per device and drops the event.
//!
//! ## Component-Fatal Errors
//!
//! - **`Io`** from a stream writer: the recorder stores the error, the
//!   controller detaches it, and further record calls become no-ops. The
//!   error surfaces in the next status poll.
//!
//! ## Operator Errors (Report to Caller)
//!
//! - **`NotRunning`**: A controller operation arrived before `run` took the
//!   lock or after it exited.
//! - **`NotFound`**: A storage lookup missed.
//! - **`Config`**: The configuration file is invalid. Fix and restart.
//! - **`UnsupportedSystem`**: OS power control is unavailable on this
//!   platform.

use thiserror::Error;

/// Errors that can occur in PixelProxy
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("operation cancelled")]
    Cancelled,

    #[error("controller is not running")]
    NotRunning,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("encoding not supported: {0}")]
    Encoding(String),

    #[error("no route to device {0}")]
    NoRoute(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("system control unavailable: {0}")]
    UnsupportedSystem(String),
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// True if this error is a cancellation, which loops treat as a clean
    /// exit rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
