//! Error types for transports and configuration loading.
//!
//! `ChatConnection` itself never returns these to callers; transport
//! failures are logged and turned into reconnect attempts.

use std::path::PathBuf;
use std::string::FromUtf8Error;
use std::time::Duration;

/// Failure of a single transport operation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no line received within {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("received line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("received line is not valid UTF-8")]
    Decode(#[from] FromUtf8Error),
    #[error("transport is not connected")]
    NotConnected,
    #[error("tls error: {0}")]
    Tls(String),
}

/// Failure to load `AuthOptions`. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("can't read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad config: {0}")]
    Parse(#[from] serde_json::Error),
}
