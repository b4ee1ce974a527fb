//! twirc-sdk: a self-healing client for the Twitch IRC chat gateway.
//!
//! - [`client::ChatConnection`]: one logical session, handshake, rooms, send/receive
//! - [`transport`]: line-oriented TCP/TLS transports behind a trait seam
//! - [`config`]: `appsettings.json` loading and connection settings

pub mod client;
pub mod config;
pub mod error;
pub mod irc;
pub mod transport;

pub use client::{ChatConnection, ConnectionState};
pub use config::{AuthOptions, Channel, ChannelOptions, ConnectConfig};
pub use error::{ConfigError, TransportError};
