//! Startup configuration.
//!
//! Credentials and gateway address live in `appsettings.json` next to the
//! process. A missing file is fatal; every other field has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file name, resolved against the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "appsettings.json";
/// Default gateway host.
pub const DEFAULT_IRC_HOST: &str = "irc.chat.twitch.tv";
/// Default web (OAuth) host.
pub const DEFAULT_WEB_HOST: &str = "https://id.twitch.tv";
/// Default gateway port (plaintext).
pub const DEFAULT_PORT: u16 = 80;
/// Gateway port that implies TLS.
pub const TLS_PORT: u16 = 6697;
/// Fixed pause between failed connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Idle read limit. The gateway pings roughly every five minutes.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(360);

/// Credentials and endpoints (persisted in appsettings.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOptions {
    /// OAuth token for the bot account.
    #[serde(rename = "OAuth")]
    pub oauth: String,
    /// Bot login, used as the IRC nick.
    #[serde(rename = "Login")]
    pub login: String,
    /// Application client id. Not used by the chat connection.
    #[serde(rename = "Client-ID", default)]
    pub client_id: Option<String>,
    /// Application client secret. Not used by the chat connection.
    #[serde(rename = "Secret-Client-ID", default)]
    pub secret_client_id: Option<String>,
    #[serde(rename = "WebHost", default = "default_web_host")]
    pub web_host: String,
    #[serde(rename = "IrcHost", default = "default_irc_host")]
    pub irc_host: String,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
    /// Rooms to join on startup.
    #[serde(rename = "Channels", default)]
    pub channels: Vec<ChannelOptions>,
}

fn default_web_host() -> String {
    DEFAULT_WEB_HOST.to_string()
}

fn default_irc_host() -> String {
    DEFAULT_IRC_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl AuthOptions {
    /// Load from a JSON file. Fails with [`ConfigError::NotFound`] if the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Log the startup configuration. Secrets are redacted.
    pub fn log_summary(&self) {
        tracing::info!("Startup configuration:");
        tracing::info!("IrcHost: {}", self.irc_host);
        tracing::info!("WebHost: {}", self.web_host);
        tracing::info!("Port: {}", self.port);
        tracing::info!("Login: {}", self.login);
        tracing::info!("OAuth: {}", redact(&self.oauth));
        tracing::info!("Client-ID: {}", self.client_id.as_deref().unwrap_or("-"));
        tracing::info!(
            "Secret-Client-ID: {}",
            self.secret_client_id.as_deref().map(redact).unwrap_or("-")
        );
    }

    /// Connection settings derived from these options, other knobs at defaults.
    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig {
            host: self.irc_host.clone(),
            port: self.port,
            ..ConnectConfig::new(&self.login, &self.oauth)
        }
    }

    pub fn rooms(&self) -> Vec<Channel> {
        self.channels.iter().cloned().map(Channel::from).collect()
    }
}

/// One room entry in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOptions {
    #[serde(rename = "Name")]
    pub name: String,
    /// Token for managing the channel, if the bot moderates it.
    #[serde(rename = "Token", default)]
    pub token: Option<String>,
}

/// A room the bot knows about. Only the name is used on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub token: Option<String>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: None,
        }
    }
}

impl From<ChannelOptions> for Channel {
    fn from(options: ChannelOptions) -> Self {
        Self {
            name: options.name,
            token: options.token,
        }
    }
}

/// Identity and tuning for one [`ChatConnection`](crate::ChatConnection).
/// Immutable once the connection is built.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// OAuth token sent in `PASS`.
    pub token: String,
    /// Bot login sent in `NICK`.
    pub login: String,
    pub host: String,
    pub port: u16,
    /// Idle read limit applied by the transport.
    pub receive_timeout: Duration,
    /// Pause between failed connect attempts. No growth, no attempt cap.
    pub retry_delay: Duration,
    /// Use TLS. Implied by port 6697.
    pub tls: bool,
    /// Remember joined rooms and re-send `JOIN` after every new handshake.
    /// Off by default: callers re-join rooms themselves.
    pub rejoin_rooms: bool,
    /// Write the raw token into handshake logs. Off by default.
    pub log_token: bool,
}

impl ConnectConfig {
    pub fn new(login: &str, token: &str) -> Self {
        Self {
            token: token.to_string(),
            login: login.to_string(),
            host: DEFAULT_IRC_HOST.to_string(),
            port: DEFAULT_PORT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            tls: false,
            rejoin_rooms: false,
            log_token: false,
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn use_tls(&self) -> bool {
        self.tls || self.port == TLS_PORT
    }
}

/// Mask a secret for log output.
pub(crate) fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "***" }
}
