//! twirc-bot: a chat bot process for the Twitch IRC gateway.
//!
//! Loads credentials from `appsettings.json`, opens one chat connection,
//! joins the configured rooms and then reads lines forever. The connection
//! heals itself; this loop only answers `PING` and follows the gateway's
//! `RECONNECT` request, re-joining rooms afterwards.
//!
//! Logs go to stderr; set `TWIRC_LOG_JSON=1` for JSON output and `RUST_LOG`
//! to change the filter.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use twirc_sdk::config::{DEFAULT_CONFIG_FILE, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RETRY_DELAY};
use twirc_sdk::{AuthOptions, Channel, ChatConnection};

#[derive(Parser)]
#[command(name = "twirc-bot", about = "Chat bot for the Twitch IRC gateway")]
struct Args {
    /// Path to the JSON config file
    #[arg(long, env = "TWIRC_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Extra room to join (repeatable), on top of the configured ones
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Message sent to every room after joining it
    #[arg(long)]
    greeting: Option<String>,

    /// Use TLS (implied by port 6697)
    #[arg(long)]
    tls: bool,

    /// Let the connection re-join rooms after every reconnect
    #[arg(long)]
    rejoin: bool,

    /// Seconds between connect attempts
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY.as_secs())]
    retry_secs: u64,

    /// Seconds without an inbound line before the session is dropped
    #[arg(long, default_value_t = DEFAULT_RECEIVE_TIMEOUT.as_secs())]
    receive_timeout_secs: u64,
}

/// What the read loop does with one inbound line.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Reply(String),
    Reconnect,
    Ignore,
}

fn action_for(line: &str) -> Action {
    if let Some(rest) = line.strip_prefix("PING") {
        return Action::Reply(format!("PONG{rest}"));
    }
    // `:tmi.twitch.tv RECONNECT`
    if line.split(' ').nth(1) == Some("RECONNECT") {
        return Action::Reconnect;
    }
    Action::Ignore
}

fn init_logging() {
    let json_logs = std::env::var("TWIRC_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "twirc_sdk=info,twirc_bot=info".into());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn join_all(conn: &ChatConnection, rooms: &[Channel], greeting: Option<&str>) {
    for room in rooms {
        conn.join_room(&room.name).await;
        if let Some(text) = greeting {
            conn.privmsg(&room.name, text, None).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let options = AuthOptions::load(&args.config)?;
    options.log_summary();

    let mut config = options.connect_config();
    config.tls = args.tls;
    config.rejoin_rooms = args.rejoin;
    config.retry_delay = Duration::from_secs(args.retry_secs);
    config.receive_timeout = Duration::from_secs(args.receive_timeout_secs);

    let mut rooms = options.rooms();
    rooms.extend(args.channels.iter().map(Channel::new));

    tracing::info!(
        server = %config.server_addr(),
        login = %config.login,
        rooms = rooms.len(),
        "Starting twirc-bot"
    );

    let conn = ChatConnection::new(config);
    conn.authorize().await;
    join_all(&conn, &rooms, args.greeting.as_deref()).await;

    loop {
        tokio::select! {
            line = conn.read_message() => match action_for(&line) {
                Action::Reply(reply) => conn.send_raw(&reply).await,
                Action::Reconnect => {
                    conn.reconnect().await;
                    if !conn.config().rejoin_rooms {
                        join_all(&conn, &rooms, None).await;
                    }
                }
                Action::Ignore => {}
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_gets_pong() {
        assert_eq!(
            action_for("PING :tmi.twitch.tv"),
            Action::Reply("PONG :tmi.twitch.tv".to_string())
        );
    }

    #[test]
    fn reconnect_notice() {
        assert_eq!(action_for(":tmi.twitch.tv RECONNECT"), Action::Reconnect);
    }

    #[test]
    fn chat_lines_ignored() {
        let line = "@badge-info=;color=#FF0000 :alice!alice@alice.tmi.twitch.tv PRIVMSG #foo :RECONNECT";
        assert_eq!(action_for(line), Action::Ignore);
        assert_eq!(action_for(":tmi.twitch.tv 001 bot :Welcome, GLHF!"), Action::Ignore);
    }

    #[test]
    fn args_defaults() {
        let args = Args::parse_from(["twirc-bot", "--channel", "foo", "--channel", "bar"]);
        assert_eq!(args.channels, vec!["foo", "bar"]);
        assert_eq!(args.retry_secs, 60);
        assert_eq!(args.receive_timeout_secs, 360);
        assert!(!args.tls && !args.rejoin);
        assert!(args.greeting.is_none());
    }
}
