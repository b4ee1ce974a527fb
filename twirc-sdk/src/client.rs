//! Self-healing chat connection.
//!
//! [`ChatConnection`] keeps one logical session to the gateway. Every
//! operation that finds the session down (or loses it mid-call) logs the
//! problem, re-runs the handshake and retries the same request, so callers
//! never see transport errors. The price is that an operation can block for
//! as long as the gateway stays unreachable; wrap calls in
//! `tokio::time::timeout` if you need a bound.
//!
//! ## Concurrency
//!
//! Session state (transport + output channel) sits behind one async mutex so
//! concurrent senders never interleave lines. The input channel has its own
//! mutex so a blocked read does not hold up writers. Only one handshake runs
//! at a time; callers arriving while it runs wait for the readiness signal
//! instead of starting another.
//!
//! ## Rooms
//!
//! Joined rooms are not re-joined after a reconnect unless
//! [`ConnectConfig::rejoin_rooms`] is set.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};

use crate::config::{ConnectConfig, redact};
use crate::error::TransportError;
use crate::irc;
use crate::transport::{Connector, LineSink, LineSource, TcpConnector, Transport};

/// Where the session currently is in its connect/handshake cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport, no channels.
    Disconnected,
    /// Transport created, socket connect in flight.
    Connecting,
    /// Connected, handshake lines being sent.
    Authorizing,
    /// Channels present; join/part/send/read go straight to the wire.
    Ready,
}

struct Session {
    transport: Option<Box<dyn Transport>>,
    output: Option<Box<dyn LineSink>>,
    /// Input channel of the current session, until a reader claims it.
    input: Option<Box<dyn LineSource>>,
    /// Bumped on every completed handshake.
    generation: u64,
}

struct Input {
    source: Option<Box<dyn LineSource>>,
    generation: u64,
}

pub struct ChatConnection {
    config: ConnectConfig,
    connector: Box<dyn Connector>,
    session: Mutex<Session>,
    input: Mutex<Input>,
    authorizing: AtomicBool,
    /// `Some(generation)` while a session is ready.
    ready: watch::Sender<Option<u64>>,
    state: watch::Sender<ConnectionState>,
    rooms: parking_lot::Mutex<BTreeSet<String>>,
}

impl ChatConnection {
    /// Connection over TCP (or TLS, see [`ConnectConfig::use_tls`]).
    pub fn new(config: ConnectConfig) -> Self {
        let connector = TcpConnector::from_config(&config);
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ConnectConfig, connector: impl Connector + 'static) -> Self {
        let (ready, _) = watch::channel(None);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector: Box::new(connector),
            session: Mutex::new(Session {
                transport: None,
                output: None,
                input: None,
                generation: 0,
            }),
            input: Mutex::new(Input {
                source: None,
                generation: 0,
            }),
            authorizing: AtomicBool::new(false),
            ready,
            state,
            rooms: parking_lot::Mutex::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// True while the line channels of a handshaken session are present.
    pub fn is_ready(&self) -> bool {
        self.ready.borrow().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state transitions, e.g. to surface them in a UI.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Rooms that will be re-joined after a new handshake. Always empty
    /// unless `rejoin_rooms` is set.
    pub fn tracked_rooms(&self) -> Vec<String> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Connect and run the handshake.
    ///
    /// Returns immediately if another authorization is already running, or
    /// if the session is already ready. Otherwise retries the connect step
    /// every `retry_delay` until it succeeds; there is no attempt cap.
    pub async fn authorize(&self) {
        if self.authorizing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Authorization already in progress");
            return;
        }
        let reset = InProgress(&self.authorizing);
        let mut session = self.session.lock().await;
        // Declared after `session` so the flag clears before the lock is released.
        let _in_progress = reset;

        if session.output.is_none() {
            tracing::info!("Authorizing...");
            let mut attempt: u32 = 0;
            loop {
                attempt = attempt.saturating_add(1);
                match self.handshake(&mut session).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            attempt,
                            server = %self.config.server_addr(),
                            retry_secs = self.config.retry_delay.as_secs(),
                            "Error connection..."
                        );
                        self.teardown(&mut session).await;
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
    }

    /// `JOIN #<room>`
    pub async fn join_room(&self, room: &str) {
        self.deliver(&irc::join(room)).await;
        if self.config.rejoin_rooms {
            self.rooms.lock().insert(room.to_string());
        }
    }

    /// `PART #<room>`
    pub async fn part_room(&self, room: &str) {
        self.deliver(&irc::part(room)).await;
        if self.config.rejoin_rooms {
            self.rooms.lock().remove(room);
        }
    }

    /// `PRIVMSG #<channel> :[@<mentionee>, ]<message>`
    pub async fn privmsg(&self, channel: &str, message: &str, mentionee: Option<&str>) {
        self.deliver(&irc::privmsg(channel, message, mentionee)).await;
    }

    /// Send one line as-is (e.g. `PONG :tmi.twitch.tv`).
    pub async fn send_raw(&self, line: &str) {
        self.deliver(line).await;
    }

    /// Next raw line from the gateway, verbatim minus its terminator.
    ///
    /// Read failures (EOF, receive timeout, undecodable bytes) drop the
    /// session and re-authorize; this only returns once a line arrives.
    pub async fn read_message(&self) -> String {
        let mut input = self.input.lock().await;
        loop {
            self.claim_input(&mut input).await;
            let Some(source) = input.source.as_mut() else {
                tracing::warn!("Input stream is null... Try fix it");
                self.ensure_ready().await;
                continue;
            };

            let read = source.read_line().await;
            match read {
                Ok(line) => {
                    tracing::info!("< {line}");
                    return line;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Read message aborted, invalid operation...");
                    tracing::warn!("Try initialize connection...");
                    input.source = None;
                    self.drop_session(input.generation).await;
                    self.ensure_ready().await;
                }
            }
        }
    }

    /// Dispose of the current session and authorize a fresh one.
    ///
    /// Rooms are not re-joined unless `rejoin_rooms` is set.
    pub async fn reconnect(&self) {
        tracing::info!("Reconnect...");
        {
            let mut session = self.session.lock().await;
            self.teardown(&mut session).await;
        }
        self.ensure_ready().await;
    }

    /// Write one line, re-authorizing and retrying until it goes out.
    async fn deliver(&self, line: &str) {
        loop {
            {
                let mut session = self.session.lock().await;
                let sent = match session.output.as_mut() {
                    Some(output) => Some(send(&mut **output, &[line]).await),
                    None => None,
                };
                match sent {
                    Some(Ok(())) => {
                        tracing::info!("> {line}");
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Message '{line}' hasn't been sent");
                        self.teardown(&mut session).await;
                    }
                    None => tracing::warn!("Message '{line}' hasn't been sent"),
                }
            }
            self.ensure_ready().await;
        }
    }

    /// Authorize, then wait until some session is ready. Covers the case
    /// where `authorize` returned early because another caller runs it.
    async fn ensure_ready(&self) {
        self.authorize().await;
        let mut ready = self.ready.subscribe();
        // The sender lives in `self`, so this can't observe a closed channel.
        let _ = ready.wait_for(|generation| generation.is_some()).await;
    }

    /// One connect + handshake attempt.
    async fn handshake(&self, session: &mut Session) -> Result<(), TransportError> {
        self.state.send_replace(ConnectionState::Connecting);
        let transport = session
            .transport
            .get_or_insert_with(|| self.connector.create());
        if !transport.is_connected() {
            transport.connect(&self.config.host, self.config.port).await?;
        }

        let (input, mut output) = transport.channels()?;
        self.state.send_replace(ConnectionState::Authorizing);

        let lines = irc::handshake(&self.config.token, &self.config.login);
        send(&mut *output, &lines).await?;
        for line in self.loggable(&lines) {
            tracing::info!("> {line}");
        }

        let rooms = self.tracked_rooms();
        if !rooms.is_empty() {
            let joins: Vec<String> = rooms.iter().map(|room| irc::join(room)).collect();
            send(&mut *output, &joins).await?;
            for line in &joins {
                tracing::info!("> {line}");
            }
        }

        session.generation += 1;
        session.output = Some(output);
        session.input = Some(input);
        self.state.send_replace(ConnectionState::Ready);
        self.ready.send_replace(Some(session.generation));
        tracing::info!(generation = session.generation, "Session ready");
        Ok(())
    }

    /// Handshake lines as they should appear in logs.
    fn loggable(&self, lines: &[String]) -> Vec<String> {
        if self.config.log_token {
            return lines.to_vec();
        }
        let pass = irc::pass(&self.config.token);
        lines
            .iter()
            .map(|line| {
                if *line == pass {
                    format!("PASS oauth:{}", redact(&self.config.token))
                } else {
                    line.clone()
                }
            })
            .collect()
    }

    /// Close the transport and clear both channels.
    async fn teardown(&self, session: &mut Session) {
        if let Some(mut transport) = session.transport.take() {
            transport.close().await;
        }
        session.output = None;
        session.input = None;
        self.state.send_replace(ConnectionState::Disconnected);
        self.ready.send_replace(None);
        // A reader blocked on the old source clears its own slot.
        if let Ok(mut input) = self.input.try_lock() {
            input.source = None;
        }
    }

    /// Tear down the session a failed read belonged to, unless it was
    /// already replaced.
    async fn drop_session(&self, generation: u64) {
        let mut session = self.session.lock().await;
        if session.generation == generation && session.output.is_some() {
            self.teardown(&mut session).await;
        }
    }

    /// Make sure `input` holds the current session's source, discarding one
    /// left over from an earlier session.
    async fn claim_input(&self, input: &mut Input) {
        let current = *self.ready.borrow();
        if input.source.is_some() && current == Some(input.generation) {
            return;
        }
        let mut session = self.session.lock().await;
        if let Some(source) = session.input.take() {
            input.source = Some(source);
            input.generation = session.generation;
        } else if session.generation != input.generation || session.output.is_none() {
            input.source = None;
        }
    }
}

/// Resets the in-progress flag, also when the authorize future is dropped.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Write `lines` in order, then flush once.
async fn send(output: &mut dyn LineSink, lines: &[impl AsRef<str>]) -> Result<(), TransportError> {
    for line in lines {
        output.write_line(line.as_ref()).await?;
    }
    output.flush().await
}
