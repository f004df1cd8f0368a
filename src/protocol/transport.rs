//! Plain-TCP IRC client connection used by the daemon.
//!
//! Handles registration (PASS/CAP/NICK/USER), PING replies, and reports
//! its own JOIN/PART/KICK plus connection changes as [`TransportEvent`]s.
//! Behind a ZNC bouncer advertising `znc.in/playback` it doubles as the
//! network's [`BouncerProvider`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::error::{TransportError, TransportResult};
use crate::common::{BouncerInfo, ServerConfig, TransportEvent};
use crate::protocol::line::{format_line, has_line_break, new_irc_connection, IrcConnection, IrcLine};
use crate::services::{BouncerProvider, Transport};

/// Capability advertised by ZNC's playback module.
pub const PLAYBACK_CAP: &str = "znc.in/playback";

const EVENT_CAPACITY: usize = 64;

/// Connection-scoped state shared with the session task.
#[derive(Default)]
struct Session {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    nick: Option<String>,
    network_name: Option<String>,
    bouncer: BouncerInfo,
}

/// An IRC connection speaking plain text over TCP.
pub struct LineTransport {
    network: String,
    events: broadcast::Sender<TransportEvent>,
    session: Arc<Mutex<Session>>,
}

impl LineTransport {
    pub fn new(network: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            network: network.into(),
            events,
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    /// Run a session over an already open stream, replacing any current one.
    pub fn attach<S>(&self, stream: S, config: &ServerConfig)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let session = SessionTask {
            network: self.network.clone(),
            config: config.clone(),
            events: self.events.clone(),
            session: self.session.clone(),
            nick: config.nick.clone(),
            registered: false,
        };
        let connection = new_irc_connection(stream);

        let Ok(mut shared) = self.session.lock() else {
            return;
        };
        if let Some(previous) = shared.task.take() {
            previous.abort();
        }
        *shared = Session {
            outgoing: Some(outgoing_tx),
            task: None,
            nick: None,
            network_name: None,
            bouncer: BouncerInfo::default(),
        };
        shared.task = Some(tokio::spawn(session.run(connection, outgoing_rx)));
    }

    fn send_line(&self, line: String) -> TransportResult<()> {
        if has_line_break(&line) {
            return Err(TransportError::InvalidLine { line });
        }
        let shared = self.session.lock().map_err(|_| TransportError::NotConnected)?;
        let outgoing = shared.outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        outgoing.send(line).map_err(|_| TransportError::ConnectionClosed)
    }

    /// Leave with a QUIT message. Reported as an intentional quit first, so
    /// the disconnect that follows is not retried.
    pub async fn quit(&self, message: &str) -> TransportResult<()> {
        let _ = self.events.send(TransportEvent::IntentionalQuit);
        self.send_line(format_line("QUIT", &[message]))
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn connect(&self, config: &ServerConfig) -> TransportResult<()> {
        if config.tls {
            return Err(TransportError::RegistrationFailed {
                reason: "TLS is not supported".to_string(),
            });
        }

        info!("[{}] Connecting to {}", self.network, config);
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|source| TransportError::ConnectFailed {
                host: config.host.clone(),
                port: config.port,
                source,
            })?;
        self.attach(stream, config);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Ok(mut shared) = self.session.lock() {
            // Dropping the sender ends the session task.
            shared.outgoing = None;
        }
    }

    async fn join_channel(&self, channel: &str, key: Option<&str>) -> TransportResult<()> {
        match key {
            Some(key) => self.send_line(format_line("JOIN", &[channel, key])),
            None => self.send_line(format_line("JOIN", &[channel])),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn current_nick(&self) -> Option<String> {
        self.session.lock().ok().and_then(|s| s.nick.clone())
    }

    fn network_name(&self) -> Option<String> {
        self.session.lock().ok().and_then(|s| s.network_name.clone())
    }
}

#[async_trait]
impl BouncerProvider for LineTransport {
    fn bouncer_info(&self, _network: &str) -> BouncerInfo {
        self.session
            .lock()
            .map(|s| s.bouncer)
            .unwrap_or_default()
    }

    async fn request_playback(&self, _network: &str) -> TransportResult<()> {
        self.send_line(format_line("PRIVMSG", &["*playback", "play * 0"]))
    }
}

/// The task driving one connection.
struct SessionTask {
    network: String,
    config: ServerConfig,
    events: broadcast::Sender<TransportEvent>,
    session: Arc<Mutex<Session>>,
    /// Nick we believe we have (or are trying to get).
    nick: String,
    registered: bool,
}

impl SessionTask {
    async fn run<S>(
        mut self,
        mut connection: IrcConnection<S>,
        mut outgoing: mpsc::UnboundedReceiver<String>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = self.register(&mut connection).await {
            warn!("[{}] Registration failed: {}", self.network, e);
        } else {
            loop {
                tokio::select! {
                    line = connection.next() => {
                        match line {
                            Some(Ok(line)) => {
                                if let Err(e) = self.handle_line(&mut connection, &line).await {
                                    warn!("[{}] Write failed: {}", self.network, e);
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                warn!("[{}] Read failed: {}", self.network, e);
                                break;
                            }
                            None => break,
                        }
                    }

                    line = outgoing.recv() => {
                        match line {
                            Some(line) => {
                                debug!("[{}] >> {}", self.network, line);
                                if let Err(e) = connection.send(line).await {
                                    warn!("[{}] Write failed: {}", self.network, e);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }

        if let Ok(mut shared) = self.session.lock() {
            shared.outgoing = None;
            shared.nick = None;
        }
        info!("[{}] Connection closed", self.network);
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    async fn register<S>(&mut self, connection: &mut IrcConnection<S>) -> TransportResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(ref password) = self.config.password {
            connection.send(format_line("PASS", &[password])).await?;
        }
        connection.send("CAP LS 302".to_string()).await?;
        connection.send(format_line("NICK", &[&self.nick])).await?;
        connection
            .send(format_line(
                "USER",
                &[self.config.username(), "0", "*", self.config.realname()],
            ))
            .await?;
        Ok(())
    }

    async fn handle_line<S>(
        &mut self,
        connection: &mut IrcConnection<S>,
        raw: &str,
    ) -> TransportResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(line) = IrcLine::parse(raw) else {
            return Ok(());
        };

        match line.command.as_str() {
            "PING" => {
                let token = line.param(0).unwrap_or_default();
                connection.send(format_line("PONG", &[token])).await?;
            }
            "CAP" => self.handle_cap(connection, &line).await?,
            "001" => {
                if let Some(nick) = line.param(0) {
                    self.nick = nick.to_string();
                }
                self.registered = true;
                self.update(|s| s.nick = Some(self.nick.clone()));
                info!("[{}] Registered as {}", self.network, self.nick);
                let _ = self.events.send(TransportEvent::Connected);
            }
            "005" => {
                let name = line
                    .params
                    .iter()
                    .find_map(|token| token.strip_prefix("NETWORK="));
                if let Some(name) = name {
                    let name = name.to_string();
                    self.update(|s| s.network_name = Some(name));
                }
            }
            // ERR_NICKNAMEINUSE
            "433" if !self.registered => {
                self.nick.push('_');
                debug!("[{}] Nick in use, trying {}", self.network, self.nick);
                connection.send(format_line("NICK", &[&self.nick])).await?;
            }
            "NICK" if self.is_me(&line) => {
                if let Some(nick) = line.param(0) {
                    self.nick = nick.to_string();
                    self.update(|s| s.nick = Some(self.nick.clone()));
                }
            }
            "JOIN" if self.is_me(&line) => {
                if let Some(channel) = line.param(0) {
                    let _ = self.events.send(TransportEvent::Joined {
                        channel: channel.to_string(),
                    });
                }
            }
            "PART" if self.is_me(&line) => {
                if let Some(channel) = line.param(0) {
                    let _ = self.events.send(TransportEvent::Parted {
                        channel: channel.to_string(),
                    });
                }
            }
            "KICK" => {
                let kicked_me = line
                    .param(1)
                    .is_some_and(|target| target.eq_ignore_ascii_case(&self.nick));
                if let (true, Some(channel)) = (kicked_me, line.param(0)) {
                    let _ = self.events.send(TransportEvent::Kicked {
                        channel: channel.to_string(),
                        by: line.source_nick().map(str::to_string),
                    });
                }
            }
            "ERROR" => {
                warn!(
                    "[{}] Server error: {}",
                    self.network,
                    line.param(0).unwrap_or_default()
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_cap<S>(
        &mut self,
        connection: &mut IrcConnection<S>,
        line: &IrcLine,
    ) -> TransportResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // CAP <target> LS [*] :<caps>
        if line.param(1) != Some("LS") {
            return Ok(());
        }
        let more = line.params.len() > 3 && line.param(2) == Some("*");
        let caps = line.params.last().map(String::as_str).unwrap_or_default();

        if caps
            .split(' ')
            .any(|cap| cap.split('=').next() == Some(PLAYBACK_CAP))
        {
            info!("[{}] Bouncer supports playback", self.network);
            self.update(|s| s.bouncer.playback_supported = true);
            connection.send(format_line("CAP", &["REQ", PLAYBACK_CAP])).await?;
        }
        if !more {
            connection.send("CAP END".to_string()).await?;
        }
        Ok(())
    }

    fn is_me(&self, line: &IrcLine) -> bool {
        line.source_nick()
            .is_some_and(|nick| nick.eq_ignore_ascii_case(&self.nick))
    }

    fn update(&self, apply: impl FnOnce(&mut Session)) {
        if let Ok(mut shared) = self.session.lock() {
            apply(&mut shared);
        }
    }
}
