//! Test doubles for the engine's collaborators.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::common::error::{StoreError, StoreResult, TransportError, TransportResult};
use crate::common::{BouncerInfo, NetworkProfile, ServerConfig, TransportEvent};
use crate::services::{BouncerProvider, ConnectionPool, Store, Transport};

pub fn server() -> ServerConfig {
    ServerConfig {
        host: "irc.example.net".to_string(),
        port: 6667,
        tls: false,
        nick: "tester".to_string(),
        username: None,
        realname: None,
        password: None,
    }
}

/// Transport that records calls. Connects succeed unless told otherwise.
pub struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    connects: Mutex<Vec<Instant>>,
    joins: Mutex<Vec<(String, Option<String>, Instant)>>,
    failures_left: AtomicU32,
    fail_always: AtomicBool,
    announce: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            connects: Mutex::new(Vec::new()),
            joins: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(0),
            fail_always: AtomicBool::new(false),
            announce: AtomicBool::new(false),
        })
    }

    /// Fail the next `count` connects.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Emit `Connected` after every successful connect.
    pub fn announce_connected(&self, announce: bool) {
        self.announce.store(announce, Ordering::SeqCst);
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn joins(&self) -> Vec<(String, Option<String>, Instant)> {
        self.joins.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _config: &ServerConfig) -> TransportResult<()> {
        self.connects.lock().unwrap().push(Instant::now());

        let scripted = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.fail_always.load(Ordering::SeqCst) {
            return Err(TransportError::RegistrationFailed {
                reason: "connection refused".to_string(),
            });
        }

        if self.announce.load(Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    async fn join_channel(&self, channel: &str, key: Option<&str>) -> TransportResult<()> {
        self.joins.lock().unwrap().push((
            channel.to_string(),
            key.map(str::to_string),
            Instant::now(),
        ));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn current_nick(&self) -> Option<String> {
        Some("tester".to_string())
    }

    fn network_name(&self) -> Option<String> {
        None
    }
}

/// Pool that records which profiles it was asked to connect.
#[derive(Default)]
pub struct MockPool {
    pub connects: Mutex<Vec<String>>,
    pub active: Mutex<Option<String>>,
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn connect(&self, profile: &NetworkProfile, _server: &ServerConfig) -> TransportResult<()> {
        self.connects.lock().unwrap().push(profile.id.clone());
        Ok(())
    }

    fn set_active(&self, network: &str) {
        *self.active.lock().unwrap() = Some(network.to_string());
    }
}

/// Bouncer that always supports playback and counts requests.
#[derive(Default)]
pub struct PlaybackBouncer {
    pub requests: AtomicUsize,
}

#[async_trait]
impl BouncerProvider for PlaybackBouncer {
    fn bouncer_info(&self, _network: &str) -> BouncerInfo {
        BouncerInfo {
            playback_supported: true,
        }
    }

    async fn request_playback(&self, _network: &str) -> TransportResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store whose writes always fail.
#[derive(Default)]
pub struct BrokenStore {
    pub writes: AtomicUsize,
}

#[async_trait]
impl Store for BrokenStore {
    async fn get_item(&self, _key: &str) -> StoreResult<Option<String>> {
        Ok(None)
    }

    async fn set_item(&self, key: &str, _value: String) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Io {
            path: key.into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }
}
