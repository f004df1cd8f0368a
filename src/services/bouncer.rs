//! Bouncer detection and backlog playback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::common::error::{TransportError, TransportResult};
use crate::common::BouncerInfo;

/// What the bouncer in front of a network can do.
#[async_trait]
pub trait BouncerProvider: Send + Sync {
    fn bouncer_info(&self, network: &str) -> BouncerInfo;

    /// Ask the bouncer to replay missed backlog.
    async fn request_playback(&self, network: &str) -> TransportResult<()>;
}

/// Direct server connections, no bouncer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBouncer;

#[async_trait]
impl BouncerProvider for NoBouncer {
    fn bouncer_info(&self, _network: &str) -> BouncerInfo {
        BouncerInfo::default()
    }

    async fn request_playback(&self, _network: &str) -> TransportResult<()> {
        Err(TransportError::NotConnected)
    }
}

/// Per-network bouncer providers (usually the network's own transport).
#[derive(Default)]
pub struct BouncerRegistry {
    entries: RwLock<HashMap<String, Arc<dyn BouncerProvider>>>,
}

impl BouncerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, network: impl Into<String>, provider: Arc<dyn BouncerProvider>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(network.into(), provider);
        }
    }

    pub fn remove(&self, network: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(network);
        }
    }

    fn get(&self, network: &str) -> Option<Arc<dyn BouncerProvider>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(network).cloned())
    }
}

#[async_trait]
impl BouncerProvider for BouncerRegistry {
    fn bouncer_info(&self, network: &str) -> BouncerInfo {
        self.get(network)
            .map(|provider| provider.bouncer_info(network))
            .unwrap_or_default()
    }

    async fn request_playback(&self, network: &str) -> TransportResult<()> {
        match self.get(network) {
            Some(provider) => provider.request_playback(network).await,
            None => Err(TransportError::NotConnected),
        }
    }
}
