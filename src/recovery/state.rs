//! Connection state table.
//!
//! One [`ConnectionState`] per network, holding what is needed to reconnect
//! and which channels to restore afterwards. Entries survive disconnects and
//! are only removed explicitly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{NetworkId, NetworkProfile, ServerConfig};

/// Recovery state of one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub network: NetworkId,
    pub transport_config: ServerConfig,
    #[serde(default)]
    pub network_profile: Option<NetworkProfile>,
    /// Joined channels, without duplicates (compared case-insensitively).
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reconnect_attempts: u32,
}

impl ConnectionState {
    pub fn new(network: impl Into<NetworkId>, transport_config: ServerConfig) -> Self {
        Self {
            network: network.into(),
            transport_config,
            network_profile: None,
            channels: Vec::new(),
            last_connected_at: None,
            last_disconnected_at: None,
            reconnect_attempts: 0,
        }
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c.eq_ignore_ascii_case(channel))
    }

    /// Track a channel. Returns `false` if it was already tracked.
    pub fn add_channel(&mut self, channel: &str) -> bool {
        if self.has_channel(channel) {
            return false;
        }
        self.channels.push(channel.to_string());
        true
    }

    /// Stop tracking a channel. Returns `false` if it was not tracked.
    pub fn remove_channel(&mut self, channel: &str) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| !c.eq_ignore_ascii_case(channel));
        self.channels.len() != before
    }

    /// A connection came up: reset the attempt counter.
    pub fn record_connected(&mut self, at: DateTime<Utc>) {
        self.reconnect_attempts = 0;
        self.last_connected_at = Some(at);
    }

    pub fn record_disconnected(&mut self, at: DateTime<Utc>) {
        self.last_disconnected_at = Some(at);
    }
}

/// In-memory table of connection states, keyed by network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStateTable {
    states: BTreeMap<NetworkId, ConnectionState>,
}

impl ConnectionStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_states(states: BTreeMap<NetworkId, ConnectionState>) -> Self {
        Self { states }
    }

    pub fn states(&self) -> &BTreeMap<NetworkId, ConnectionState> {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, network: &str) -> Option<&ConnectionState> {
        self.states.get(network)
    }

    pub fn get_mut(&mut self, network: &str) -> Option<&mut ConnectionState> {
        self.states.get_mut(network)
    }

    /// Create or replace the state of a network that just connected.
    ///
    /// The attempt counter starts at zero and `last_connected_at` is `at`.
    pub fn save(
        &mut self,
        network: &str,
        transport_config: ServerConfig,
        network_profile: Option<NetworkProfile>,
        channels: Vec<String>,
        at: DateTime<Utc>,
    ) -> &ConnectionState {
        let mut state = ConnectionState::new(network, transport_config);
        state.network_profile = network_profile;
        for channel in &channels {
            state.add_channel(channel);
        }
        state.record_connected(at);
        self.states.insert(network.to_string(), state);
        &self.states[network]
    }

    pub fn remove(&mut self, network: &str) -> Option<ConnectionState> {
        self.states.remove(network)
    }

    /// Track a channel. No-op (returns `false`) without a stored state.
    pub fn add_channel(&mut self, network: &str, channel: &str) -> bool {
        self.states
            .get_mut(network)
            .is_some_and(|state| state.add_channel(channel))
    }

    pub fn remove_channel(&mut self, network: &str, channel: &str) -> bool {
        self.states
            .get_mut(network)
            .is_some_and(|state| state.remove_channel(channel))
    }
}
