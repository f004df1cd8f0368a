//! Persisted shape of the recovery tables.
//!
//! Both tables are stored as JSON under fixed keys. The current documents
//! carry `"version": 2`. Documents without a version field are the legacy
//! camelCase shape (epoch-millisecond timestamps, maps or entry arrays) and
//! are upgraded on load; the next write stores version 2.

use std::collections::BTreeMap;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::common::error::{StoreError, StoreResult};
use crate::common::{NetworkId, NetworkProfile, ServerConfig};
use crate::recovery::policy::{
    ReconnectConfig, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MIN_RECONNECT_INTERVAL_MS,
};
use crate::recovery::state::ConnectionState;
use crate::services::Store;

pub const STATES_KEY: &str = "rejoinder/connection-states";
pub const CONFIGS_KEY: &str = "rejoinder/reconnect-configs";
pub const SCHEMA_VERSION: u64 = 2;

/// Write attempts per save before the failure is reported.
const SAVE_ATTEMPTS: usize = 3;

#[derive(Serialize)]
struct StatesDocumentRef<'a> {
    version: u64,
    states: &'a BTreeMap<NetworkId, ConnectionState>,
}

#[derive(Deserialize)]
struct StatesDocument {
    states: BTreeMap<NetworkId, ConnectionState>,
}

#[derive(Serialize)]
struct ConfigsDocumentRef<'a> {
    version: u64,
    configs: &'a BTreeMap<NetworkId, ReconnectConfig>,
}

#[derive(Deserialize)]
struct ConfigsDocument {
    configs: BTreeMap<NetworkId, ReconnectConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyState {
    #[serde(default)]
    network: Option<String>,
    config: ServerConfig,
    #[serde(default)]
    network_profile: Option<NetworkProfile>,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    last_connected: Option<i64>,
    #[serde(default)]
    last_disconnected: Option<i64>,
    #[serde(default)]
    reconnect_attempts: u32,
}

impl LegacyState {
    fn upgrade(self, key: &str) -> ConnectionState {
        let mut state = ConnectionState::new(self.network.unwrap_or_else(|| key.to_string()), self.config);
        state.network_profile = self.network_profile;
        for channel in &self.channels {
            state.add_channel(channel);
        }
        state.last_connected_at = self.last_connected.and_then(DateTime::<Utc>::from_timestamp_millis);
        state.last_disconnected_at = self
            .last_disconnected
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        state.reconnect_attempts = self.reconnect_attempts;
        state
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyConfig {
    enabled: bool,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default, alias = "initialDelayMs")]
    initial_delay: Option<u64>,
    #[serde(default, alias = "maxDelayMs")]
    max_delay: Option<u64>,
    #[serde(default)]
    backoff_multiplier: Option<f64>,
    #[serde(default)]
    rejoin_channels: Option<bool>,
    #[serde(default)]
    smart_reconnect: Option<bool>,
    #[serde(default, alias = "minReconnectIntervalMs")]
    min_reconnect_interval: Option<u64>,
}

impl From<LegacyConfig> for ReconnectConfig {
    fn from(legacy: LegacyConfig) -> Self {
        Self {
            enabled: legacy.enabled,
            max_attempts: legacy.max_attempts,
            initial_delay_ms: legacy.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY_MS),
            max_delay_ms: legacy.max_delay.unwrap_or(DEFAULT_MAX_DELAY_MS),
            backoff_multiplier: legacy.backoff_multiplier.unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
            rejoin_channels: legacy.rejoin_channels.unwrap_or(false),
            smart_reconnect: legacy.smart_reconnect.unwrap_or(false),
            min_reconnect_interval_ms: legacy
                .min_reconnect_interval
                .unwrap_or(DEFAULT_MIN_RECONNECT_INTERVAL_MS),
        }
    }
}

/// Read the schema version of a document. `None` means legacy.
fn document_version(key: &str, value: &Value) -> StoreResult<Option<u64>> {
    match value.get("version") {
        None if value.is_object() || value.is_array() => Ok(None),
        None => Err(StoreError::UnsupportedVersion {
            key: key.to_string(),
            version: 0,
        }),
        Some(version) => match version.as_u64() {
            Some(SCHEMA_VERSION) => Ok(Some(SCHEMA_VERSION)),
            Some(other) => Err(StoreError::UnsupportedVersion {
                key: key.to_string(),
                version: other,
            }),
            None => Err(StoreError::UnsupportedVersion {
                key: key.to_string(),
                version: 0,
            }),
        },
    }
}

/// Legacy tables were stored either as an object or as `[key, value]` pairs.
fn legacy_entries<T>(key: &str, value: Value) -> StoreResult<Vec<(String, T)>>
where
    T: for<'de> Deserialize<'de>,
{
    let malformed = |source| StoreError::Malformed {
        key: key.to_string(),
        source,
    };
    if value.is_array() {
        serde_json::from_value::<Vec<(String, T)>>(value).map_err(malformed)
    } else {
        serde_json::from_value::<BTreeMap<String, T>>(value)
            .map(|map| map.into_iter().collect())
            .map_err(malformed)
    }
}

pub fn encode_states(states: &BTreeMap<NetworkId, ConnectionState>) -> StoreResult<String> {
    serde_json::to_string(&StatesDocumentRef {
        version: SCHEMA_VERSION,
        states,
    })
    .map_err(|source| StoreError::Encode {
        key: STATES_KEY.to_string(),
        source,
    })
}

pub fn decode_states(raw: &str) -> StoreResult<BTreeMap<NetworkId, ConnectionState>> {
    let malformed = |source| StoreError::Malformed {
        key: STATES_KEY.to_string(),
        source,
    };
    let value: Value = serde_json::from_str(raw).map_err(malformed)?;

    match document_version(STATES_KEY, &value)? {
        Some(_) => serde_json::from_value::<StatesDocument>(value)
            .map(|document| document.states)
            .map_err(malformed),
        None => {
            debug!("Upgrading legacy connection-state document");
            Ok(legacy_entries::<LegacyState>(STATES_KEY, value)?
                .into_iter()
                .map(|(network, legacy)| {
                    let state = legacy.upgrade(&network);
                    (network, state)
                })
                .collect())
        }
    }
}

pub fn encode_configs(configs: &BTreeMap<NetworkId, ReconnectConfig>) -> StoreResult<String> {
    serde_json::to_string(&ConfigsDocumentRef {
        version: SCHEMA_VERSION,
        configs,
    })
    .map_err(|source| StoreError::Encode {
        key: CONFIGS_KEY.to_string(),
        source,
    })
}

pub fn decode_configs(raw: &str) -> StoreResult<BTreeMap<NetworkId, ReconnectConfig>> {
    let malformed = |source| StoreError::Malformed {
        key: CONFIGS_KEY.to_string(),
        source,
    };
    let value: Value = serde_json::from_str(raw).map_err(malformed)?;

    match document_version(CONFIGS_KEY, &value)? {
        Some(_) => serde_json::from_value::<ConfigsDocument>(value)
            .map(|document| document.configs)
            .map_err(malformed),
        None => {
            debug!("Upgrading legacy reconnect-config document");
            Ok(legacy_entries::<LegacyConfig>(CONFIGS_KEY, value)?
                .into_iter()
                .map(|(network, legacy)| (network, ReconnectConfig::from(legacy)))
                .collect())
        }
    }
}

pub async fn load_states(store: &dyn Store) -> StoreResult<BTreeMap<NetworkId, ConnectionState>> {
    match store.get_item(STATES_KEY).await? {
        Some(raw) => {
            let states = decode_states(&raw)?;
            info!("Restored connection state for {} network(s)", states.len());
            Ok(states)
        }
        None => Ok(BTreeMap::new()),
    }
}

pub async fn load_configs(store: &dyn Store) -> StoreResult<BTreeMap<NetworkId, ReconnectConfig>> {
    match store.get_item(CONFIGS_KEY).await? {
        Some(raw) => {
            let configs = decode_configs(&raw)?;
            info!("Restored reconnect config for {} network(s)", configs.len());
            Ok(configs)
        }
        None => Ok(BTreeMap::new()),
    }
}

/// Write a value, retrying briefly on failure.
async fn save(store: &dyn Store, key: &str, value: String) -> StoreResult<()> {
    let value = value.as_str();
    let write = move || async move { store.set_item(key, value.to_string()).await };

    write
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(500))
                .with_max_times(SAVE_ATTEMPTS - 1),
        )
        .notify(|e: &StoreError, delay: Duration| {
            warn!("Failed to write '{}' ({}), retrying in {:?}", key, e, delay);
        })
        .await
}

pub async fn save_states(
    store: &dyn Store,
    states: &BTreeMap<NetworkId, ConnectionState>,
) -> StoreResult<()> {
    save(store, STATES_KEY, encode_states(states)?).await
}

pub async fn save_configs(
    store: &dyn Store,
    configs: &BTreeMap<NetworkId, ReconnectConfig>,
) -> StoreResult<()> {
    save(store, CONFIGS_KEY, encode_configs(configs)?).await
}
