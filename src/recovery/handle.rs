//! Public entry points into the recovery engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::error;

use crate::common::error::{RecoveryError, RecoveryResult};
use crate::common::{is_channel_name, NetworkProfile, RecoveryEvent, ServerConfig, TransportEvent};
use crate::recovery::commands::{Command, Reply};
use crate::recovery::engine::{EngineParts, NetworkStatus, RecoveryEngine};
use crate::recovery::gate::{IntentionalDisconnectGate, INTENTIONAL_DISCONNECT_WINDOW};
use crate::recovery::persist;
use crate::recovery::policy::ReconnectConfig;
use crate::recovery::rejoin::RejoinTiming;
use crate::recovery::state::{ConnectionState, ConnectionStateTable};
use crate::services::{
    BouncerProvider, ConnectionPool, FavoritesProvider, NoBouncer, NoFavorites, Store, Transport,
};

const EVENT_CAPACITY: usize = 256;

/// Builder for the recovery engine task.
pub struct RecoveryEngineBuilder {
    store: Arc<dyn Store>,
    favorites: Arc<dyn FavoritesProvider>,
    bouncer: Arc<dyn BouncerProvider>,
    pool: Option<Arc<dyn ConnectionPool>>,
    intentional_window: Duration,
    rejoin_timing: RejoinTiming,
}

impl RecoveryEngineBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            favorites: Arc::new(NoFavorites),
            bouncer: Arc::new(NoBouncer),
            pool: None,
            intentional_window: INTENTIONAL_DISCONNECT_WINDOW,
            rejoin_timing: RejoinTiming::default(),
        }
    }

    pub fn favorites(mut self, favorites: Arc<dyn FavoritesProvider>) -> Self {
        self.favorites = favorites;
        self
    }

    pub fn bouncer(mut self, bouncer: Arc<dyn BouncerProvider>) -> Self {
        self.bouncer = bouncer;
        self
    }

    /// Reconnect networks that have a stored profile through this pool
    /// instead of their registered transport.
    pub fn connection_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn intentional_window(mut self, window: Duration) -> Self {
        self.intentional_window = window;
        self
    }

    pub fn rejoin_timing(mut self, timing: RejoinTiming) -> Self {
        self.rejoin_timing = timing;
        self
    }

    /// Restore persisted tables and start the engine task.
    ///
    /// Unreadable persisted data is logged and replaced by empty tables.
    pub async fn spawn(self) -> RecoveryHandle {
        let configs = match persist::load_configs(self.store.as_ref()).await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Failed to load reconnect config, starting empty: {}", e);
                BTreeMap::new()
            }
        };
        let states = match persist::load_states(self.store.as_ref()).await {
            Ok(states) => states,
            Err(e) => {
                error!("Failed to load connection state, starting empty: {}", e);
                BTreeMap::new()
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = RecoveryEngine::new(EngineParts {
            store: self.store,
            favorites: self.favorites,
            bouncer: self.bouncer,
            pool: self.pool,
            gate: IntentionalDisconnectGate::new(self.intentional_window),
            rejoin_timing: self.rejoin_timing,
            configs,
            states: ConnectionStateTable::from_states(states),
            commands: command_tx.downgrade(),
            events: events.clone(),
        });
        tokio::spawn(engine.run(command_rx));

        RecoveryHandle {
            commands: command_tx,
            events,
        }
    }
}

/// Cloneable handle to a running recovery engine.
///
/// Every mutating call returns once the change is applied and persisted.
/// The engine stops when [`RecoveryHandle::shutdown`] is called or the last
/// handle is dropped.
#[derive(Clone)]
pub struct RecoveryHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RecoveryEvent>,
}

fn check_network(network: &str) -> RecoveryResult<String> {
    if network.trim().is_empty() {
        return Err(RecoveryError::InvalidNetwork {
            network: network.to_string(),
        });
    }
    Ok(network.to_string())
}

impl RecoveryHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> RecoveryResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| RecoveryError::EngineStopped)?;
        response.await.map_err(|_| RecoveryError::EngineStopped)
    }

    /// Watch recovery progress.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Reconnect configuration
    // ---------------------------------------------------------------------

    pub async fn set_config(&self, network: &str, config: ReconnectConfig) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::SetConfig {
            network,
            config,
            reply,
        })
        .await
    }

    pub async fn get_config(&self, network: &str) -> RecoveryResult<Option<ReconnectConfig>> {
        let network = check_network(network)?;
        self.request(|reply| Command::GetConfig { network, reply }).await
    }

    /// Toggle auto-reconnect, creating a default config if none exists.
    pub async fn set_enabled(&self, network: &str, enabled: bool) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::SetEnabled {
            network,
            enabled,
            reply,
        })
        .await
    }

    /// `false` when no config exists.
    pub async fn is_enabled(&self, network: &str) -> RecoveryResult<bool> {
        Ok(self.get_config(network).await?.is_some_and(|c| c.enabled))
    }

    // ---------------------------------------------------------------------
    // Connection state
    // ---------------------------------------------------------------------

    /// Record a successful connection: replaces the stored state, resets the
    /// attempt counter and stamps the connect time.
    pub async fn save_connection_state(
        &self,
        network: &str,
        transport_config: ServerConfig,
        network_profile: Option<NetworkProfile>,
        channels: Vec<String>,
    ) -> RecoveryResult<()> {
        let network = check_network(network)?;
        if let Some(channel) = channels.iter().find(|c| !is_channel_name(c)) {
            return Err(RecoveryError::InvalidChannel {
                channel: channel.clone(),
            });
        }
        self.request(|reply| Command::SaveState {
            network,
            transport_config,
            network_profile,
            channels,
            reply,
        })
        .await
    }

    pub async fn get_connection_state(&self, network: &str) -> RecoveryResult<Option<ConnectionState>> {
        let network = check_network(network)?;
        self.request(|reply| Command::GetState { network, reply }).await
    }

    /// Forget a network's state and cancel any pending retry.
    pub async fn clear_connection_state(&self, network: &str) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::ClearState { network, reply }).await
    }

    /// Returns whether the channel was newly tracked.
    pub async fn add_channel_to_state(&self, network: &str, channel: &str) -> RecoveryResult<bool> {
        let network = check_network(network)?;
        if !is_channel_name(channel) {
            return Err(RecoveryError::InvalidChannel {
                channel: channel.to_string(),
            });
        }
        let channel = channel.to_string();
        self.request(|reply| Command::AddChannel {
            network,
            channel,
            reply,
        })
        .await
    }

    /// Returns whether the channel was tracked.
    pub async fn remove_channel_from_state(&self, network: &str, channel: &str) -> RecoveryResult<bool> {
        let network = check_network(network)?;
        let channel = channel.to_string();
        self.request(|reply| Command::RemoveChannel {
            network,
            channel,
            reply,
        })
        .await
    }

    pub async fn reset_attempts(&self, network: &str) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::ResetAttempts { network, reply }).await
    }

    // ---------------------------------------------------------------------
    // Intentional disconnects and cancellation
    // ---------------------------------------------------------------------

    /// Call right before a user-initiated disconnect. Also cancels any
    /// pending retry.
    pub async fn mark_intentional_disconnect(&self, network: &str) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::MarkIntentional { network, reply }).await
    }

    pub async fn clear_intentional_disconnect(&self, network: &str) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::ClearIntentional { network, reply }).await
    }

    pub async fn cancel_reconnect(&self, network: &str) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::CancelReconnect { network, reply }).await
    }

    // ---------------------------------------------------------------------
    // Transports
    // ---------------------------------------------------------------------

    /// Listen to a transport's events. Replaces any earlier registration.
    pub async fn register_connection(
        &self,
        network: &str,
        transport: Arc<dyn Transport>,
    ) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::Register {
            network,
            transport,
            reply,
        })
        .await
    }

    /// Stop listening and cancel any pending retry.
    pub async fn unregister_connection(&self, network: &str) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::Unregister { network, reply }).await
    }

    /// Push a transport event directly, for hosts that do not register a
    /// [`Transport`]. Returns once the event is processed.
    pub async fn report_event(&self, network: &str, event: TransportEvent) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::Transport {
            network,
            event,
            reply: Some(reply),
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub async fn status(&self, network: &str) -> RecoveryResult<NetworkStatus> {
        let network = check_network(network)?;
        self.request(|reply| Command::Status { network, reply }).await
    }

    /// Drop everything known about a network, persisted data included.
    pub async fn remove_network(&self, network: &str) -> RecoveryResult<()> {
        let network = check_network(network)?;
        self.request(|reply| Command::RemoveNetwork { network, reply }).await
    }

    /// Cancel all timers and listeners and stop the engine task.
    pub async fn shutdown(&self) -> RecoveryResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
