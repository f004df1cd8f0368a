//! The recovery engine task.
//!
//! One task owns the configuration map, the connection state table, the
//! intentional-disconnect gate and the per-network recovery slots. Handles,
//! transport listeners, backoff timers and connect attempts all talk to it
//! through one command channel, so every transition for a network happens
//! in arrival order without locking.
//!
//! Per network:
//!
//! ```text
//!   Idle ──connected──▶ Connected ──disconnected──▶ AwaitingBackoff
//!    ▲                                                    │ timer
//!    └──── gave up / intentional / disabled        Connecting
//!                                                         │ failed: re-evaluate
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::common::{NetworkId, NetworkProfile, RecoveryEvent, ServerConfig, TransportEvent};
use crate::recovery::commands::{AttemptOutcome, Command};
use crate::recovery::gate::IntentionalDisconnectGate;
use crate::recovery::persist;
use crate::recovery::policy::{evaluate_disconnect, DisconnectContext, DisconnectDecision, Phase, ReconnectConfig};
use crate::recovery::rejoin::{RejoinJob, RejoinTiming};
use crate::recovery::state::ConnectionStateTable;
use crate::services::{BouncerProvider, ConnectionPool, FavoritesProvider, Store, Transport};

/// Snapshot of one network's recovery status, for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatus {
    pub network: NetworkId,
    pub phase: Phase,
    pub enabled: bool,
    pub has_state: bool,
    pub reconnect_attempts: u32,
    /// A backoff timer is running.
    pub retry_pending: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
}

/// Runtime bookkeeping for one network (not persisted).
#[derive(Debug, Default)]
struct NetworkSlot {
    phase: Phase,
    /// Bumped whenever pending work is invalidated; timer and attempt
    /// results carrying an older generation are dropped.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    rejoin: Option<JoinHandle<()>>,
    last_attempt_at: Option<Instant>,
}

impl NetworkSlot {
    fn invalidate(&mut self) -> u64 {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.generation
    }

    fn abort_rejoin(&mut self) {
        if let Some(rejoin) = self.rejoin.take() {
            rejoin.abort();
        }
    }
}

struct Registration {
    transport: Arc<dyn Transport>,
    listener: JoinHandle<()>,
}

/// Where a reconnect attempt goes.
enum AttemptTarget {
    Transport(Arc<dyn Transport>),
    Pool {
        pool: Arc<dyn ConnectionPool>,
        profile: NetworkProfile,
    },
}

impl AttemptTarget {
    async fn connect(self, network: &str, server: &ServerConfig) -> AttemptOutcome {
        match self {
            AttemptTarget::Transport(transport) => {
                transport.connect(server).await.map_err(|e| e.to_string())
            }
            AttemptTarget::Pool { pool, profile } => {
                pool.connect(&profile, server).await.map_err(|e| e.to_string())?;
                pool.set_active(network);
                Ok(())
            }
        }
    }
}

/// Collaborators and restored tables handed over by the builder.
pub(crate) struct EngineParts {
    pub store: Arc<dyn Store>,
    pub favorites: Arc<dyn FavoritesProvider>,
    pub bouncer: Arc<dyn BouncerProvider>,
    pub pool: Option<Arc<dyn ConnectionPool>>,
    pub gate: IntentionalDisconnectGate,
    pub rejoin_timing: RejoinTiming,
    pub configs: BTreeMap<NetworkId, ReconnectConfig>,
    pub states: ConnectionStateTable,
    pub commands: mpsc::WeakUnboundedSender<Command>,
    pub events: broadcast::Sender<RecoveryEvent>,
}

pub(crate) struct RecoveryEngine {
    store: Arc<dyn Store>,
    favorites: Arc<dyn FavoritesProvider>,
    bouncer: Arc<dyn BouncerProvider>,
    pool: Option<Arc<dyn ConnectionPool>>,
    gate: IntentionalDisconnectGate,
    rejoin_timing: RejoinTiming,
    configs: BTreeMap<NetworkId, ReconnectConfig>,
    states: ConnectionStateTable,
    slots: HashMap<NetworkId, NetworkSlot>,
    registrations: HashMap<NetworkId, Registration>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<RecoveryEvent>,
}

impl RecoveryEngine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        Self {
            store: parts.store,
            favorites: parts.favorites,
            bouncer: parts.bouncer,
            pool: parts.pool,
            gate: parts.gate,
            rejoin_timing: parts.rejoin_timing,
            configs: parts.configs,
            states: parts.states,
            slots: HashMap::new(),
            registrations: HashMap::new(),
            commands: parts.commands,
            events: parts.events,
        }
    }

    /// Process commands until shut down or every handle is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            "Recovery engine started ({} config(s), {} stored connection(s))",
            self.configs.len(),
            self.states.len()
        );

        while let Some(command) = commands.recv().await {
            if let Command::Shutdown { reply } = command {
                self.stop_all();
                let _ = reply.send(());
                break;
            }
            self.handle(command).await;
        }

        self.stop_all();
        info!("Recovery engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::SetConfig {
                network,
                config,
                reply,
            } => {
                self.set_config(&network, config).await;
                let _ = reply.send(());
            }
            Command::GetConfig { network, reply } => {
                let _ = reply.send(self.configs.get(&network).cloned());
            }
            Command::SetEnabled {
                network,
                enabled,
                reply,
            } => {
                let config = match self.configs.get(&network) {
                    Some(existing) => ReconnectConfig {
                        enabled,
                        ..existing.clone()
                    },
                    None => ReconnectConfig {
                        enabled,
                        ..ReconnectConfig::default()
                    },
                };
                self.set_config(&network, config).await;
                let _ = reply.send(());
            }
            Command::SaveState {
                network,
                transport_config,
                network_profile,
                channels,
                reply,
            } => {
                self.states
                    .save(&network, transport_config, network_profile, channels, Utc::now());
                debug!("[{}] Saved connection state", network);
                self.persist_states().await;
                let _ = reply.send(());
            }
            Command::GetState { network, reply } => {
                let _ = reply.send(self.states.get(&network).cloned());
            }
            Command::ClearState { network, reply } => {
                self.cancel_reconnect(&network);
                if self.states.remove(&network).is_some() {
                    info!("[{}] Cleared connection state", network);
                    self.persist_states().await;
                }
                let _ = reply.send(());
            }
            Command::AddChannel {
                network,
                channel,
                reply,
            } => {
                let added = self.add_channel(&network, &channel).await;
                let _ = reply.send(added);
            }
            Command::RemoveChannel {
                network,
                channel,
                reply,
            } => {
                let removed = self.remove_channel(&network, &channel).await;
                let _ = reply.send(removed);
            }
            Command::MarkIntentional { network, reply } => {
                self.mark_intentional(&network);
                let _ = reply.send(());
            }
            Command::ClearIntentional { network, reply } => {
                if self.gate.clear(&network) {
                    debug!("[{}] Intentional-disconnect marker cleared", network);
                }
                let _ = reply.send(());
            }
            Command::CancelReconnect { network, reply } => {
                self.cancel_reconnect(&network);
                let _ = reply.send(());
            }
            Command::ResetAttempts { network, reply } => {
                if let Some(state) = self.states.get_mut(&network) {
                    state.reconnect_attempts = 0;
                    info!("[{}] Reconnect attempts reset", network);
                    self.persist_states().await;
                }
                let _ = reply.send(());
            }
            Command::Status { network, reply } => {
                let _ = reply.send(self.status(&network));
            }
            Command::Register {
                network,
                transport,
                reply,
            } => {
                self.register(&network, transport);
                let _ = reply.send(());
            }
            Command::Unregister { network, reply } => {
                self.unregister(&network);
                let _ = reply.send(());
            }
            Command::RemoveNetwork { network, reply } => {
                self.remove_network(&network).await;
                let _ = reply.send(());
            }
            Command::Transport {
                network,
                event,
                reply,
            } => {
                self.on_transport_event(&network, event).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::TimerFired {
                network,
                generation,
            } => {
                self.on_timer_fired(&network, generation).await;
            }
            Command::AttemptFinished {
                network,
                generation,
                outcome,
            } => {
                self.on_attempt_finished(&network, generation, outcome).await;
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    // Writes are awaited inside the command loop. While the store is slow or
    // failing (with write retries), commands for every network wait behind it.
    async fn persist_states(&self) {
        if let Err(e) = persist::save_states(self.store.as_ref(), self.states.states()).await {
            error!("Failed to persist connection state: {}", e);
        }
    }

    async fn persist_configs(&self) {
        if let Err(e) = persist::save_configs(self.store.as_ref(), &self.configs).await {
            error!("Failed to persist reconnect config: {}", e);
        }
    }

    // ========================================================================
    // Configuration and state mutations
    // ========================================================================

    async fn set_config(&mut self, network: &str, config: ReconnectConfig) {
        let enabled = config.enabled;
        self.configs.insert(network.to_string(), config);
        info!(
            "[{}] Auto-reconnect {}",
            network,
            if enabled { "enabled" } else { "disabled" }
        );
        if !enabled {
            self.cancel_reconnect(network);
        }
        self.persist_configs().await;
    }

    async fn add_channel(&mut self, network: &str, channel: &str) -> bool {
        let added = self.states.add_channel(network, channel);
        if added {
            debug!("[{}] Tracking channel {}", network, channel);
            self.persist_states().await;
        }
        added
    }

    async fn remove_channel(&mut self, network: &str, channel: &str) -> bool {
        let removed = self.states.remove_channel(network, channel);
        if removed {
            debug!("[{}] No longer tracking channel {}", network, channel);
            self.persist_states().await;
        }
        removed
    }

    async fn remove_network(&mut self, network: &str) {
        self.unregister(network);
        if let Some(mut slot) = self.slots.remove(network) {
            slot.invalidate();
            slot.abort_rejoin();
        }
        self.gate.clear(network);

        if self.states.remove(network).is_some() {
            self.persist_states().await;
        }
        if self.configs.remove(network).is_some() {
            self.persist_configs().await;
        }
        info!("[{}] Network removed", network);
    }

    fn status(&self, network: &str) -> NetworkStatus {
        let slot = self.slots.get(network);
        let state = self.states.get(network);
        NetworkStatus {
            network: network.to_string(),
            phase: slot.map(|s| s.phase).unwrap_or_default(),
            enabled: self.configs.get(network).is_some_and(|c| c.enabled),
            has_state: state.is_some(),
            reconnect_attempts: state.map(|s| s.reconnect_attempts).unwrap_or(0),
            retry_pending: slot.is_some_and(|s| s.timer.is_some()),
            last_connected_at: state.and_then(|s| s.last_connected_at),
            last_disconnected_at: state.and_then(|s| s.last_disconnected_at),
        }
    }

    // ========================================================================
    // Intentional disconnects and cancellation
    // ========================================================================

    fn mark_intentional(&mut self, network: &str) {
        let now = Instant::now();
        self.gate.prune(now);
        self.gate.mark(network, now);
        self.cancel_reconnect(network);
        info!("[{}] Marked as intentional disconnect", network);
    }

    /// Stop any pending or running retry. The attempt counter and stored
    /// state are left alone; an in-flight connect call is allowed to finish
    /// but its result is ignored.
    fn cancel_reconnect(&mut self, network: &str) {
        let Some(slot) = self.slots.get_mut(network) else {
            return;
        };
        let was_recovering = slot.phase.is_recovering();
        slot.invalidate();
        if was_recovering {
            slot.phase = Phase::Idle;
            info!("[{}] Pending reconnect cancelled", network);
        }
    }

    // ========================================================================
    // Transport registration
    // ========================================================================

    fn register(&mut self, network: &str, transport: Arc<dyn Transport>) {
        self.unregister(network);

        let mut events = transport.subscribe();
        let commands = self.commands.clone();
        let owner = network.to_string();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(commands) = commands.upgrade() else {
                            break;
                        };
                        let command = Command::Transport {
                            network: owner.clone(),
                            event,
                            reply: None,
                        };
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("[{}] Missed {} transport event(s)", owner, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("[{}] Transport listener ended", owner);
        });

        self.registrations.insert(
            network.to_string(),
            Registration {
                transport,
                listener,
            },
        );
        info!("[{}] Transport registered", network);
    }

    fn unregister(&mut self, network: &str) {
        if let Some(registration) = self.registrations.remove(network) {
            registration.listener.abort();
            self.cancel_reconnect(network);
            info!("[{}] Transport unregistered", network);
        }
    }

    fn stop_all(&mut self) {
        for (_, registration) in self.registrations.drain() {
            registration.listener.abort();
        }
        for slot in self.slots.values_mut() {
            slot.invalidate();
            slot.abort_rejoin();
        }
    }

    // ========================================================================
    // State machine
    // ========================================================================

    async fn on_transport_event(&mut self, network: &str, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(network).await,
            TransportEvent::Disconnected => self.on_disconnected(network).await,
            TransportEvent::IntentionalQuit => self.mark_intentional(network),
            TransportEvent::Joined { channel } => {
                self.add_channel(network, &channel).await;
            }
            TransportEvent::Parted { channel } => {
                self.remove_channel(network, &channel).await;
            }
            TransportEvent::Kicked { channel, by } => {
                info!(
                    "[{}] Kicked from {} by {}",
                    network,
                    channel,
                    by.as_deref().unwrap_or("server")
                );
                self.remove_channel(network, &channel).await;
            }
        }
    }

    async fn on_connected(&mut self, network: &str) {
        let previous = {
            let slot = self.slots.entry(network.to_string()).or_default();
            let previous = slot.phase;
            slot.invalidate();
            slot.phase = Phase::Connected;
            previous
        };
        if previous == Phase::Connected {
            debug!("[{}] Duplicate connected event", network);
            return;
        }

        let Some(state) = self.states.get_mut(network) else {
            debug!("[{}] Connected without stored state", network);
            return;
        };
        let attempts = state.reconnect_attempts;
        state.record_connected(Utc::now());
        let channels = state.channels.clone();
        self.persist_states().await;

        if attempts > 0 || previous.is_recovering() {
            info!("[{}] Reconnected after {} attempt(s)", network, attempts);
        } else {
            info!("[{}] Connected", network);
        }
        let _ = self.events.send(RecoveryEvent::Recovered {
            network: network.to_string(),
        });

        self.start_rejoin(network, channels);
    }

    fn start_rejoin(&mut self, network: &str, channels: Vec<String>) {
        let rejoin = self.configs.get(network).is_some_and(|c| c.rejoin_channels);
        if !rejoin || channels.is_empty() {
            return;
        }

        let job = RejoinJob {
            network: network.to_string(),
            tracked: channels,
            favorites: self.favorites.clone(),
            bouncer: self.bouncer.clone(),
            transport: self
                .registrations
                .get(network)
                .map(|registration| registration.transport.clone()),
            timing: self.rejoin_timing,
            events: self.events.clone(),
        };

        let slot = self.slots.entry(network.to_string()).or_default();
        slot.abort_rejoin();
        slot.rejoin = Some(tokio::spawn(job.run()));
    }

    /// Disconnect evaluation, also re-entered directly after a failed attempt.
    async fn on_disconnected(&mut self, network: &str) {
        let intentional = self.gate.consume(network, Instant::now());
        let slot = self.slots.entry(network.to_string()).or_default();
        let decision = evaluate_disconnect(DisconnectContext {
            intentional,
            phase: slot.phase,
            config: self.configs.get(network),
            attempts: self.states.get(network).map(|s| s.reconnect_attempts),
        });

        if decision == DisconnectDecision::AlreadyRecovering {
            debug!("[{}] Disconnect ignored, reconnect already in progress", network);
            return;
        }

        slot.abort_rejoin();
        slot.phase = Phase::Idle;

        match decision {
            DisconnectDecision::AlreadyRecovering => {}
            DisconnectDecision::Intentional => {
                info!("[{}] Disconnected intentionally, not reconnecting", network);
            }
            DisconnectDecision::Disabled => {
                debug!("[{}] Disconnected, auto-reconnect disabled", network);
            }
            DisconnectDecision::NoState => {
                debug!("[{}] Disconnected, no stored state to reconnect with", network);
            }
            DisconnectDecision::Exhausted { attempts } => {
                warn!(
                    "[{}] Giving up after {} reconnect attempt(s)",
                    network, attempts
                );
                let _ = self.events.send(RecoveryEvent::GaveUp {
                    network: network.to_string(),
                    attempts,
                });
            }
            DisconnectDecision::Schedule { attempts } => {
                slot.phase = Phase::AwaitingBackoff;
                if let Some(state) = self.states.get_mut(network) {
                    state.record_disconnected(Utc::now());
                }
                self.persist_states().await;
                self.schedule_attempt(network, attempts);
            }
        }
    }

    fn schedule_attempt(&mut self, network: &str, attempts: u32) {
        let Some(config) = self.configs.get(network) else {
            return;
        };
        let slot = self.slots.entry(network.to_string()).or_default();

        let now = Instant::now();
        let since_last = slot
            .last_attempt_at
            .map(|at| now.saturating_duration_since(at));
        let flood_wait = config.flood_wait(since_last);
        let delay = config.next_attempt_delay(attempts, since_last);

        let generation = slot.invalidate();
        slot.phase = Phase::AwaitingBackoff;

        let commands = self.commands.clone();
        let owner = network.to_string();
        slot.timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TimerFired {
                    network: owner,
                    generation,
                });
            }
        }));

        if !flood_wait.is_zero() {
            info!(
                "[{}] Smart reconnect: holding off {:.1}s to avoid flooding",
                network,
                flood_wait.as_secs_f64()
            );
        }
        info!(
            "[{}] Reconnecting in {:.1}s (attempt {})",
            network,
            delay.as_secs_f64(),
            attempts + 1
        );
        let _ = self.events.send(RecoveryEvent::Scheduled {
            network: network.to_string(),
            attempt: attempts + 1,
            delay,
        });
    }

    async fn on_timer_fired(&mut self, network: &str, generation: u64) {
        {
            let Some(slot) = self.slots.get_mut(network) else {
                return;
            };
            if slot.generation != generation || slot.phase != Phase::AwaitingBackoff {
                debug!("[{}] Stale backoff timer ignored", network);
                return;
            }
            slot.timer = None;
            slot.phase = Phase::Connecting;
            slot.last_attempt_at = Some(Instant::now());
        }

        let Some(state) = self.states.get_mut(network) else {
            debug!("[{}] State vanished before reconnect attempt", network);
            if let Some(slot) = self.slots.get_mut(network) {
                slot.phase = Phase::Idle;
            }
            return;
        };
        state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
        let attempt = state.reconnect_attempts;
        let server = state.transport_config.clone();
        let profile = state.network_profile.clone();
        self.persist_states().await;

        self.start_attempt(network, generation, attempt, server, profile);
    }

    fn start_attempt(
        &mut self,
        network: &str,
        generation: u64,
        attempt: u32,
        server: ServerConfig,
        profile: Option<NetworkProfile>,
    ) {
        let target = match (profile, &self.pool) {
            (Some(profile), Some(pool)) => Some(AttemptTarget::Pool {
                pool: pool.clone(),
                profile,
            }),
            _ => self
                .registrations
                .get(network)
                .map(|registration| AttemptTarget::Transport(registration.transport.clone())),
        };

        info!("[{}] Reconnect attempt {} to {}", network, attempt, server);
        let _ = self.events.send(RecoveryEvent::Attempting {
            network: network.to_string(),
            attempt,
        });

        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let owner = network.to_string();

        match target {
            Some(target) => {
                tokio::spawn(async move {
                    let outcome = target.connect(&owner, &server).await;
                    let _ = commands.send(Command::AttemptFinished {
                        network: owner,
                        generation,
                        outcome,
                    });
                });
            }
            None => {
                let _ = commands.send(Command::AttemptFinished {
                    network: owner,
                    generation,
                    outcome: Err("no transport registered".to_string()),
                });
            }
        }
    }

    async fn on_attempt_finished(&mut self, network: &str, generation: u64, outcome: AttemptOutcome) {
        {
            let Some(slot) = self.slots.get_mut(network) else {
                return;
            };
            if slot.generation != generation {
                debug!("[{}] Result of a cancelled attempt ignored", network);
                return;
            }
            if slot.phase == Phase::Connecting {
                slot.phase = Phase::Idle;
            }
        }

        match outcome {
            Ok(()) => {
                debug!("[{}] Connect call completed, waiting for registration", network);
            }
            Err(reason) => {
                let attempt = self
                    .states
                    .get(network)
                    .map(|state| state.reconnect_attempts)
                    .unwrap_or(0);
                warn!("[{}] Reconnect attempt {} failed: {}", network, attempt, reason);
                let _ = self.events.send(RecoveryEvent::AttemptFailed {
                    network: network.to_string(),
                    attempt,
                    reason,
                });
                self.on_disconnected(network).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FavoriteChannel;
    use crate::recovery::handle::{RecoveryEngineBuilder, RecoveryHandle};
    use crate::recovery::testing::{server, BrokenStore, MockPool, MockTransport, PlaybackBouncer};
    use crate::services::{MemoryStore, StaticFavorites};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio_test::assert_ok;

    const NET: &str = "libera";

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            max_attempts: Some(10),
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            rejoin_channels: true,
            smart_reconnect: false,
            min_reconnect_interval_ms: 5_000,
        }
    }

    async fn setup_with(
        builder: RecoveryEngineBuilder,
        config: ReconnectConfig,
        channels: &[&str],
    ) -> (RecoveryHandle, Arc<MockTransport>) {
        let handle = builder.spawn().await;
        let transport = MockTransport::new();
        assert_ok!(handle.set_config(NET, config).await);
        assert_ok!(
            handle
                .save_connection_state(
                    NET,
                    server(),
                    None,
                    channels.iter().map(|c| c.to_string()).collect(),
                )
                .await
        );
        assert_ok!(handle.register_connection(NET, transport.clone()).await);
        (handle, transport)
    }

    async fn setup(config: ReconnectConfig) -> (RecoveryHandle, Arc<MockTransport>) {
        setup_with(
            RecoveryEngineBuilder::new(Arc::new(MemoryStore::new())),
            config,
            &[],
        )
        .await
    }

    async fn disconnect(handle: &RecoveryHandle) {
        assert_ok!(handle.report_event(NET, TransportEvent::Disconnected).await);
    }

    /// Let spawned tasks drain; advances the paused clock by 1ms.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn offsets(times: &[Instant], start: Instant) -> Vec<u64> {
        times
            .iter()
            .map(|t| t.duration_since(start).as_millis() as u64)
            .collect()
    }

    fn drain(events: &mut broadcast::Receiver<RecoveryEvent>) -> Vec<RecoveryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_retries_with_backoff() {
        let (handle, transport) = setup(config()).await;
        transport.fail_always(true);
        let start = Instant::now();

        disconnect(&handle).await;
        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.phase, Phase::AwaitingBackoff);
        assert!(status.retry_pending);
        assert!(status.last_disconnected_at.is_some());

        sleep(Duration::from_millis(999)).await;
        assert_eq!(transport.connect_count(), 0);

        sleep(Duration::from_millis(7_101)).await;
        assert_eq!(
            offsets(&transport.connect_times(), start),
            vec![1_000, 3_000, 7_000]
        );
        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.reconnect_attempts, 3);
        assert!(status.retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_event_reports_delay() {
        let (handle, _transport) = setup(config()).await;
        let mut events = handle.subscribe();

        disconnect(&handle).await;
        assert_eq!(
            drain(&mut events),
            vec![RecoveryEvent::Scheduled {
                network: NET.to_string(),
                attempt: 1,
                delay: Duration::from_millis(1_000),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (handle, transport) = setup(ReconnectConfig {
            max_attempts: Some(3),
            ..config()
        })
        .await;
        transport.fail_always(true);
        let mut events = handle.subscribe();

        disconnect(&handle).await;
        sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.connect_count(), 3);
        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.reconnect_attempts, 3);
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.retry_pending);
        assert!(drain(&mut events).contains(&RecoveryEvent::GaveUp {
            network: NET.to_string(),
            attempts: 3,
        }));

        // Further drops stay ignored until the counter is reset.
        disconnect(&handle).await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_count(), 3);

        assert_ok!(handle.reset_attempts(NET).await);
        disconnect(&handle).await;
        assert!(assert_ok!(handle.status(NET).await).retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_attempts_when_max_is_zero() {
        let (handle, transport) = setup(ReconnectConfig {
            max_attempts: Some(0),
            max_delay_ms: 1_000,
            ..config()
        })
        .await;
        transport.fail_always(true);

        disconnect(&handle).await;
        sleep(Duration::from_millis(20_500)).await;

        assert_eq!(transport.connect_count(), 20);
        assert!(assert_ok!(handle.status(NET).await).retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intentional_disconnect_is_not_retried() {
        let (handle, transport) = setup(config()).await;

        assert_ok!(handle.mark_intentional_disconnect(NET).await);
        disconnect(&handle).await;

        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.retry_pending);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 0);
        assert_eq!(assert_ok!(handle.status(NET).await).reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intentional_marker_is_single_use() {
        let (handle, _transport) = setup(config()).await;

        assert_ok!(handle.mark_intentional_disconnect(NET).await);
        disconnect(&handle).await;
        disconnect(&handle).await;

        assert!(assert_ok!(handle.status(NET).await).retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_intentional_marker_is_ignored() {
        let (handle, _transport) = setup(config()).await;

        assert_ok!(handle.mark_intentional_disconnect(NET).await);
        sleep(Duration::from_millis(5_001)).await;
        disconnect(&handle).await;

        assert!(assert_ok!(handle.status(NET).await).retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_intentional_marker() {
        let (handle, _transport) = setup(config()).await;

        assert_ok!(handle.mark_intentional_disconnect(NET).await);
        assert_ok!(handle.clear_intentional_disconnect(NET).await);
        disconnect(&handle).await;

        assert!(assert_ok!(handle.status(NET).await).retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_event_from_transport_suppresses_retry() {
        let (handle, transport) = setup(config()).await;

        transport.emit(TransportEvent::IntentionalQuit);
        transport.emit(TransportEvent::Disconnected);
        settle().await;

        assert!(!assert_ok!(handle.status(NET).await).retry_pending);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_disconnect_keeps_one_timer() {
        let (handle, transport) = setup(config()).await;

        disconnect(&handle).await;
        disconnect(&handle).await;
        transport.emit(TransportEvent::Disconnected);
        sleep(Duration::from_millis(1_500)).await;

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(assert_ok!(handle.status(NET).await).reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_retry() {
        let (handle, transport) = setup(config()).await;
        transport.fail_always(true);

        disconnect(&handle).await;
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(transport.connect_count(), 1);

        assert_ok!(handle.cancel_reconnect(NET).await);
        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.retry_pending);
        assert_eq!(status.reconnect_attempts, 1);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_resets_attempts_and_cancels_timer() {
        let (handle, transport) = setup(config()).await;
        transport.fail_always(true);

        disconnect(&handle).await;
        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(assert_ok!(handle.status(NET).await).reconnect_attempts, 2);

        let before = chrono::Utc::now();
        assert_ok!(handle.report_event(NET, TransportEvent::Connected).await);

        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.phase, Phase::Connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.retry_pending);
        assert!(status.last_connected_at.is_some_and(|at| at >= before));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failed_attempts() {
        let (handle, transport) = setup(config()).await;
        transport.fail_next(2);
        transport.announce_connected(true);
        let mut events = handle.subscribe();

        disconnect(&handle).await;
        sleep(Duration::from_millis(7_100)).await;

        assert_eq!(transport.connect_count(), 3);
        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.phase, Phase::Connected);
        assert_eq!(status.reconnect_attempts, 0);

        let events = drain(&mut events);
        let failures = events
            .iter()
            .filter(|e| matches!(e, RecoveryEvent::AttemptFailed { .. }))
            .count();
        assert_eq!(failures, 2);
        assert!(events.contains(&RecoveryEvent::Recovered {
            network: NET.to_string()
        }));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_reconnect_spaces_attempts() {
        let (handle, transport) = setup(ReconnectConfig {
            smart_reconnect: true,
            ..config()
        })
        .await;
        transport.announce_connected(true);

        disconnect(&handle).await;
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(assert_ok!(handle.status(NET).await).phase, Phase::Connected);

        disconnect(&handle).await;
        sleep(Duration::from_secs(10)).await;

        let times = transport.connect_times();
        assert_eq!(times.len(), 2);
        let gap = times[1].duration_since(times[0]);
        assert!(gap >= Duration::from_millis(5_000), "gap was {:?}", gap);
        assert_eq!(gap, Duration::from_millis(6_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_smart_reconnect_backoff_alone_applies() {
        let (handle, transport) = setup(config()).await;
        transport.announce_connected(true);

        disconnect(&handle).await;
        sleep(Duration::from_millis(1_500)).await;
        disconnect(&handle).await;
        sleep(Duration::from_secs(10)).await;

        let times = transport.connect_times();
        assert_eq!(times.len(), 2);
        assert_eq!(times[1].duration_since(times[0]), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_config_does_not_retry() {
        let (handle, transport) = setup(ReconnectConfig {
            enabled: false,
            ..config()
        })
        .await;

        disconnect(&handle).await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_cancels_pending_retry() {
        let (handle, transport) = setup(config()).await;

        disconnect(&handle).await;
        assert_ok!(handle.set_enabled(NET, false).await);
        assert!(!assert_ok!(handle.status(NET).await).retry_pending);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_state_no_retry() {
        let (handle, transport) = setup(config()).await;
        assert_ok!(handle.clear_connection_state(NET).await);

        disconnect(&handle).await;
        let status = assert_ok!(handle.status(NET).await);
        assert!(!status.has_state);
        assert!(!status.retry_pending);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_without_transport_counts_as_failure() {
        let handle = RecoveryEngineBuilder::new(Arc::new(MemoryStore::new()))
            .spawn()
            .await;
        assert_ok!(
            handle
                .set_config(
                    NET,
                    ReconnectConfig {
                        max_attempts: Some(2),
                        ..config()
                    }
                )
                .await
        );
        assert_ok!(handle.save_connection_state(NET, server(), None, Vec::new()).await);
        let mut events = handle.subscribe();

        disconnect(&handle).await;
        sleep(Duration::from_secs(10)).await;

        let status = assert_ok!(handle.status(NET).await);
        assert_eq!(status.reconnect_attempts, 2);
        assert!(!status.retry_pending);
        assert!(drain(&mut events).contains(&RecoveryEvent::GaveUp {
            network: NET.to_string(),
            attempts: 2,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_cancels_pending_retry() {
        let (handle, transport) = setup(config()).await;

        disconnect(&handle).await;
        assert_ok!(handle.unregister_connection(NET).await);
        assert!(!assert_ok!(handle.status(NET).await).retry_pending);

        transport.emit(TransportEvent::Disconnected);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_channels_from_transport_events() {
        let (handle, transport) = setup(config()).await;

        transport.emit(TransportEvent::Joined {
            channel: "#rust".to_string(),
        });
        transport.emit(TransportEvent::Joined {
            channel: "#rust".to_string(),
        });
        transport.emit(TransportEvent::Joined {
            channel: "#tokio".to_string(),
        });
        settle().await;
        let state = assert_ok!(handle.get_connection_state(NET).await).unwrap();
        assert_eq!(state.channels, vec!["#rust", "#tokio"]);

        transport.emit(TransportEvent::Kicked {
            channel: "#TOKIO".to_string(),
            by: Some("op".to_string()),
        });
        transport.emit(TransportEvent::Parted {
            channel: "#nowhere".to_string(),
        });
        settle().await;
        let state = assert_ok!(handle.get_connection_state(NET).await).unwrap();
        assert_eq!(state.channels, vec!["#rust"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_tracking_is_idempotent() {
        let (handle, _transport) = setup(config()).await;

        assert!(assert_ok!(handle.add_channel_to_state(NET, "#a").await));
        assert!(!assert_ok!(handle.add_channel_to_state(NET, "#a").await));
        assert!(assert_ok!(handle.remove_channel_from_state(NET, "#a").await));
        assert!(!assert_ok!(handle.remove_channel_from_state(NET, "#a").await));
        assert!(!assert_ok!(handle.add_channel_to_state("unknown", "#a").await));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoins_tracked_then_favorites_staggered() {
        let mut favorites = StaticFavorites::new();
        favorites.insert(
            NET,
            vec![
                FavoriteChannel {
                    name: "#c".to_string(),
                    key: Some("hunter2".to_string()),
                    auto_join: true,
                },
                FavoriteChannel {
                    name: "#d".to_string(),
                    key: None,
                    auto_join: false,
                },
            ],
        );
        let builder = RecoveryEngineBuilder::new(Arc::new(MemoryStore::new()))
            .favorites(Arc::new(favorites));
        let (handle, transport) = setup_with(builder, config(), &["#a", "#b"]).await;
        let start = Instant::now();

        assert_ok!(handle.report_event(NET, TransportEvent::Connected).await);
        sleep(Duration::from_secs(5)).await;

        let joins = transport.joins();
        let names: Vec<(String, Option<String>)> = joins
            .iter()
            .map(|(channel, key, _)| (channel.clone(), key.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("#a".to_string(), None),
                ("#b".to_string(), None),
                ("#c".to_string(), Some("hunter2".to_string())),
            ]
        );
        let times: Vec<Instant> = joins.iter().map(|(_, _, at)| *at).collect();
        assert_eq!(offsets(&times, start), vec![0, 1_000, 2_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rejoin_when_disabled() {
        let builder = RecoveryEngineBuilder::new(Arc::new(MemoryStore::new()));
        let (handle, transport) = setup_with(
            builder,
            ReconnectConfig {
                rejoin_channels: false,
                ..config()
            },
            &["#a"],
        )
        .await;

        assert_ok!(handle.report_event(NET, TransportEvent::Connected).await);
        sleep(Duration::from_secs(5)).await;
        assert!(transport.joins().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bouncer_playback_replaces_rejoin() {
        let bouncer = Arc::new(PlaybackBouncer::default());
        let builder =
            RecoveryEngineBuilder::new(Arc::new(MemoryStore::new())).bouncer(bouncer.clone());
        let (handle, transport) = setup_with(builder, config(), &["#a", "#b"]).await;

        assert_ok!(handle.report_event(NET, TransportEvent::Connected).await);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(bouncer.requests.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(bouncer.requests.load(Ordering::SeqCst), 1);
        assert!(transport.joins().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_reconnects_profiled_network() {
        let pool = Arc::new(MockPool::default());
        let handle = RecoveryEngineBuilder::new(Arc::new(MemoryStore::new()))
            .connection_pool(pool.clone())
            .spawn()
            .await;
        let transport = MockTransport::new();
        let profile = NetworkProfile {
            id: NET.to_string(),
            name: "Libera.Chat".to_string(),
            servers: vec![server()],
            alt_nick: None,
        };
        assert_ok!(handle.set_config(NET, config()).await);
        assert_ok!(
            handle
                .save_connection_state(NET, server(), Some(profile), Vec::new())
                .await
        );
        assert_ok!(handle.register_connection(NET, transport.clone()).await);

        disconnect(&handle).await;
        sleep(Duration::from_millis(1_500)).await;

        assert_eq!(*pool.connects.lock().unwrap(), vec![NET.to_string()]);
        assert_eq!(pool.active.lock().unwrap().as_deref(), Some(NET));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let builder = RecoveryEngineBuilder::new(store.clone());
        let (handle, transport) = setup_with(builder, config(), &["#a"]).await;
        transport.fail_always(true);
        assert_ok!(handle.add_channel_to_state(NET, "#b").await);
        disconnect(&handle).await;
        sleep(Duration::from_millis(1_500)).await;

        let state = assert_ok!(handle.get_connection_state(NET).await);
        let reconnect = assert_ok!(handle.get_config(NET).await);
        assert_ok!(handle.shutdown().await);

        let restarted = RecoveryEngineBuilder::new(store).spawn().await;
        assert_eq!(assert_ok!(restarted.get_connection_state(NET).await), state);
        assert_eq!(assert_ok!(restarted.get_config(NET).await), reconnect);
        assert_eq!(state.map(|s| s.reconnect_attempts), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_keeps_memory_state() {
        let store = Arc::new(BrokenStore::default());
        let builder = RecoveryEngineBuilder::new(store.clone());
        let (handle, _transport) = setup_with(builder, config(), &["#a"]).await;

        assert!(assert_ok!(handle.add_channel_to_state(NET, "#b").await));
        let state = assert_ok!(handle.get_connection_state(NET).await).unwrap();
        assert_eq!(state.channels, vec!["#a", "#b"]);
        assert!(store.writes.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_network_forgets_everything() {
        let (handle, transport) = setup(config()).await;

        disconnect(&handle).await;
        assert_ok!(handle.remove_network(NET).await);

        let status = assert_ok!(handle.status(NET).await);
        assert!(!status.has_state);
        assert!(!status.retry_pending);
        assert!(assert_ok!(handle.get_config(NET).await).is_none());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 0);
    }
}
