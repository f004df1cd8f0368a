//! Rejoinder - IRC connection keeper
//!
//! Connects to the configured IRC networks and keeps them connected:
//! reconnects after drops, rejoins channels, and remembers everything
//! across restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use backon::{ExponentialBuilder, Retryable};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use rejoinder::common::error::TransportError;
use rejoinder::common::TransportEvent;
use rejoinder::config::{env::get_config_path, load_and_validate, NetworkConfig};
use rejoinder::protocol::LineTransport;
use rejoinder::recovery::{RecoveryEngineBuilder, RecoveryHandle};
use rejoinder::services::{BouncerRegistry, FileStore, Transport};

/// How long QUIT messages get to reach the servers on shutdown.
const QUIT_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Rejoinder v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  State file: {}", config.storage.path);
    for network in &config.networks {
        info!(
            "  Network: {} ({}, nick {})",
            network.display_name(),
            network.server,
            network.server.nick
        );
    }

    // ============================================================
    // Recovery engine
    // ============================================================

    let store = Arc::new(FileStore::open(&config.storage.path).await?);
    let bouncers = Arc::new(BouncerRegistry::new());
    let recovery = RecoveryEngineBuilder::new(store)
        .favorites(Arc::new(config.favorites()))
        .bouncer(bouncers.clone())
        .spawn()
        .await;

    // ============================================================
    // Connect every network
    // ============================================================

    let mut transports = Vec::with_capacity(config.networks.len());
    for network in &config.networks {
        recovery
            .set_config(&network.id, network.reconnect.clone())
            .await?;

        let transport = Arc::new(LineTransport::new(network.id.clone()));
        bouncers.insert(network.id.clone(), transport.clone());
        recovery
            .register_connection(&network.id, transport.clone())
            .await?;

        let bootstrap_recovery = recovery.clone();
        let bootstrap_network = network.clone();
        let bootstrap_transport = transport.clone();
        tokio::spawn(async move {
            let id = bootstrap_network.id.clone();
            if let Err(e) =
                bootstrap(bootstrap_recovery, bootstrap_network, bootstrap_transport).await
            {
                error!("[{}] Initial connection failed: {}", id, e);
            }
        });

        transports.push((network.id.clone(), transport));
    }

    shutdown_signal().await;
    info!("Shutdown signal received - disconnecting...");

    for (id, transport) in &transports {
        recovery.mark_intentional_disconnect(id).await?;
        if let Err(e) = transport.quit("Shutting down").await {
            debug!("[{}] Not connected at shutdown: {}", id, e);
        }
    }
    tokio::time::sleep(QUIT_GRACE).await;
    recovery.shutdown().await?;

    info!("Exiting...");
    Ok(())
}

/// First connection of a network.
///
/// With state from an earlier run, a failed connect is handed to the
/// recovery engine as a drop. Without it the connect is retried here, and
/// the state is saved once registration completes.
async fn bootstrap(
    recovery: RecoveryHandle,
    network: NetworkConfig,
    transport: Arc<dyn Transport>,
) -> Result<()> {
    let mut events = transport.subscribe();
    let previous = recovery.get_connection_state(&network.id).await?;
    let resumed = previous.is_some();

    // A restart is the manual reset of an exhausted attempt counter.
    if resumed {
        recovery.reset_attempts(&network.id).await?;
    }

    let retries = if resumed { 0 } else { 5 };
    let connected = (|| async { transport.connect(&network.server).await })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(2))
                .with_max_delay(Duration::from_secs(60))
                .with_max_times(retries),
        )
        .notify(|e: &TransportError, delay: Duration| {
            warn!("[{}] Connect failed ({}), retrying in {:?}", network.id, e, delay);
        })
        .await;

    if let Err(e) = connected {
        if resumed {
            warn!("[{}] Connect failed ({}), handing over to auto-reconnect", network.id, e);
            recovery
                .report_event(&network.id, TransportEvent::Disconnected)
                .await?;
            return Ok(());
        }
        return Err(e.into());
    }

    loop {
        match events.recv().await {
            Ok(TransportEvent::Connected) => break,
            Ok(TransportEvent::Disconnected) if !resumed => {
                bail!("connection closed during registration");
            }
            // The engine already saw the drop and retries from stored state.
            Ok(TransportEvent::Disconnected) => return Ok(()),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("transport went away"),
        }
    }

    let channels = previous.map(|state| state.channels).unwrap_or_default();
    let first_run = channels.is_empty();
    recovery
        .save_connection_state(
            &network.id,
            network.server.clone(),
            Some(network.profile()),
            channels,
        )
        .await?;

    if first_run {
        for favorite in network.favorites.iter().filter(|f| f.auto_join) {
            transport
                .join_channel(&favorite.name, favorite.key.as_deref())
                .await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rejoinder::common::error::TransportResult;
    use rejoinder::common::{RecoveryEvent, ServerConfig};
    use rejoinder::recovery::ReconnectConfig;
    use rejoinder::services::MemoryStore;
    use tokio::sync::broadcast;
    use tokio_test::assert_ok;

    /// A server that is down: every connect is refused.
    struct Unreachable {
        events: broadcast::Sender<TransportEvent>,
        connects: AtomicUsize,
    }

    impl Unreachable {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: broadcast::channel(16).0,
                connects: AtomicUsize::new(0),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Unreachable {
        async fn connect(&self, _config: &ServerConfig) -> TransportResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ConnectionClosed)
        }

        async fn disconnect(&self) {}

        async fn join_channel(&self, _channel: &str, _key: Option<&str>) -> TransportResult<()> {
            Err(TransportError::NotConnected)
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }

        fn current_nick(&self) -> Option<String> {
            None
        }

        fn network_name(&self) -> Option<String> {
            None
        }
    }

    fn network() -> NetworkConfig {
        NetworkConfig {
            id: "libera".to_string(),
            name: None,
            server: ServerConfig {
                host: "irc.libera.chat".to_string(),
                port: 6667,
                tls: false,
                nick: "rejoinder".to_string(),
                username: None,
                realname: None,
                password: None,
            },
            reconnect: ReconnectConfig {
                enabled: true,
                max_attempts: Some(2),
                ..ReconnectConfig::default()
            },
            favorites: Vec::new(),
        }
    }

    async fn start(store: Arc<MemoryStore>, transport: Arc<Unreachable>) -> RecoveryHandle {
        let recovery = RecoveryEngineBuilder::new(store).spawn().await;
        let network = network();
        assert_ok!(recovery.set_config(&network.id, network.reconnect.clone()).await);
        assert_ok!(recovery.register_connection(&network.id, transport).await);
        recovery
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_retries_an_exhausted_network() {
        let network = network();
        let store = Arc::new(MemoryStore::new());

        // Previous run: the server went away and the retries ran out.
        let transport = Unreachable::new();
        let recovery = start(store.clone(), transport.clone()).await;
        assert_ok!(
            recovery
                .save_connection_state(
                    &network.id,
                    network.server.clone(),
                    None,
                    vec!["#rust".to_string()],
                )
                .await
        );
        assert_ok!(recovery.report_event(&network.id, TransportEvent::Disconnected).await);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.connects(), 2);
        assert_ok!(recovery.shutdown().await);

        // Restart while the server is still down.
        let transport = Unreachable::new();
        let recovery = start(store, transport.clone()).await;
        let mut events = recovery.subscribe();
        assert_ok!(bootstrap(recovery.clone(), network.clone(), transport.clone()).await);
        tokio::time::sleep(Duration::from_secs(600)).await;

        // The bootstrap connect plus a fresh round of two retries.
        assert_eq!(transport.connects(), 3);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&RecoveryEvent::Scheduled {
            network: network.id.clone(),
            attempt: 1,
            delay: Duration::from_millis(network.reconnect.initial_delay_ms),
        }));
        assert_eq!(
            seen.last(),
            Some(&RecoveryEvent::GaveUp {
                network: network.id.clone(),
                attempts: 2,
            })
        );
    }
}
