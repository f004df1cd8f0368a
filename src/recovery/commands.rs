//! Messages accepted by the recovery engine task.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::common::{NetworkId, NetworkProfile, ServerConfig, TransportEvent};
use crate::recovery::policy::ReconnectConfig;
use crate::recovery::state::ConnectionState;
use crate::recovery::NetworkStatus;
use crate::services::Transport;

/// Reply channel for a request.
pub type Reply<T> = oneshot::Sender<T>;

/// Outcome of a connect attempt, reported by the attempt task.
pub type AttemptOutcome = Result<(), String>;

/// Requests from the handle plus internal timer/attempt notifications.
pub enum Command {
    SetConfig {
        network: NetworkId,
        config: ReconnectConfig,
        reply: Reply<()>,
    },
    GetConfig {
        network: NetworkId,
        reply: Reply<Option<ReconnectConfig>>,
    },
    SetEnabled {
        network: NetworkId,
        enabled: bool,
        reply: Reply<()>,
    },
    SaveState {
        network: NetworkId,
        transport_config: ServerConfig,
        network_profile: Option<NetworkProfile>,
        channels: Vec<String>,
        reply: Reply<()>,
    },
    GetState {
        network: NetworkId,
        reply: Reply<Option<ConnectionState>>,
    },
    ClearState {
        network: NetworkId,
        reply: Reply<()>,
    },
    AddChannel {
        network: NetworkId,
        channel: String,
        reply: Reply<bool>,
    },
    RemoveChannel {
        network: NetworkId,
        channel: String,
        reply: Reply<bool>,
    },
    MarkIntentional {
        network: NetworkId,
        reply: Reply<()>,
    },
    ClearIntentional {
        network: NetworkId,
        reply: Reply<()>,
    },
    CancelReconnect {
        network: NetworkId,
        reply: Reply<()>,
    },
    ResetAttempts {
        network: NetworkId,
        reply: Reply<()>,
    },
    Status {
        network: NetworkId,
        reply: Reply<NetworkStatus>,
    },
    Register {
        network: NetworkId,
        transport: Arc<dyn Transport>,
        reply: Reply<()>,
    },
    Unregister {
        network: NetworkId,
        reply: Reply<()>,
    },
    RemoveNetwork {
        network: NetworkId,
        reply: Reply<()>,
    },
    /// An event reported for a network, from a registered transport's
    /// listener (`reply: None`) or pushed by the host (`reply: Some`).
    Transport {
        network: NetworkId,
        event: TransportEvent,
        reply: Option<Reply<()>>,
    },
    /// A backoff timer elapsed.
    TimerFired { network: NetworkId, generation: u64 },
    /// A connect attempt finished.
    AttemptFinished {
        network: NetworkId,
        generation: u64,
        outcome: AttemptOutcome,
    },
    Shutdown { reply: Reply<()> },
}
