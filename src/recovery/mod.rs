//! Auto-reconnect and connection-state recovery.
//!
//! [`RecoveryEngineBuilder::spawn`] starts the engine task and returns a
//! [`RecoveryHandle`]. Hosts save a network's connection state once it is
//! up, register its transport, and the engine takes it from there: backoff
//! retries after unexpected drops, channel tracking, and rejoin or bouncer
//! playback once the link is back.

mod commands;
pub mod engine;
pub mod gate;
pub mod handle;
pub mod persist;
pub mod policy;
pub mod rejoin;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::NetworkStatus;
pub use gate::IntentionalDisconnectGate;
pub use handle::{RecoveryEngineBuilder, RecoveryHandle};
pub use policy::{evaluate_disconnect, DisconnectDecision, Phase, ReconnectConfig};
pub use rejoin::{plan_rejoin, JoinRequest, RejoinPlan, RejoinTiming};
pub use state::{ConnectionState, ConnectionStateTable};
