//! Rejoinder - connection recovery for IRC sessions.
//!
//! Keeps IRC connections alive across network drops: reconnects with
//! exponential backoff, tells user-initiated disconnects apart from failures,
//! and restores channel presence (or asks the bouncer for playback) once the
//! link is back. Connection state survives restarts through a [`services::Store`].

pub mod common;
pub mod config;
pub mod protocol;
pub mod recovery;
pub mod services;

pub use common::{NetworkProfile, RecoveryEvent, ServerConfig, TransportEvent};
pub use recovery::{ReconnectConfig, RecoveryEngineBuilder, RecoveryHandle};
