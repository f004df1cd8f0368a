//! Transport capability interfaces.
//!
//! The recovery engine never opens sockets itself. It drives whatever
//! implements [`Transport`] (one instance per network) or, for networks
//! described by a [`NetworkProfile`], a [`ConnectionPool`].

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::common::error::TransportResult;
use crate::common::{NetworkProfile, ServerConfig, TransportEvent};

/// A client connection to one IRC network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. Resolves once the connect itself succeeded or
    /// failed; registration completes later and is signalled with
    /// [`TransportEvent::Connected`].
    async fn connect(&self, config: &ServerConfig) -> TransportResult<()>;

    /// Close the connection without a quit message.
    async fn disconnect(&self);

    /// Send a JOIN, with the channel key if one is given.
    async fn join_channel(&self, channel: &str, key: Option<&str>) -> TransportResult<()>;

    /// Subscribe to connection and membership events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Nick currently in use, if registered.
    fn current_nick(&self) -> Option<String>;

    /// Network name as announced by the server, if known.
    fn network_name(&self) -> Option<String>;
}

/// Multi-connection manager able to reconnect a network from its profile.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// (Re)connect the network described by `profile` using `server`.
    async fn connect(&self, profile: &NetworkProfile, server: &ServerConfig) -> TransportResult<()>;

    /// Make the network the active one in the UI.
    fn set_active(&self, network: &str);
}
