//! Shared types used across the application.

use serde::{Deserialize, Serialize};

/// Identifier of a configured network (the key of every per-network table).
pub type NetworkId = String;

/// Connection parameters needed to (re)connect a transport.
///
/// Owned by the caller and stored verbatim in the connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub nick: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ServerConfig {
    /// Username to register with, falling back to the nick.
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nick)
    }

    /// Real name to register with, falling back to the nick.
    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nick)
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Richer reconnection descriptor used with a connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// Network identifier inside the pool.
    pub id: String,
    /// Display name of the network.
    pub name: String,
    /// Candidate servers, tried by the pool in order.
    pub servers: Vec<ServerConfig>,
    /// Nick to fall back to when the primary one is taken.
    #[serde(default)]
    pub alt_nick: Option<String>,
}

/// A user-bookmarked channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteChannel {
    pub name: String,
    /// Channel key (password), if any.
    #[serde(default)]
    pub key: Option<String>,
    /// Join automatically on connect.
    #[serde(default)]
    pub auto_join: bool,
}

/// Capabilities of a bouncer sitting in front of the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BouncerInfo {
    /// The bouncer can replay missed backlog (and channel presence).
    pub playback_supported: bool,
}

/// Check whether a string looks like an IRC channel name.
pub fn is_channel_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some('#' | '&' | '+' | '!') => {}
        _ => return false,
    }
    name.len() > 1
        && !name
            .chars()
            .any(|c| matches!(c, ' ' | ',' | '\x07' | '\r' | '\n' | '\0'))
}
