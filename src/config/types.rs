//! Configuration type definitions.

use serde::Deserialize;

use crate::common::{FavoriteChannel, NetworkProfile, ServerConfig};
use crate::recovery::ReconnectConfig;
use crate::services::StaticFavorites;

/// Default location of the state file.
pub const DEFAULT_STORAGE_PATH: &str = "rejoinder-state.json";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    pub networks: Vec<NetworkConfig>,
}

/// Where recovery state is persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String {
    DEFAULT_STORAGE_PATH.to_string()
}

/// One IRC network the daemon keeps connected.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub id: String,
    /// Display name; the id when absent.
    pub name: Option<String>,
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub favorites: Vec<FavoriteChannel>,
}

impl NetworkConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn profile(&self) -> NetworkProfile {
        NetworkProfile {
            id: self.id.clone(),
            name: self.display_name().to_string(),
            servers: vec![self.server.clone()],
            alt_nick: None,
        }
    }
}

impl Config {
    pub fn network(&self, id: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.id == id)
    }

    /// Favorites of every network, for the rejoin orchestrator.
    pub fn favorites(&self) -> StaticFavorites {
        let mut favorites = StaticFavorites::new();
        for network in &self.networks {
            favorites.insert(network.id.clone(), network.favorites.clone());
        }
        favorites
    }
}
