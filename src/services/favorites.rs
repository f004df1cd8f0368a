//! Favorite channels.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::common::FavoriteChannel;

/// Source of favorite channels flagged for automatic joining.
#[async_trait]
pub trait FavoritesProvider: Send + Sync {
    async fn auto_join_channels(&self, network: &str) -> Vec<FavoriteChannel>;
}

/// No favorites at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFavorites;

#[async_trait]
impl FavoritesProvider for NoFavorites {
    async fn auto_join_channels(&self, _network: &str) -> Vec<FavoriteChannel> {
        Vec::new()
    }
}

/// Favorites fixed at startup (from the daemon configuration).
#[derive(Debug, Default, Clone)]
pub struct StaticFavorites {
    by_network: HashMap<String, Vec<FavoriteChannel>>,
}

impl StaticFavorites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, network: impl Into<String>, favorites: Vec<FavoriteChannel>) {
        self.by_network.insert(network.into(), favorites);
    }
}

#[async_trait]
impl FavoritesProvider for StaticFavorites {
    async fn auto_join_channels(&self, network: &str) -> Vec<FavoriteChannel> {
        self.by_network
            .get(network)
            .map(|favorites| favorites.iter().filter(|f| f.auto_join).cloned().collect())
            .unwrap_or_default()
    }
}
