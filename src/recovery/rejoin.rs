//! Channel rejoin after a reconnect.
//!
//! Behind a bouncer that replays backlog, a playback request restores
//! channel presence on its own. Otherwise every tracked channel, then every
//! auto-join favorite not already tracked, gets one JOIN, spaced out to stay
//! clear of server flood protection. Failed joins are not retried here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::common::{BouncerInfo, FavoriteChannel, RecoveryEvent};
use crate::services::{BouncerProvider, FavoritesProvider, Transport};

/// Spacing between consecutive JOINs.
pub const JOIN_STAGGER: Duration = Duration::from_millis(1_000);
/// Wait before asking the bouncer for playback.
pub const PLAYBACK_SETTLE: Duration = Duration::from_millis(1_000);

/// One JOIN to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub channel: String,
    pub key: Option<String>,
}

/// How channel presence gets restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinPlan {
    /// Let the bouncer replay everything.
    Playback,
    /// Join these channels, in order.
    Join(Vec<JoinRequest>),
}

/// Build the rejoin plan for a network.
///
/// Tracked channels come first in their stored order, then favorites that
/// are not tracked yet. A favorite's key is used for a tracked channel of
/// the same name.
pub fn plan_rejoin(tracked: &[String], favorites: &[FavoriteChannel], bouncer: BouncerInfo) -> RejoinPlan {
    if bouncer.playback_supported {
        return RejoinPlan::Playback;
    }

    let key_for = |channel: &str| {
        favorites
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(channel))
            .and_then(|f| f.key.clone())
    };

    let mut requests: Vec<JoinRequest> = Vec::with_capacity(tracked.len() + favorites.len());
    let mut push = |channel: &str, key: Option<String>| {
        if !requests.iter().any(|r| r.channel.eq_ignore_ascii_case(channel)) {
            requests.push(JoinRequest {
                channel: channel.to_string(),
                key,
            });
        }
    };

    for channel in tracked {
        push(channel, key_for(channel));
    }
    for favorite in favorites {
        push(&favorite.name, favorite.key.clone());
    }

    RejoinPlan::Join(requests)
}

/// Timing knobs for the rejoin run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejoinTiming {
    pub join_stagger: Duration,
    pub playback_settle: Duration,
}

impl Default for RejoinTiming {
    fn default() -> Self {
        Self {
            join_stagger: JOIN_STAGGER,
            playback_settle: PLAYBACK_SETTLE,
        }
    }
}

/// Everything a rejoin run needs; moved into its own task.
pub struct RejoinJob {
    pub network: String,
    pub tracked: Vec<String>,
    pub favorites: Arc<dyn FavoritesProvider>,
    pub bouncer: Arc<dyn BouncerProvider>,
    pub transport: Option<Arc<dyn Transport>>,
    pub timing: RejoinTiming,
    pub events: broadcast::Sender<RecoveryEvent>,
}

impl RejoinJob {
    /// Restore channel presence. Errors are logged, never returned.
    pub async fn run(self) {
        let favorites = self.favorites.auto_join_channels(&self.network).await;
        let plan = plan_rejoin(
            &self.tracked,
            &favorites,
            self.bouncer.bouncer_info(&self.network),
        );

        match plan {
            RejoinPlan::Playback => {
                sleep(self.timing.playback_settle).await;
                info!("[{}] Requesting bouncer playback instead of rejoining", self.network);
                let _ = self.events.send(RecoveryEvent::PlaybackRequested {
                    network: self.network.clone(),
                });
                if let Err(e) = self.bouncer.request_playback(&self.network).await {
                    warn!("[{}] Playback request failed: {}", self.network, e);
                }
            }
            RejoinPlan::Join(requests) if requests.is_empty() => {
                debug!("[{}] Nothing to rejoin", self.network);
            }
            RejoinPlan::Join(requests) => {
                let Some(transport) = self.transport else {
                    warn!(
                        "[{}] No transport registered, cannot rejoin {} channel(s)",
                        self.network,
                        requests.len()
                    );
                    return;
                };

                info!("[{}] Rejoining {} channel(s)", self.network, requests.len());
                let _ = self.events.send(RecoveryEvent::Rejoining {
                    network: self.network.clone(),
                    channels: requests.iter().map(|r| r.channel.clone()).collect(),
                });

                for (index, request) in requests.iter().enumerate() {
                    if index > 0 {
                        sleep(self.timing.join_stagger).await;
                    }
                    debug!("[{}] JOIN {}", self.network, request.channel);
                    if let Err(e) = transport
                        .join_channel(&request.channel, request.key.as_deref())
                        .await
                    {
                        warn!("[{}] Failed to join {}: {}", self.network, request.channel, e);
                    }
                }
            }
        }
    }
}
