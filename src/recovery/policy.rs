//! Reconnect policy: per-network settings, exponential backoff and the
//! disconnect evaluation step.
//!
//! Everything here is pure. The engine feeds in the current phase, config
//! and attempt counter and applies the decision it gets back.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MIN_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_min_reconnect_interval_ms() -> u64 {
    DEFAULT_MIN_RECONNECT_INTERVAL_MS
}

/// Per-network reconnect settings.
///
/// Missing numeric fields take the documented defaults when deserialized;
/// missing flags are off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// `None` or `Some(0)` means unlimited.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub rejoin_channels: bool,
    /// Enforce `min_reconnect_interval_ms` between consecutive attempts.
    #[serde(default)]
    pub smart_reconnect: bool,
    #[serde(default = "default_min_reconnect_interval_ms")]
    pub min_reconnect_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            rejoin_channels: true,
            smart_reconnect: true,
            min_reconnect_interval_ms: DEFAULT_MIN_RECONNECT_INTERVAL_MS,
        }
    }
}

impl ReconnectConfig {
    /// Effective attempt limit (`None` = unlimited).
    pub fn attempt_limit(&self) -> Option<u32> {
        self.max_attempts.filter(|&max| max > 0)
    }

    /// Whether `attempts` executed attempts exhaust the limit.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.attempt_limit().is_some_and(|max| attempts >= max)
    }

    /// Backoff delay before the next attempt, given the attempts made so far.
    ///
    /// `min(initial * multiplier^attempts, max)`, never above `max_delay_ms`.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let max_ms = self.max_delay_ms as f64;
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let ms = if raw.is_nan() {
            max_ms
        } else {
            raw.clamp(0.0, max_ms)
        };
        Duration::from_millis(ms as u64)
    }

    pub fn min_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.min_reconnect_interval_ms)
    }

    /// Extra wait imposed by smart reconnect, given the time elapsed since
    /// the previous attempt on this network.
    pub fn flood_wait(&self, since_last_attempt: Option<Duration>) -> Duration {
        if !self.smart_reconnect {
            return Duration::ZERO;
        }
        match since_last_attempt {
            Some(elapsed) => self.min_reconnect_interval().saturating_sub(elapsed),
            None => Duration::ZERO,
        }
    }

    /// Total delay until the next attempt fires: the flood wait (if any)
    /// followed by the backoff delay.
    pub fn next_attempt_delay(&self, attempts: u32, since_last_attempt: Option<Duration>) -> Duration {
        self.flood_wait(since_last_attempt) + self.backoff_delay(attempts)
    }
}

/// Recovery phase of one network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Idle,
    /// A reconnect attempt is scheduled and waiting on its timer.
    AwaitingBackoff,
    /// A connect call is in flight.
    Connecting,
    Connected,
}

impl Phase {
    /// A retry is scheduled or running.
    pub fn is_recovering(self) -> bool {
        matches!(self, Phase::AwaitingBackoff | Phase::Connecting)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::AwaitingBackoff => "awaiting-backoff",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Inputs to the disconnect evaluation.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectContext<'a> {
    /// An intentional-disconnect marker was consumed for this event.
    pub intentional: bool,
    pub phase: Phase,
    pub config: Option<&'a ReconnectConfig>,
    /// Attempt counter of the stored connection state, if there is one.
    pub attempts: Option<u32>,
}

/// What to do about a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectDecision {
    /// User-initiated; stay idle.
    Intentional,
    /// A retry is already scheduled or running; ignore the event.
    AlreadyRecovering,
    /// No config, or reconnect is disabled.
    Disabled,
    /// Nothing stored to reconnect with.
    NoState,
    /// Attempt limit reached; give up until manually reset.
    Exhausted { attempts: u32 },
    /// Schedule the next attempt.
    Schedule { attempts: u32 },
}

/// Evaluate a disconnect, checks applied in order.
pub fn evaluate_disconnect(ctx: DisconnectContext<'_>) -> DisconnectDecision {
    if ctx.intentional {
        return DisconnectDecision::Intentional;
    }
    if ctx.phase.is_recovering() {
        return DisconnectDecision::AlreadyRecovering;
    }
    let config = match ctx.config {
        Some(config) if config.enabled => config,
        _ => return DisconnectDecision::Disabled,
    };
    let attempts = match ctx.attempts {
        Some(attempts) => attempts,
        None => return DisconnectDecision::NoState,
    };
    if config.is_exhausted(attempts) {
        return DisconnectDecision::Exhausted { attempts };
    }
    DisconnectDecision::Schedule { attempts }
}
