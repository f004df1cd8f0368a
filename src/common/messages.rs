//! Event types exchanged between transports, the recovery engine and the UI.

use std::time::Duration;

/// Events a transport reports to its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and registered.
    Connected,
    /// The connection dropped (for any reason).
    Disconnected,
    /// The user asked to quit; a `Disconnected` follows shortly.
    IntentionalQuit,
    /// We joined a channel.
    Joined { channel: String },
    /// We left a channel.
    Parted { channel: String },
    /// We were kicked from a channel.
    Kicked { channel: String, by: Option<String> },
}

/// Progress notifications published by the recovery engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    /// A reconnect attempt has been scheduled.
    Scheduled {
        network: String,
        attempt: u32,
        delay: Duration,
    },
    /// A reconnect attempt is starting now.
    Attempting { network: String, attempt: u32 },
    /// A reconnect attempt failed.
    AttemptFailed {
        network: String,
        attempt: u32,
        reason: String,
    },
    /// The attempt limit is reached; no further retries.
    GaveUp { network: String, attempts: u32 },
    /// The connection is back.
    Recovered { network: String },
    /// Channels are being rejoined.
    Rejoining { network: String, channels: Vec<String> },
    /// Backlog playback was requested from the bouncer instead of rejoining.
    PlaybackRequested { network: String },
}
