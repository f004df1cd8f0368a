//! Intentional-disconnect gate.
//!
//! A marker set when the user closes a connection on purpose. The next
//! disconnect evaluation consumes it and skips the retry. Markers expire
//! after a fixed window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::common::NetworkId;

/// How long an intentional-disconnect marker stays valid.
pub const INTENTIONAL_DISCONNECT_WINDOW: Duration = Duration::from_millis(5_000);

#[derive(Debug)]
pub struct IntentionalDisconnectGate {
    window: Duration,
    markers: HashMap<NetworkId, Instant>,
}

impl Default for IntentionalDisconnectGate {
    fn default() -> Self {
        Self::new(INTENTIONAL_DISCONNECT_WINDOW)
    }
}

impl IntentionalDisconnectGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            markers: HashMap::new(),
        }
    }

    /// Set (or refresh) the marker for a network.
    pub fn mark(&mut self, network: &str, now: Instant) {
        self.markers.insert(network.to_string(), now);
    }

    /// Drop the marker without consuming it.
    pub fn clear(&mut self, network: &str) -> bool {
        self.markers.remove(network).is_some()
    }

    /// Take the marker. Returns `true` only if it was set within the window;
    /// a stale marker is discarded and counts as absent.
    pub fn consume(&mut self, network: &str, now: Instant) -> bool {
        match self.markers.remove(network) {
            Some(set_at) => now.saturating_duration_since(set_at) <= self.window,
            None => false,
        }
    }

    /// Drop every expired marker.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.markers
            .retain(|_, set_at| now.saturating_duration_since(*set_at) <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_is_single_use() {
        let mut gate = IntentionalDisconnectGate::default();
        let now = Instant::now();

        gate.mark("net", now);
        assert!(gate.consume("net", now + Duration::from_millis(100)));
        assert!(!gate.consume("net", now + Duration::from_millis(200)));
        assert!(gate.markers.is_empty());
    }

    #[test]
    fn test_stale_marker_counts_as_absent() {
        let mut gate = IntentionalDisconnectGate::default();
        let now = Instant::now();

        gate.mark("net", now);
        assert!(!gate.consume("net", now + Duration::from_millis(5_001)));
        assert!(gate.markers.is_empty());
    }

    #[test]
    fn test_window_edge_is_inclusive() {
        let mut gate = IntentionalDisconnectGate::default();
        let now = Instant::now();

        gate.mark("net", now);
        assert!(gate.consume("net", now + INTENTIONAL_DISCONNECT_WINDOW));
    }

    #[test]
    fn test_networks_are_independent() {
        let mut gate = IntentionalDisconnectGate::default();
        let now = Instant::now();

        gate.mark("a", now);
        assert!(!gate.consume("b", now));
        assert!(gate.consume("a", now));
    }

    #[test]
    fn test_clear_and_prune() {
        let mut gate = IntentionalDisconnectGate::new(Duration::from_secs(1));
        let now = Instant::now();

        gate.mark("a", now);
        gate.mark("b", now + Duration::from_secs(2));
        assert!(gate.clear("a"));
        assert!(!gate.clear("a"));

        gate.mark("c", now);
        gate.prune(now + Duration::from_millis(2_500));
        assert_eq!(gate.markers.len(), 1);
        assert!(gate.consume("b", now + Duration::from_millis(2_500)));
    }
}
