//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use std::collections::HashSet;

use fancy_regex::Regex;

use crate::common::error::ConfigError;
use crate::common::is_channel_name;
use crate::config::types::Config;

/// RFC 2812 nickname: a letter or special first, then letters, digits,
/// specials or `-`.
const NICK_PATTERN: &str = r"^[A-Za-z\[\]\\`_^{|}][A-Za-z0-9\[\]\\`_^{|}-]{0,29}$";

fn is_valid_nick(pattern: &Regex, nick: &str) -> bool {
    pattern.is_match(nick).unwrap_or(false)
}

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let nick_pattern = Regex::new(NICK_PATTERN).map_err(|e| ConfigError::ValidationError {
        message: format!("invalid nick pattern: {}", e),
    })?;
    let mut errors = Vec::new();

    if config.storage.path.trim().is_empty() {
        errors.push("storage.path is required".to_string());
    }
    if config.networks.is_empty() {
        errors.push("networks is empty - nothing to connect to".to_string());
    }

    let mut seen = HashSet::new();
    for (i, network) in config.networks.iter().enumerate() {
        let at = format!("networks[{}]", i);

        if network.id.trim().is_empty() {
            errors.push(format!("{}.id is required", at));
        } else if !seen.insert(network.id.as_str()) {
            errors.push(format!("{}.id '{}' is used more than once", at, network.id));
        }

        // Server
        let server = &network.server;
        if server.host.is_empty() {
            errors.push(format!("{}.server.host is required", at));
        }
        if server.port == 0 {
            errors.push(format!("{}.server.port must be non-zero", at));
        }
        if server.tls {
            errors.push(format!(
                "{}.server.tls is not supported, use a plain-text port",
                at
            ));
        }
        if !is_valid_nick(&nick_pattern, &server.nick) {
            errors.push(format!("{}.server.nick '{}' is not a valid nickname", at, server.nick));
        }

        // Reconnect policy
        let reconnect = &network.reconnect;
        if reconnect.initial_delay_ms == 0 {
            errors.push(format!("{}.reconnect.initial_delay_ms must be non-zero", at));
        }
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            errors.push(format!(
                "{}.reconnect.backoff_multiplier must be a finite number >= 1 (got {})",
                at, reconnect.backoff_multiplier
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            errors.push(format!(
                "{}.reconnect.max_delay_ms must be at least initial_delay_ms",
                at
            ));
        }

        // Favorites
        for (j, favorite) in network.favorites.iter().enumerate() {
            if !is_channel_name(&favorite.name) {
                errors.push(format!(
                    "{}.favorites[{}].name '{}' is not a channel name",
                    at, j, favorite.name
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
