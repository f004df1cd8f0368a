//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `REJOINDER_CONFIG` - Config file path
//! - `REJOINDER_STORAGE_PATH` - State file path
//! - `REJOINDER_NICK` - Nick for every network
//! - `REJOINDER_<ID>_PASSWORD` - Server password of the network `<id>`

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "REJOINDER";

/// Name of the password variable for a network id.
///
/// The id is upper-cased and anything but ASCII alphanumerics becomes `_`.
pub fn password_var(network_id: &str) -> String {
    let id: String = network_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}_PASSWORD", ENV_PREFIX, id)
}

/// Apply environment variable overrides to a config.
///
/// Lets server passwords stay out of the config file.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(path) = env::var(format!("{}_STORAGE_PATH", ENV_PREFIX)) {
        config.storage.path = path;
    }

    let nick = env::var(format!("{}_NICK", ENV_PREFIX)).ok();
    for network in &mut config.networks {
        if let Some(ref nick) = nick {
            network.server.nick = nick.clone();
        }
        if let Ok(password) = env::var(password_var(&network.id)) {
            network.server.password = Some(password);
        }
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `REJOINDER_CONFIG` environment variable, otherwise returns "rejoinder.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "rejoinder.conf".to_string())
}
