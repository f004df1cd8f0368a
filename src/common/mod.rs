//! Common utilities and types shared across the application.

pub mod error;
pub mod messages;
pub mod types;

pub use messages::{RecoveryEvent, TransportEvent};
pub use types::{is_channel_name, BouncerInfo, FavoriteChannel, NetworkId, NetworkProfile, ServerConfig};
