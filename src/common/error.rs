//! Error types for the application.

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Persistence errors (state/config store).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed stored value under '{key}': {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported schema version {version} under '{key}'")]
    UnsupportedVersion { key: String, version: u64 },
}

/// Transport-related errors (IRC connection).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Registration failed: {reason}")]
    RegistrationFailed { reason: String },

    #[error("Refusing to send a line with an embedded line break: {line:?}")]
    InvalidLine { line: String },

    #[error("Connection pool refused network '{network}': {reason}")]
    PoolRejected { network: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
}

/// Errors returned by the recovery handle.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Recovery engine has stopped")]
    EngineStopped,

    #[error("Invalid network identifier: {network:?}")]
    InvalidNetwork { network: String },

    #[error("Invalid channel name: {channel:?}")]
    InvalidChannel { channel: String },
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias for recovery handle operations.
pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;
