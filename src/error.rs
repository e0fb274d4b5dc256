//! Error types for the Parley gateway

use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Parley gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential edit that cannot be resolved against the stored config
    #[error("credential error: {0}")]
    Credential(String),

    /// Chat-client driver error
    #[error("driver error: {0}")]
    Driver(String),

    /// Language-model endpoint error
    #[error("upstream error: {0}")]
    Upstream(#[from] crate::upstream::UpstreamError),

    /// No preset answered the startup probe
    #[error("no usable preset: {0}")]
    NoUsablePreset(String),

    /// Orchestrator state transition not allowed from the current state
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Reconnect budget exhausted
    #[error("reconnect failed: {0}")]
    Reconnect(String),

    /// Reply dispatch failure
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("toml write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),
}
