//! Error types for the audio state daemon

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("State file error: {0}")]
    State(#[from] StateError),

    #[error("Audio service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a request issued through the native audio context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Backend reported failure for {0}")]
    Failed(String),

    #[error("No reply for {0} within {1} ms")]
    Timeout(String, u64),

    #[error("Can't obtain this instance for: {0}")]
    NotFound(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Persisted snapshot file errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode state: {0}")]
    Encode(String),

    #[error("Failed to decode state: {0}")]
    Decode(String),
}

/// Errors reported by the external audio service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Query failed: {0}")]
    Query(#[from] QueryError),
}

/// Daemon configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not resolve a config directory")]
    NoConfigDir,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
