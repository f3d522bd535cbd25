//! Error types for Drishti capture

use std::path::PathBuf;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Drishti capture error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (socket, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protobuf decode failure
    #[error("Decode error: {0}")]
    Decode(String),

    /// YAML (de)serialization failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// External binary could not be started
    #[error("Failed to launch {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No multicast group left for another worker
    #[error("Multicast address space exhausted: {requested} exceeds last octet range")]
    AddressSpaceExhausted {
        /// Counter value that would have been used
        requested: u32,
    },

    /// Retry ceiling reached before the capture converged
    #[error("Capture did not converge after {attempts} attempts (expected {expected}, last {last})")]
    RetriesExhausted {
        attempts: u32,
        expected: usize,
        last: usize,
    },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
