//! Error types for stowaway-core

use thiserror::Error;

/// Main error type for the stowaway-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error (cache containers, log directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while building a bulk request body
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A packet could not be delivered to the collector
    #[error("transmission error: {0}")]
    Transmission(String),

    /// The async runtime cannot serve the requested operation
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for stowaway-core
pub type Result<T> = std::result::Result<T, Error>;
