//! Error types for the Q-vector correction framework

use thiserror::Error;

/// Framework error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input data or parameter value
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration or build-time mistake (mismatched structure, undeclared
    /// harmonic, double fill, duplicate id). Not recoverable.
    #[error("Structural error: {0}")]
    Structural(String),

    /// A named object (detector, configuration, accumulator) does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
