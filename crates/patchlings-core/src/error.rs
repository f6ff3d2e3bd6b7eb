//! Error types for patchlings-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for patchlings-core
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timestamp parsing errors
    #[error("Timestamp error: {0}")]
    Timestamp(String),

    /// Event schema validation errors
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Runtime errors (salt state, storage bookkeeping, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}
