//! Error types for the Floodgate service.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected limit updates (zero request count or zero window)
    #[error("Invalid limits: {0}")]
    InvalidLimits(String),

    /// Upstream HTTP client errors
    #[error("Client error: {0}")]
    Client(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
