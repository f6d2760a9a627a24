//! Error types for scene construction.

use thiserror::Error;

/// Scene-level error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Model file could not be read or parsed
    #[error("Failed to load model {path}: {message}")]
    ModelLoad { path: String, message: String },

    /// Camera configuration that cannot produce a view basis
    #[error("Degenerate camera: {0}")]
    DegenerateCamera(String),

    /// Frame with a zero or non-finite aspect ratio
    #[error("Invalid aspect ratio: {0}")]
    InvalidAspect(f32),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
