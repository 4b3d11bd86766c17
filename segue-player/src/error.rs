//! Error types for segue-player
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for segue-player
#[derive(Error, Debug)]
pub enum Error {
    /// Rendering backend rejected a graph operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Track could not be bound to a stream
    #[error("Track unplayable: {locator}: {reason}")]
    Unplayable { locator: String, reason: String },

    /// Locator is not an absolute URI
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Saved player state could not be used
    #[error("Resume state error: {0}")]
    ResumeState(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors bubbling up from segue-common
    #[error(transparent)]
    Common(#[from] segue_common::Error),
}

/// Convenience Result type using segue-player Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn backend(message: impl Into<String>) -> Self {
        Error::Backend(message.into())
    }

    pub(crate) fn unplayable(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Unplayable {
            locator: locator.into(),
            reason: reason.into(),
        }
    }
}
