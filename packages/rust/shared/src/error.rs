//! Error types for the xAIO pipeline.
//!
//! Library crates use [`XaioError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum XaioError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Queue store read or write error.
    #[error("queue error: {0}")]
    Queue(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON (de)serialization error for an artifact or payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Network failure, timeout, or rate limit. Safe to retry.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The generative service refused the request or returned output that
    /// did not match the requested schema. Never retried.
    #[error("schema refusal (raw response at {raw_path:?}): {message}")]
    SchemaRefused { message: String, raw_path: PathBuf },

    /// A remote service rejected the request for a non-transient reason.
    #[error("remote error: {0}")]
    Remote(String),

    /// An upstream artifact or required field is missing.
    #[error("missing precondition: {message}")]
    Precondition { message: String },

    /// The publish target accepted the request but reported failure.
    #[error("publish rejected: {0}")]
    Publish(String),

    /// An external stage command exited unsuccessfully.
    #[error("command `{program}` failed: {message}")]
    Command { program: String, message: String },

    /// Data validation error (invalid payload, unknown stage, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, XaioError>;

impl XaioError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a missing-precondition error.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the remote retry policy may re-attempt the operation that
    /// produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for XaioError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
