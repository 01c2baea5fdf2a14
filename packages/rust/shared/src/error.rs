//! Error types for storyforge.
//!
//! Library crates use [`StoryforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all storyforge operations.
#[derive(Debug, thiserror::Error)]
pub enum StoryforgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network, timeout, or non-success response from a generation backend.
    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    /// Language-model output that could not be parsed into the expected shape.
    #[error("malformed model output: {message}")]
    MalformedOutput { message: String },

    /// Cooperative cancellation was requested. A control signal, not a failure.
    #[error("run cancelled")]
    Cancelled,

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A referenced book, task entry, or line does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invalid book tree, bad chunk bounds, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StoryforgeError>;

impl StoryforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a provider error tagged with the provider id.
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed-output error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
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

    /// Whether this error is worth one more request-and-parse attempt.
    pub fn is_retryable_parse(&self) -> bool {
        matches!(self, Self::MalformedOutput { .. })
    }

    /// Whether this error is the cancellation control signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
