//! Error types for chatkb.
//!
//! Library crates use [`ChatKbError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all chatkb operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatKbError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error while reading inputs or config.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Extraction service failure worth retrying (network, 429, 5xx).
    #[error("extraction service unavailable: {0}")]
    ServiceTransient(String),

    /// Extraction service rejected the request; retrying will not help.
    #[error("extraction service error: {0}")]
    ServicePermanent(String),

    /// The service replied, but not in the expected structure.
    #[error("malformed extraction response: {0}")]
    MalformedResponse(String),

    /// Publishing the knowledge file failed.
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invariant violation in a published file, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ChatKbError>;

impl ChatKbError {
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

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a publish failure with the target path.
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// Whether the extraction client should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceTransient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ChatKbError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ChatKbError::validation("total 3 does not match 2 items");
        assert!(err.to_string().contains("total 3"));
    }

    #[test]
    fn only_transient_service_errors_retry() {
        assert!(ChatKbError::ServiceTransient("HTTP 429".into()).is_transient());
        assert!(!ChatKbError::ServicePermanent("HTTP 401".into()).is_transient());
        assert!(!ChatKbError::MalformedResponse("not an array".into()).is_transient());
    }

    #[test]
    fn write_error_keeps_path() {
        let err = ChatKbError::write(
            "/srv/knowledge.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("knowledge.json"));
        assert!(matches!(err, ChatKbError::Write { .. }));
    }
}
