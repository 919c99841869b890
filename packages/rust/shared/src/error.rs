//! Error types for tdpflow.
//!
//! Library crates use [`TdpFlowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::DocumentKind;

/// Top-level error type for all tdpflow operations.
#[derive(Debug, thiserror::Error)]
pub enum TdpFlowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A step rejected its input (malformed or unsupported content).
    #[error("content error: {message}")]
    Content { message: String },

    /// The requested document does not exist under the scenario.
    #[error("{kind} document '{file_name}' not found in scenario '{scenario}'")]
    NotFound {
        scenario: String,
        kind: DocumentKind,
        file_name: String,
    },

    /// Database or persistence layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A step or pipeline could not be constructed. Never retryable.
    #[error("cannot construct {agent}: {message}")]
    Construction { agent: String, message: String },

    /// Connection-level failure talking to a search, vector or graph backend.
    #[error("{backend} backend error: {message}")]
    Backend { backend: String, message: String },

    /// Model bridge subprocess error.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad identifiers, invalid descriptors, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TdpFlowError>;

impl TdpFlowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a content error from any displayable message.
    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content {
            message: msg.into(),
        }
    }

    /// Create a construction error for the named agent or group.
    pub fn construction(agent: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Construction {
            agent: agent.into(),
            message: msg.into(),
        }
    }

    /// Create a backend error for the named backend.
    pub fn backend(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(
        scenario: impl Into<String>,
        kind: DocumentKind,
        file_name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            scenario: scenario.into(),
            kind,
            file_name: file_name.into(),
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

    /// Whether this is a persistence miss (as opposed to a backend failure).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error comes from a misconfigured step or pipeline.
    pub fn is_construction(&self) -> bool {
        matches!(self, Self::Construction { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = TdpFlowError::config("missing data dir");
        assert_eq!(err.to_string(), "config error: missing data dir");

        let err = TdpFlowError::construction("TextChunkAgent", "output extension not provided");
        assert!(err.to_string().contains("TextChunkAgent"));
        assert!(err.is_construction());
    }

    #[test]
    fn not_found_names_kind_and_file() {
        let err = TdpFlowError::not_found("s1", DocumentKind::Derivative, "report_2.json");
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "derivative document 'report_2.json' not found in scenario 's1'"
        );
    }

    #[test]
    fn backend_error_names_backend() {
        let err = TdpFlowError::backend("qdrant", "connection refused");
        assert_eq!(err.to_string(), "qdrant backend error: connection refused");
        assert!(!err.is_not_found());
    }
}
