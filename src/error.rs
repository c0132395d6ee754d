//! Error types for the retrieval and answer pipeline
//!
//! Library code returns [`Result`]; the CLI wraps these in `anyhow`.
//! Each variant maps to an [`ErrorKind`] so callers can tell
//! "try again" apart from "something is broken".

use std::fmt;

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ErrorKind
// ============================================================================

/// Coarse failure category, stable across variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Model call failed or timed out and may succeed on retry
    TransientUpstream,
    /// Model service rejected the request permanently
    Upstream,
    /// A retrieval path (lexical or vector) is down
    IndexUnavailable,
    /// Nothing to work with (no text, no chunks, no results)
    EmptyInput,
    /// Vector dimension disagrees with the index configuration
    ConfigurationMismatch,
    /// Deadline exceeded
    Timeout,
    /// Invalid configuration or internal invariant violation
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientUpstream => "transient_upstream",
            ErrorKind::Upstream => "upstream",
            ErrorKind::IndexUnavailable => "index_unavailable",
            ErrorKind::EmptyInput => "empty_input",
            ErrorKind::ConfigurationMismatch => "configuration_mismatch",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ============================================================================
// RagError
// ============================================================================

#[derive(Debug, Error)]
pub enum RagError {
    #[error("{service} call failed: {message}")]
    TransientUpstream {
        service: &'static str,
        message: String,
    },

    #[error("{service} rejected the request ({status}): {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("{path} index unavailable: {reason}")]
    IndexUnavailable { path: &'static str, reason: String },

    #[error("no content: {what}")]
    EmptyInput { what: String },

    #[error("document {document_id} has no parsed text")]
    NotParsed { document_id: String },

    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    ConfigurationMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("embedding batch returned {actual} vectors for {expected} inputs")]
    EmbeddingBatchMismatch { expected: usize, actual: usize },

    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::TransientUpstream { .. } => ErrorKind::TransientUpstream,
            RagError::EmbeddingBatchMismatch { .. } => ErrorKind::TransientUpstream,
            RagError::Upstream { .. } => ErrorKind::Upstream,
            RagError::IndexUnavailable { .. } => ErrorKind::IndexUnavailable,
            RagError::EmptyInput { .. } | RagError::NotParsed { .. } => ErrorKind::EmptyInput,
            RagError::ConfigurationMismatch { .. } => ErrorKind::ConfigurationMismatch,
            RagError::Timeout { .. } => ErrorKind::Timeout,
            RagError::InvalidConfig(_) | RagError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::TransientUpstream { .. } | RagError::Timeout { .. }
        )
    }

    pub(crate) fn lexical_index(reason: impl fmt::Display) -> Self {
        RagError::IndexUnavailable {
            path: "lexical",
            reason: reason.to_string(),
        }
    }

    pub(crate) fn vector_index(reason: impl fmt::Display) -> Self {
        RagError::IndexUnavailable {
            path: "vector",
            reason: reason.to_string(),
        }
    }

    /// Map a reqwest failure; connection problems and timeouts are transient
    pub(crate) fn from_http(service: &'static str, err: reqwest::Error) -> Self {
        RagError::TransientUpstream {
            service,
            message: err.to_string(),
        }
    }

    /// Map a non-success HTTP status; 429 and 5xx are transient
    pub(crate) fn from_status(service: &'static str, status: reqwest::StatusCode, body: String) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            RagError::TransientUpstream {
                service,
                message: format!("HTTP {}: {}", status, body),
            }
        } else {
            RagError::Upstream {
                service,
                status: status.as_u16(),
                message: body,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
