//! Error types for the edge cache node.
//!
//! This module provides a unified error type [`EdgeError`] for all node
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Cancelled**: the surrounding operation was cancelled; never logged
//!   as an error by callers
//! - **Transport**: socket dial and HTTP round-trip failures, retried by
//!   the lifecycle reconnect and per-file sync retry
//! - **ProtocolNack**: the control plane acknowledged with a non-null error
//! - **Integrity**: size or digest mismatch on a downloaded file
//! - **Storage**: lookup misses and upstream status errors on serve paths
//! - **Configuration**: invalid settings, fatal at startup

use std::io;
use thiserror::Error;

/// Main error type for edge node operations.
#[derive(Error, Debug)]
pub enum EdgeError {
    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A timeout elapsed while waiting for a remote reply.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    // Control plane errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("control plane rejected request: {0}")]
    ProtocolNack(String),

    #[error("not connected to the control plane")]
    NotConnected,

    // Download integrity errors
    #[error("file size mismatch: got {got}, expect {expected}")]
    SizeMismatch { expected: i64, got: i64 },

    #[error("file hash mismatch: got {got}, expect {expected}")]
    HashMismatch { expected: String, got: String },

    /// Hash strings must be 32 (MD5) or 40 (SHA-1) hex characters.
    #[error("unknown hash length: {0}")]
    UnknownHash(usize),

    // Storage errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected upstream status: {0}")]
    HttpStatus(u16),

    #[error("storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("invalid configuration: {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EdgeError {
    /// Build a `ConfigInvalid` error from a field path and a reason.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EdgeError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check whether this error reports cancellation; cancellation is
    /// propagated silently, never logged at error level.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EdgeError::Cancelled)
    }

    /// Check whether this error reports a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            EdgeError::NotFound(_) => true,
            EdgeError::HttpStatus(404) => true,
            EdgeError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check whether the operation may be retried.
    ///
    /// Integrity failures count against the per-file retry budget; protocol
    /// nacks and configuration errors never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EdgeError::Transport(_)
                | EdgeError::Timeout(_)
                | EdgeError::SizeMismatch { .. }
                | EdgeError::HashMismatch { .. }
                | EdgeError::HttpStatus(_)
                | EdgeError::Io(_)
        )
    }
}

impl From<reqwest::Error> for EdgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EdgeError::Timeout(0)
        } else {
            EdgeError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for EdgeError {
    fn from(e: serde_json::Error) -> Self {
        EdgeError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for EdgeError {
    fn from(e: bincode::Error) -> Self {
        EdgeError::Serialization(e.to_string())
    }
}

impl From<apache_avro::Error> for EdgeError {
    fn from(e: apache_avro::Error) -> Self {
        EdgeError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for EdgeError {
    fn from(e: url::ParseError) -> Self {
        EdgeError::Internal(format!("invalid URL: {}", e))
    }
}

/// Result type alias for edge node operations.
pub type Result<T> = std::result::Result<T, EdgeError>;
