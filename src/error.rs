// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Error types shared across the sync pipeline.
//!
//! One taxonomy for every provider and sink, so the orchestrator can apply
//! uniform retry policy without knowing which provider produced the error.

use std::time::Duration;

/// How decoding a track file failed.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The file parsed but contained no usable trackpoints.
    #[error("track contains no usable points")]
    Empty,

    /// Unrecoverable parse failure (bad XML, truncated FIT, ...).
    #[error("malformed {format} data: {reason}")]
    Malformed {
        format: &'static str,
        reason: String,
    },

    /// Parsed fine but lacks fields we require (e.g. FIT records
    /// without timestamps).
    #[error("unsupported {format} content: {reason}")]
    Unsupported {
        format: &'static str,
        reason: String,
    },
}

impl DecodeError {
    pub fn malformed(format: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            format,
            reason: reason.into(),
        }
    }

    pub fn unsupported(format: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Unsupported {
            format,
            reason: reason.into(),
        }
    }
}

/// Application error type covering adapters, store and sinks.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("activity not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    pub fn auth(msg: impl Into<String>) -> Self {
        SyncError::Auth(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        SyncError::Transient(msg.into())
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        SyncError::RateLimited { retry_after }
    }

    /// Whether the orchestrator should retry the failed call.
    ///
    /// Rate limits are handled separately (they carry their own delay);
    /// auth failures abort the adapter run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Http(_))
    }
}

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, SyncError>;
