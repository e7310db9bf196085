//! Typed error hierarchy for mediaswarm
//!
//! Every error carries enough context to map it to a user-visible cause
//! (connection refused vs timeout vs DNS) and to an HTTP status at the API
//! boundary without string-matching.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::DownloadStatus;

/// Main error type for the download subsystem
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied reference is neither a magnet URI nor a fetchable URL
    #[error("unresolvable source reference: {reference}")]
    UnresolvableSource { reference: String },

    /// The indexer serving a .torrent (or magnet redirect) could not be reached
    #[error("indexer fetch failed ({kind}): {message}")]
    Indexer {
        kind: IndexerErrorKind,
        /// Original reference with any embedded API key redacted
        reference: String,
        message: String,
    },

    /// The swarm engine was not initialized or has shut down
    #[error("swarm engine unavailable")]
    EngineUnavailable,

    /// Unknown download id
    #[error("download not found: {0}")]
    NotFound(String),

    /// Operation requires a different lifecycle state
    #[error("cannot {action} while {current}")]
    NotActive {
        action: &'static str,
        /// Current status, so callers can tell "already paused" from "never started"
        current: DownloadStatus,
    },

    /// Ownership or role check failed at the API boundary
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Terminal swarm error, recorded on the DownloadRecord
    #[error("unrecoverable swarm error: {0}")]
    Unrecoverable(String),

    /// A re-added session did not report ready within the bounded wait.
    /// The record is left untouched, so the caller may simply retry.
    #[error("session for {id} not ready within {timeout:?}")]
    ReadyTimeout {
        id: String,
        timeout: std::time::Duration,
    },

    /// A path parameter tried to escape the download root
    #[error("path escapes download root: {path:?}")]
    PathTraversal { path: PathBuf },

    /// Filesystem error
    #[error("storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// The manager is shutting down
    #[error("manager is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Source Resolver failure subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerErrorKind {
    /// Connection refused or reset
    Unreachable,
    /// Request exceeded the configured timeout
    Timeout,
    /// Hostname did not resolve
    DnsFailure,
    /// Anything else (unexpected status, body error, ...)
    FetchFailed,
}

impl std::fmt::Display for IndexerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::Timeout => write!(f, "timeout"),
            Self::DnsFailure => write!(f, "dns failure"),
            Self::FetchFailed => write!(f, "fetch failed"),
        }
    }
}

impl Error {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Indexer {
                kind: IndexerErrorKind::Timeout | IndexerErrorKind::Unreachable,
                ..
            } | Self::ReadyTimeout { .. }
        )
    }

    /// Categorize a reqwest failure into an indexer error carrying the
    /// (already redacted) reference.
    pub fn from_fetch(err: &reqwest::Error, redacted_reference: &str) -> Self {
        let kind = if err.is_timeout() {
            IndexerErrorKind::Timeout
        } else if err.is_connect() {
            // reqwest surfaces DNS failures as connect errors; dig through the
            // source chain to distinguish them.
            if error_chain_mentions_dns(err) {
                IndexerErrorKind::DnsFailure
            } else {
                IndexerErrorKind::Unreachable
            }
        } else {
            IndexerErrorKind::FetchFailed
        };

        let message = match kind {
            IndexerErrorKind::Timeout => "indexer did not respond in time".to_string(),
            IndexerErrorKind::Unreachable => "connection to indexer refused".to_string(),
            IndexerErrorKind::DnsFailure => "indexer hostname did not resolve".to_string(),
            IndexerErrorKind::FetchFailed => err.to_string(),
        };

        Self::Indexer {
            kind,
            reference: redacted_reference.to_string(),
            message,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }
}

fn error_chain_mentions_dns(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns") || text.contains("resolve") {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Result type alias for subsystem operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::UnresolvableSource {
            reference: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexer_timeout_and_unreachable_are_retryable() {
        let err = Error::Indexer {
            kind: IndexerErrorKind::Timeout,
            reference: "http://indexer/api".to_string(),
            message: "timed out".to_string(),
        };
        assert!(err.is_retryable());

        let err = Error::Indexer {
            kind: IndexerErrorKind::FetchFailed,
            reference: "http://indexer/api".to_string(),
            message: "500".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_active_carries_current_status() {
        let err = Error::NotActive {
            action: "pause",
            current: DownloadStatus::Queued,
        };
        let text = err.to_string();
        assert!(text.contains("pause"));
        assert!(text.contains("queued"));
    }

    #[test]
    fn not_found_is_not_retryable() {
        assert!(!Error::NotFound("abc".to_string()).is_retryable());
    }

    #[test]
    fn ready_timeout_is_retryable_but_unrecoverable_is_not() {
        let err = Error::ReadyTimeout {
            id: "abc".to_string(),
            timeout: std::time::Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert!(!Error::Unrecoverable("engine rejected torrent".to_string()).is_retryable());
    }
}
