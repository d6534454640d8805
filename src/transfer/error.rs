//! Error types for the transfer module.
//!
//! Every variant carries the context (URL or path) needed for the failure to
//! be surfaced to a user and classified for retry.

use std::path::PathBuf;

use thiserror::Error;

use crate::content::ContentError;

/// Errors that can occur while transferring a unit.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection reset, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Raw `Retry-After` header, when the server sent one.
        retry_after: Option<String>,
    },

    /// Local filesystem error while staging the payload.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The source location is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Staged file does not match the length the server declared.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// Staging path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// The content API could not supply a source for the unit.
    #[error("could not resolve source for {target}: {message}")]
    Resolve {
        /// Unit the resolution was for.
        target: String,
        /// Collaborator's error text.
        message: String,
        /// The content API reported the unit does not exist.
        not_found: bool,
    },

    /// Committing the staged payload into the content store failed.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl TransferError {
    /// Creates a network error from a reqwest error, folding timeouts into [`TransferError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::timeout(url);
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::http_status_with_retry_after(url, status, None)
    }

    /// Creates an HTTP status error carrying the server's `Retry-After` value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a source resolution error.
    pub fn resolve(target: impl Into<String>, message: impl Into<String>, not_found: bool) -> Self {
        Self::Resolve {
            target: target.into(),
            message: message.into(),
            not_found,
        }
    }
}
