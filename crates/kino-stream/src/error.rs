//! Error types for Kino Stream

use crate::net::should_retry_status;
use crate::sink::SinkError;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Manifest errors
    #[error("Failed to fetch manifest: {0}")]
    ManifestFetch(String),

    #[error("Manifest request for {url} returned HTTP {status}")]
    ManifestStatus { url: String, status: u16 },

    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("No rendition satisfies the selection constraints: {0}")]
    NoSuitableRendition(String),

    #[error("Playlist has no segments: {0}")]
    EmptyPlaylist(String),

    // Segment errors
    #[error("Failed to fetch segment {url}: {reason}")]
    SegmentFetch { url: String, reason: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("Operation aborted")]
    Aborted,

    // Sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("No media sink attached")]
    NoSinkAttached,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error for a connection-class failure
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transport {
            message: msg.into(),
            transient: true,
        }
    }

    /// Create a transport error that must not be retried
    pub fn fatal_transport(msg: impl Into<String>) -> Self {
        Error::Transport {
            message: msg.into(),
            transient: false,
        }
    }

    /// Returns true if the session was cancelled while this operation ran
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    /// Returns true for connection/name-resolution class failures.
    ///
    /// HTTP statuses are classified separately by the retry policy.
    pub fn is_transient_network(&self) -> bool {
        match self {
            Error::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::Transport { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Returns true for an HTTP status that retrying will not change
    pub fn is_permanent_status(&self) -> bool {
        match self {
            Error::HttpStatus { status, .. } | Error::ManifestStatus { status, .. } => {
                !should_retry_status(*status)
            }
            _ => false,
        }
    }

    /// Returns true if steady-state scheduling can absorb this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SegmentFetch { .. }
                | Error::HttpStatus { .. }
                | Error::Network(_)
                | Error::Transport { .. }
                | Error::Aborted
                | Error::Sink(SinkError::QuotaExceeded { .. })
                | Error::Sink(SinkError::Closed)
        )
    }

    /// Returns the error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::ManifestFetch(_) => "MANIFEST_FETCH",
            Error::ManifestStatus { .. } => "MANIFEST_STATUS",
            Error::InvalidUri { .. } => "INVALID_URI",
            Error::NoSuitableRendition(_) => "NO_RENDITION",
            Error::EmptyPlaylist(_) => "EMPTY_PLAYLIST",
            Error::SegmentFetch { .. } => "SEGMENT_FETCH",
            Error::HttpStatus { .. } => "HTTP_STATUS",
            Error::Network(_) => "NETWORK",
            Error::Transport { .. } => "TRANSPORT",
            Error::Aborted => "ABORTED",
            Error::Sink(SinkError::QuotaExceeded { .. }) => "SINK_QUOTA",
            Error::Sink(SinkError::Closed) => "SINK_CLOSED",
            Error::Sink(_) => "SINK",
            Error::NoSinkAttached => "NO_SINK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
        }
    }
}
