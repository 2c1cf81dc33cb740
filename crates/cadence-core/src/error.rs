//! Error types for Cadence Core

use crate::types::{ErrorKind, TrackType};
use thiserror::Error;

/// Result type alias for playback core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Playback core error types
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Protocol errors
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    // Load errors
    #[error("Transient load failure for {url}: {reason}")]
    TransientLoadFailure { url: String, reason: String },

    #[error("Representation {id} excluded for {duration_ms}ms")]
    ExcludedRepresentation { id: String, duration_ms: u64 },

    #[error("All {track_type} representations are excluded")]
    AllRepresentationsExcluded { track_type: TrackType },

    // Selection errors
    #[error("Selection unavailable: {0}")]
    SelectionUnavailable(String),

    // Terminal errors
    #[error("Fatal {kind} error: {cause}")]
    Fatal { kind: ErrorKind, cause: String },

    // Playback errors
    #[error("Invalid playback state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Lifecycle errors
    #[error("Session closed")]
    SessionClosed,

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a fatal error
    pub fn fatal(kind: ErrorKind, cause: impl Into<String>) -> Self {
        Error::Fatal {
            kind,
            cause: cause.into(),
        }
    }

    /// Returns true if this error is resolved inside the load pipeline
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TransientLoadFailure { .. } | Error::ExcludedRepresentation { .. }
        )
    }

    /// The externally visible kind this error maps to when it ends playback
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fatal { kind, .. } => *kind,
            Error::Internal(_) | Error::SessionClosed => ErrorKind::Unexpected,
            _ => ErrorKind::Source,
        }
    }

    /// Returns the error code for logs and listeners
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::UnsupportedProtocol(_) => "UNSUPPORTED_PROTOCOL",
            Error::MalformedManifest(_) => "MALFORMED_MANIFEST",
            Error::TransientLoadFailure { .. } => "TRANSIENT_LOAD",
            Error::ExcludedRepresentation { .. } => "EXCLUDED_REPRESENTATION",
            Error::AllRepresentationsExcluded { .. } => "ALL_EXCLUDED",
            Error::SelectionUnavailable(_) => "SELECTION_UNAVAILABLE",
            Error::Fatal { .. } => "FATAL",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::Transport(_) => "TRANSPORT",
            Error::HttpStatus { .. } => "HTTP_STATUS",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::SessionClosed => "SESSION_CLOSED",
            Error::Cancelled(_) => "CANCELLED",
            Error::Io(_) => "IO",
            Error::Json(_) => "JSON",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
