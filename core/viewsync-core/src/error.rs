//! Error types for viewsync-core operations.

use std::path::PathBuf;
use std::time::Duration;

use viewsync_protocol::DecodeError;

// ═══════════════════════════════════════════════════════════════════════════════
// Library Error
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can surface from viewsync-core.
///
/// Most of the sync path never returns these: transport and decode failures
/// are logged and absorbed where they happen. What remains is what a caller
/// can act on (bad config, denied writes, a failing row source).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // Authorization Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Subject {subject_id} lacks permission {permission}")]
    AuthorizationDenied {
        subject_id: String,
        permission: String,
    },

    #[error("Unknown subject: {0}")]
    UnknownSubject(String),

    // ─────────────────────────────────────────────────────────────────────
    // View Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid view descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Row source failed: {context}: {details}")]
    RowSource { context: String, details: String },

    #[error("Row not found: {resource_type}/{id}")]
    RowNotFound { resource_type: String, id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Channel Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Malformed event: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Transport Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures reported by a [`crate::channel::Transport`].
///
/// The channel manager retries on every variant; none reach application code.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("channel write timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SyncError> for String {
    fn from(err: SyncError) -> String {
        err.to_string()
    }
}
