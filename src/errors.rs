//! Error types for the sync engine.

use thiserror::Error;

use crate::remote::RemoteErrorCode;

/// Main error type for sync operations.
///
/// Per-task failures (a single download or deletion going wrong) are handled
/// inside the scheduler and never surface as this type; everything here is
/// either a whole-run failure or an error the caller chose not to tolerate.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Credentials(String),

    #[error("The hash manifest could not be fetched: {0}")]
    ManifestUnavailable(String),

    #[error("Invalid manifest payload: {0}")]
    InvalidManifest(String),

    #[error("Remote error ({status} {code}): {message}")]
    Remote {
        code: RemoteErrorCode,
        status: u16,
        message: String,
    },

    #[error("Interrupted")]
    Interrupted,
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
