//! Error taxonomy shared by every storage backend.
//!
//! Failures are surfaced as abstract kinds regardless of which adapter
//! produced them, so the coordination layer can decide recovery without
//! knowing the backend: permission problems fall back to the local database,
//! transient network failures are retried inside the adapter, and the rest
//! propagate with enough context for the UI to offer a concrete action
//! (re-authenticate, pick a new file, abandon).

use uuid::Uuid;

use crate::adapter::PermissionMode;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend has not been configured (no file picked, no credentials).
    #[error("storage not configured: {0}")]
    NotConfigured(String),

    /// Access to the data file was not granted. Recovered by the manager via
    /// the local fallback, never propagated to entity callers.
    #[error("{mode} permission for the data file was not granted")]
    PermissionDenied { mode: PermissionMode },

    /// The backing file or document was deleted externally.
    #[error("the data file no longer exists")]
    NotFound,

    /// Credentials were rejected by the server (401/403).
    #[error("authentication failed, please sign in again")]
    AuthenticationFailed,

    /// No response from the server. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error status. Retryable for 5xx.
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    /// The stored document is not a valid dataset.
    #[error("stored data is not a valid dataset")]
    InvalidFormat,

    /// The server is out of space (HTTP 507).
    #[error("not enough storage space on the server")]
    StorageExhausted,

    /// An entity operation referenced an id that does not exist.
    #[error("{kind} {id} not found")]
    EntityNotFound { kind: &'static str, id: Uuid },

    /// An entity cannot be deleted while others still reference it.
    #[error("{kind} {id} is still in use")]
    InUse { kind: &'static str, id: Uuid },

    /// Reading or writing the credential store failed.
    #[error("credential store error: {0}")]
    Credential(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("local database error: {0}")]
    Db(#[from] sled::Error),
}

impl StorageError {
    /// Whether a retry with backoff may succeed: network failures and
    /// server-side 5xx conditions.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Network(_) => true,
            StorageError::Server { status } => *status >= 500,
            _ => false,
        }
    }

    pub fn entity_not_found(kind: &'static str, id: Uuid) -> Self {
        StorageError::EntityNotFound { kind, id }
    }
}

/// Map an HTTP status to the matching error kind.
pub(crate) fn error_for_status(status: u16) -> StorageError {
    match status {
        401 | 403 => StorageError::AuthenticationFailed,
        404 => StorageError::NotFound,
        507 => StorageError::StorageExhausted,
        _ => StorageError::Server { status },
    }
}
