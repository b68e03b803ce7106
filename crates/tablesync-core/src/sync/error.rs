//! Sync error handling
//!
//! Every failure a [`Synchronizer`](super::Synchronizer) or the local store can
//! raise during a sync run maps to one [`ErrorKind`]. Only
//! [`ErrorKind::Auth`] aborts a run; everything else is folded into the
//! affected table's result.

use thiserror::Error;

use crate::models::SyncTag;
use crate::storage::StorageError;

/// Errors raised while talking to the server or applying its answers
#[derive(Error, Debug)]
pub enum SyncError {
    /// Credentials missing, expired or rejected
    #[error("Authentication required: {0}")]
    Auth(String),

    /// Server unreachable or transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// The row changed on the server since `expected`
    #[error("Row '{row_id}' changed on the server (expected {}, server has {})",
        .expected.as_ref().map(SyncTag::as_str).unwrap_or("none"),
        .current.as_ref().map(SyncTag::as_str).unwrap_or("none"))]
    TagMismatch {
        row_id: String,
        expected: Option<SyncTag>,
        current: Option<SyncTag>,
    },

    /// Local and remote table definitions disagree
    #[error("Schema mismatch for table '{table_id}': {details}")]
    Schema { table_id: String, details: String },

    /// Table is unknown to the server
    #[error("Table '{0}' does not exist on the server")]
    TableNotFound(String),

    /// Local persistence failed
    #[error(transparent)]
    LocalStorage(#[from] StorageError),
}

/// Coarse classification used for per-table results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Network,
    Conflict,
    Schema,
    LocalStorage,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::TagMismatch { .. } => ErrorKind::Conflict,
            SyncError::Schema { .. } | SyncError::TableNotFound(_) => ErrorKind::Schema,
            SyncError::LocalStorage(_) => ErrorKind::LocalStorage,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::LocalStorage(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
