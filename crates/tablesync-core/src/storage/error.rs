//! Storage error handling
//!
//! Provides typed errors for RowStore and KeyValueStore operations with
//! descriptive messages and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::sync::TransitionError;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Table is not registered locally
    #[error("Table '{table_id}' does not exist")]
    TableNotFound { table_id: String },

    /// Table id already taken
    #[error("Table '{table_id}' already exists")]
    TableExists { table_id: String },

    /// Row is not present in the table
    #[error("Row '{row_id}' not found in table '{table_id}'")]
    RowNotFound { table_id: String, row_id: String },

    /// Value written to a column the table does not define
    #[error("Table '{table_id}' has no column '{element_key}'")]
    UnknownColumn {
        table_id: String,
        element_key: String,
    },

    /// Write not allowed in the row's current sync state
    #[error("Row '{row_id}': {source}")]
    InvalidTransition {
        row_id: String,
        #[source]
        source: TransitionError,
    },

    /// Stored data could not be interpreted
    #[error("Corrupt record in '{table}': {details}")]
    Corrupt { table: String, details: String },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Row values could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Classify a failure to create a data directory
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// Check if this error is recoverable by the user
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::InvalidTransition { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions. You may need to run with different permissions or change ownership.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::InvalidTransition { .. } => {
                Some("Resolve the row's conflict or wait for its pending change to sync first.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{RowEvent, SyncState};

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StorageError::DiskFull { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_io_error_is_directory_failure() {
        let io_err = io::Error::new(io::ErrorKind::AlreadyExists, "file exists");
        let err = StorageError::from_io(io_err, PathBuf::from("/data/tablesync"));

        assert!(matches!(err, StorageError::CreateDirectory { .. }));
        assert!(err.to_string().contains("/data/tablesync"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = StorageError::InvalidTransition {
            row_id: "r1".to_string(),
            source: TransitionError {
                state: SyncState::Conflicting,
                event: RowEvent::LocalEdit,
            },
        };

        let msg = err.to_string();
        assert!(msg.contains("r1"));
        assert!(msg.contains("conflicting"));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_not_found_display() {
        let err = StorageError::RowNotFound {
            table_id: "crops".to_string(),
            row_id: "r9".to_string(),
        };
        assert!(err.to_string().contains("crops"));
        assert!(!err.is_recoverable());
    }
}
