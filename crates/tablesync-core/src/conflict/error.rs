use thiserror::Error;

use crate::storage::StorageError;
use crate::sync::{ErrorKind, SyncError};

/// Errors raised while building or resolving a conflict table
#[derive(Error, Debug)]
pub enum ConflictError {
    #[error("Row '{row_id}' is not in conflict")]
    RowNotFound { row_id: String },

    #[error("Row '{row_id}' has no column '{element_key}'")]
    ColumnNotFound { row_id: String, element_key: String },

    /// The column's local and server values already agree
    #[error("Column '{element_key}' of row '{row_id}' is not in conflict")]
    ColumnNotInConflict { row_id: String, element_key: String },

    /// Not every conflicting column has a choice yet
    #[error("Row '{row_id}' still needs a choice for: {}", .missing.join(", "))]
    Incomplete { row_id: String, missing: Vec<String> },

    /// Local and server row sets do not line up
    #[error("Conflict rows are misaligned: {0}")]
    Misaligned(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConflictError {
    /// Whether the failure came from rejected credentials
    pub fn is_auth(&self) -> bool {
        matches!(self, ConflictError::Sync(e) if e.kind() == ErrorKind::Auth)
    }

    /// Whether the server row moved again while resolving
    pub fn is_stale(&self) -> bool {
        matches!(self, ConflictError::Sync(SyncError::TagMismatch { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_lists_missing_columns() {
        let err = ConflictError::Incomplete {
            row_id: "r1".into(),
            missing: vec!["name".into(), "yield".into()],
        };
        assert_eq!(err.to_string(), "Row 'r1' still needs a choice for: name, yield");
    }

    #[test]
    fn test_classification() {
        assert!(ConflictError::from(SyncError::Auth("expired".into())).is_auth());
        assert!(!ConflictError::from(SyncError::Network("down".into())).is_auth());
        let stale = ConflictError::from(SyncError::TagMismatch {
            row_id: "r1".into(),
            expected: None,
            current: None,
        });
        assert!(stale.is_stale());
    }
}
