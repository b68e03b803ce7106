//! SQLite-backed local store
//!
//! Owns the single connection used for the table catalog, row data and the
//! key value store. Every mutation goes through [`SqliteStore::transaction`]
//! so a failed write never leaves a partially updated row or tier behind.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};

use crate::config::Config;
use crate::kvs::KeyValueStoreManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::schema::{init_schema, needs_init};

/// Local store for tables, rows and table properties
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database at the configured location
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_at(&config.sqlite_path())
    }

    /// Open or create the database at an explicit path
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        if needs_init(&conn) {
            init_schema(&conn).context("Failed to initialize SQLite schema")?;
        }

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a transaction, committing only if it succeeds
    pub fn transaction<T, F>(&mut self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StorageResult<T>,
    {
        let tx = self.conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Key value store operations on this database
    pub fn kvs(&mut self) -> KeyValueStoreManager<'_> {
        KeyValueStoreManager::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("tablesync.db");

        let store = SqliteStore::open_at(&path).unwrap();
        assert!(path.exists());
        assert!(!needs_init(store.connection()));
    }

    #[test]
    fn test_open_under_a_file_reports_directory_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = SqliteStore::open_at(&blocker.join("tablesync.db")).err().unwrap();
        let storage = err.downcast_ref::<StorageError>().unwrap();
        assert!(matches!(
            storage,
            StorageError::CreateDirectory { path, .. } if path == &blocker
        ));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tablesync.db");

        {
            let store = SqliteStore::open_at(&path).unwrap();
            store
                .connection()
                .execute(
                    "INSERT INTO key_value_store_sync (table_id, key, value) VALUES ('t', 'k', 'v')",
                    [],
                )
                .unwrap();
        }

        let store = SqliteStore::open_at(&path).unwrap();
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM key_value_store_sync", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut store = SqliteStore::open_in_memory().unwrap();

        let result: StorageResult<()> = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO key_value_store_sync (table_id, key, value) VALUES ('t', 'k', 'v')",
                [],
            )?;
            Err(StorageError::TableNotFound {
                table_id: "t".to_string(),
            })
        });
        assert!(result.is_err());

        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM key_value_store_sync", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
