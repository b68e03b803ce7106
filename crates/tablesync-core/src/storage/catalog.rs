//! Table catalog: table and column definitions
//!
//! A table's `isSetToSync` flag lives in the sync store; it is folded into
//! [`TableDefinition::set_to_sync`] when a definition is loaded.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::kvs::{self, KeyValueStoreType, SYNC_KEY_IS_SET_TO_SYNC};
use crate::models::{ColumnDefinition, SyncTag, TableDefinition};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::kvs as kvs_db;
use crate::storage::sqlite::SqliteStore;

struct TableRow {
    table_id: String,
    display_name: String,
    sync_tag: Option<String>,
    last_sync_time: Option<i64>,
}

/// Load a single table definition with its columns
pub fn load_table(conn: &Connection, table_id: &str) -> StorageResult<Option<TableDefinition>> {
    let row = conn
        .query_row(
            "SELECT table_id, display_name, sync_tag, last_sync_time
             FROM table_definitions WHERE table_id = ?",
            params![table_id],
            |row| {
                Ok(TableRow {
                    table_id: row.get(0)?,
                    display_name: row.get(1)?,
                    sync_tag: row.get(2)?,
                    last_sync_time: row.get(3)?,
                })
            },
        )
        .optional()?;

    match row {
        Some(row) => Ok(Some(hydrate(conn, row)?)),
        None => Ok(None),
    }
}

/// Load a table definition or fail with `TableNotFound`
pub fn require_table(conn: &Connection, table_id: &str) -> StorageResult<TableDefinition> {
    load_table(conn, table_id)?.ok_or_else(|| StorageError::TableNotFound {
        table_id: table_id.to_string(),
    })
}

/// All table definitions, ordered by id
pub fn load_tables(conn: &Connection) -> StorageResult<Vec<TableDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT table_id, display_name, sync_tag, last_sync_time
         FROM table_definitions ORDER BY table_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TableRow {
                table_id: row.get(0)?,
                display_name: row.get(1)?,
                sync_tag: row.get(2)?,
                last_sync_time: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(|row| hydrate(conn, row)).collect()
}

fn hydrate(conn: &Connection, row: TableRow) -> StorageResult<TableDefinition> {
    let columns = load_columns(conn, &row.table_id)?;
    let set_to_sync =
        kvs_db::sync_flag(conn, &row.table_id, SYNC_KEY_IS_SET_TO_SYNC)?.as_deref() == Some("1");

    Ok(TableDefinition {
        table_id: row.table_id,
        display_name: row.display_name,
        columns,
        sync_tag: row.sync_tag.map(SyncTag::new),
        set_to_sync,
        last_sync_time: row.last_sync_time.and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

fn load_columns(conn: &Connection, table_id: &str) -> StorageResult<Vec<ColumnDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT element_key, display_name, column_type FROM column_definitions
         WHERE table_id = ? ORDER BY position",
    )?;
    let raw = stmt
        .query_map(params![table_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(element_key, display_name, column_type)| {
            let column_type = column_type.parse().map_err(|details| StorageError::Corrupt {
                table: "column_definitions".to_string(),
                details,
            })?;
            Ok(ColumnDefinition {
                element_key,
                display_name,
                column_type,
            })
        })
        .collect()
}

/// Current table-level sync tag
pub fn sync_tag(conn: &Connection, table_id: &str) -> StorageResult<Option<SyncTag>> {
    let tag: Option<Option<String>> = conn
        .query_row(
            "SELECT sync_tag FROM table_definitions WHERE table_id = ?",
            params![table_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(tag.flatten().map(SyncTag::new))
}

pub fn write_sync_tag(conn: &Connection, table_id: &str, tag: &SyncTag) -> StorageResult<()> {
    let updated = conn.execute(
        "UPDATE table_definitions SET sync_tag = ? WHERE table_id = ?",
        params![tag.as_str(), table_id],
    )?;
    if updated == 0 {
        return Err(StorageError::TableNotFound {
            table_id: table_id.to_string(),
        });
    }
    Ok(())
}

pub fn write_last_sync_time(conn: &Connection, table_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
    let updated = conn.execute(
        "UPDATE table_definitions SET last_sync_time = ? WHERE table_id = ?",
        params![at.timestamp_millis(), table_id],
    )?;
    if updated == 0 {
        return Err(StorageError::TableNotFound {
            table_id: table_id.to_string(),
        });
    }
    Ok(())
}

fn insert_table(conn: &Connection, table: &TableDefinition) -> StorageResult<()> {
    if load_table(conn, &table.table_id)?.is_some() {
        return Err(StorageError::TableExists {
            table_id: table.table_id.clone(),
        });
    }

    conn.execute(
        "INSERT INTO table_definitions (table_id, display_name, sync_tag, last_sync_time)
         VALUES (?, ?, ?, ?)",
        params![
            table.table_id,
            table.display_name,
            table.sync_tag.as_ref().map(SyncTag::as_str),
            table.last_sync_time.map(|t| t.timestamp_millis()),
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO column_definitions (table_id, element_key, display_name, column_type, position)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for (position, column) in table.columns.iter().enumerate() {
        stmt.execute(params![
            table.table_id,
            column.element_key,
            column.display_name,
            column.column_type.as_str(),
            position as i64,
        ])?;
    }
    Ok(())
}

impl SqliteStore {
    /// Register a new local table
    ///
    /// Writes the table's initial properties to the ACTIVE tier and records
    /// its `isSetToSync` flag.
    pub fn register_table(&mut self, table: &TableDefinition) -> StorageResult<()> {
        self.transaction(|tx| {
            insert_table(tx, table)?;
            kvs_db::add_entries(tx, KeyValueStoreType::Active, &kvs::initial_entries(table))?;
            kvs_db::set_sync_flag(
                tx,
                &table.table_id,
                SYNC_KEY_IS_SET_TO_SYNC,
                if table.set_to_sync { "1" } else { "0" },
            )
        })?;
        info!(table_id = %table.table_id, columns = table.columns.len(), "registered table");
        Ok(())
    }

    /// Remove a table, its rows and all of its properties
    ///
    /// Returns whether the table existed.
    pub fn drop_table(&mut self, table_id: &str) -> StorageResult<bool> {
        let existed = self.transaction(|tx| {
            kvs_db::clear_table(tx, table_id)?;
            let removed = tx.execute(
                "DELETE FROM table_definitions WHERE table_id = ?",
                params![table_id],
            )?;
            Ok(removed > 0)
        })?;
        if existed {
            info!(table_id, "dropped table");
        }
        Ok(existed)
    }

    pub fn table(&self, table_id: &str) -> StorageResult<Option<TableDefinition>> {
        load_table(self.connection(), table_id)
    }

    pub fn tables(&self) -> StorageResult<Vec<TableDefinition>> {
        load_tables(self.connection())
    }

    /// Include or exclude a table from sync runs
    pub fn set_table_sync(&mut self, table_id: &str, enabled: bool) -> StorageResult<()> {
        self.transaction(|tx| {
            require_table(tx, table_id)?;
            kvs_db::set_sync_flag(
                tx,
                table_id,
                SYNC_KEY_IS_SET_TO_SYNC,
                if enabled { "1" } else { "0" },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;

    fn crops() -> TableDefinition {
        TableDefinition::new("crops", "Crops")
            .with_column("name", ColumnType::String)
            .with_column("planted", ColumnType::Date)
    }

    #[test]
    fn test_register_and_load() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&crops()).unwrap();

        let loaded = store.table("crops").unwrap().unwrap();
        assert_eq!(loaded.display_name, "Crops");
        assert_eq!(loaded.element_keys(), vec!["name", "planted"]);
        assert_eq!(loaded.columns[1].column_type, ColumnType::Date);
        assert!(!loaded.set_to_sync);
        assert!(loaded.sync_tag.is_none());
        assert!(loaded.last_sync_time.is_none());
    }

    #[test]
    fn test_register_twice_fails() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&crops()).unwrap();

        let err = store.register_table(&crops()).unwrap_err();
        assert!(matches!(err, StorageError::TableExists { .. }));
    }

    #[test]
    fn test_set_table_sync() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&crops()).unwrap();

        store.set_table_sync("crops", true).unwrap();
        assert!(store.table("crops").unwrap().unwrap().set_to_sync);

        let err = store.set_table_sync("missing", true).unwrap_err();
        assert!(matches!(err, StorageError::TableNotFound { .. }));
    }

    #[test]
    fn test_sync_bookkeeping() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&crops()).unwrap();

        let now = Utc::now();
        store
            .transaction(|tx| {
                write_sync_tag(tx, "crops", &SyncTag::from("v7"))?;
                write_last_sync_time(tx, "crops", now)
            })
            .unwrap();

        let loaded = store.table("crops").unwrap().unwrap();
        assert_eq!(loaded.sync_tag, Some(SyncTag::from("v7")));
        assert_eq!(
            loaded.last_sync_time.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
        assert_eq!(
            sync_tag(store.connection(), "crops").unwrap(),
            Some(SyncTag::from("v7"))
        );
        assert!(sync_tag(store.connection(), "missing").unwrap().is_none());
    }

    #[test]
    fn test_drop_table_removes_everything() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&crops()).unwrap();

        assert!(store.drop_table("crops").unwrap());
        assert!(store.table("crops").unwrap().is_none());
        assert!(kvs_db::entries(store.connection(), KeyValueStoreType::Active, "crops")
            .unwrap()
            .is_empty());
        assert!(!store.drop_table("crops").unwrap());
    }

    #[test]
    fn test_tables_sorted() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&TableDefinition::new("wells", "Wells")).unwrap();
        store.register_table(&crops()).unwrap();

        let ids: Vec<String> = store.tables().unwrap().into_iter().map(|t| t.table_id).collect();
        assert_eq!(ids, vec!["crops", "wells"]);
    }
}
