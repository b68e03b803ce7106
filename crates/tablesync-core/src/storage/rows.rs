//! Row storage
//!
//! [`RowStore`] is the seam between the sync engine and local persistence.
//! Every write that changes a row's sync state runs through
//! [`SyncState::apply`], so the store cannot be driven into a state the
//! state machine does not allow.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::models::{Row, RowDelta, RowValues, SyncTag, TableDefinition};
use crate::storage::catalog;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::sqlite::SqliteStore;
use crate::sync::{RowEvent, RowFate, SyncState};

const LOCAL: &str = "local";
const SERVER: &str = "server";

/// Local row persistence used by the sync processor and conflict resolver
pub trait RowStore {
    fn table_definition(&self, table_id: &str) -> StorageResult<Option<TableDefinition>>;

    /// Record the newest table-level tag seen from the server
    fn set_table_sync_tag(&mut self, table_id: &str, tag: &SyncTag) -> StorageResult<()>;

    fn mark_table_synced(&mut self, table_id: &str, at: DateTime<Utc>) -> StorageResult<()>;

    /// Local variant of a row
    fn get_row(&self, table_id: &str, row_id: &str) -> StorageResult<Option<Row>>;

    /// All local rows of a table, ordered by row id
    fn rows(&self, table_id: &str) -> StorageResult<Vec<Row>>;

    fn rows_in_state(&self, table_id: &str, state: SyncState) -> StorageResult<Vec<Row>>;

    /// Rows with a local change waiting to be pushed, ordered by row id
    fn pending_rows(&self, table_id: &str) -> StorageResult<Vec<Row>> {
        let mut pending = Vec::new();
        for state in [
            SyncState::Inserting,
            SyncState::Updating,
            SyncState::Deleting,
        ] {
            pending.extend(self.rows_in_state(table_id, state)?);
        }
        pending.sort_by(|a, b| a.row_id.cmp(&b.row_id));
        Ok(pending)
    }

    /// Server variant stored alongside a conflicting row
    fn server_variant(&self, table_id: &str, row_id: &str) -> StorageResult<Option<RowDelta>>;

    /// Create a row in `inserting` state
    fn insert_row(&mut self, table_id: &str, values: RowValues) -> StorageResult<Row>;

    /// Apply a local edit; the given values overlay the current ones
    fn update_row(&mut self, table_id: &str, row_id: &str, values: &RowValues) -> StorageResult<Row>;

    /// Apply a local delete
    fn mark_deleted(&mut self, table_id: &str, row_id: &str) -> StorageResult<RowFate>;

    /// Store a row pulled from the server at rest, or remove it if the server
    /// deleted it
    fn store_pulled_row(&mut self, table_id: &str, delta: &RowDelta) -> StorageResult<()>;

    /// The server accepted a pushed change and issued `sync_tag`
    fn acknowledge_push(&mut self, table_id: &str, row_id: &str, sync_tag: &SyncTag) -> StorageResult<RowFate>;

    /// The server rejected a pushed change; keep both variants
    ///
    /// For a row already in conflict only the server variant is refreshed.
    fn mark_conflicting(&mut self, table_id: &str, row_id: &str, server: &RowDelta) -> StorageResult<()>;

    /// Finish a resolution the server already accepted
    ///
    /// Sets the local values, moves the row to rest with `sync_tag` and drops
    /// the server variant, all at once.
    fn resolve_conflict(
        &mut self,
        table_id: &str,
        row_id: &str,
        sync_tag: &SyncTag,
        values: &RowValues,
    ) -> StorageResult<()>;

    /// Physically remove a row and any server variant
    fn delete_row_actual(&mut self, table_id: &str, row_id: &str) -> StorageResult<()>;
}

struct RawRow {
    row_id: String,
    values: String,
    sync_state: String,
    sync_tag: Option<String>,
    deleted: bool,
}

impl RawRow {
    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            row_id: row.get(0)?,
            values: row.get(1)?,
            sync_state: row.get(2)?,
            sync_tag: row.get(3)?,
            deleted: row.get(4)?,
        })
    }

    fn into_row(self) -> StorageResult<Row> {
        let sync_state = self
            .sync_state
            .parse()
            .map_err(|details| StorageError::Corrupt {
                table: "rows".to_string(),
                details,
            })?;
        Ok(Row {
            row_id: self.row_id,
            values: serde_json::from_str(&self.values)?,
            sync_state,
            sync_tag: self.sync_tag.map(SyncTag::new),
            deleted: self.deleted,
        })
    }

    fn into_delta(self) -> StorageResult<RowDelta> {
        Ok(RowDelta {
            row_id: self.row_id,
            values: serde_json::from_str(&self.values)?,
            sync_tag: self.sync_tag.map(SyncTag::new),
            deleted: self.deleted,
        })
    }
}

fn read_variant(
    conn: &Connection,
    table_id: &str,
    row_id: &str,
    variant: &str,
) -> StorageResult<Option<RawRow>> {
    Ok(conn
        .query_row(
            "SELECT row_id, row_values, sync_state, sync_tag, deleted FROM rows
             WHERE table_id = ? AND row_id = ? AND variant = ?",
            params![table_id, row_id, variant],
            RawRow::from_sql,
        )
        .optional()?)
}

fn read_local(conn: &Connection, table_id: &str, row_id: &str) -> StorageResult<Option<Row>> {
    read_variant(conn, table_id, row_id, LOCAL)?
        .map(RawRow::into_row)
        .transpose()
}

fn require_local(conn: &Connection, table_id: &str, row_id: &str) -> StorageResult<Row> {
    read_local(conn, table_id, row_id)?.ok_or_else(|| StorageError::RowNotFound {
        table_id: table_id.to_string(),
        row_id: row_id.to_string(),
    })
}

fn write_local(conn: &Connection, table_id: &str, row: &Row) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO rows
         (table_id, row_id, variant, row_values, sync_state, sync_tag, deleted, saved_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            table_id,
            row.row_id,
            LOCAL,
            serde_json::to_string(&row.values)?,
            row.sync_state.as_str(),
            row.sync_tag.as_ref().map(SyncTag::as_str),
            row.deleted,
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn write_server(conn: &Connection, table_id: &str, delta: &RowDelta) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO rows
         (table_id, row_id, variant, row_values, sync_state, sync_tag, deleted, saved_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            table_id,
            delta.row_id,
            SERVER,
            serde_json::to_string(&delta.values)?,
            SyncState::Conflicting.as_str(),
            delta.sync_tag.as_ref().map(SyncTag::as_str),
            delta.deleted,
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn remove_server(conn: &Connection, table_id: &str, row_id: &str) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM rows WHERE table_id = ? AND row_id = ? AND variant = ?",
        params![table_id, row_id, SERVER],
    )?;
    Ok(())
}

fn remove_all(conn: &Connection, table_id: &str, row_id: &str) -> StorageResult<usize> {
    Ok(conn.execute(
        "DELETE FROM rows WHERE table_id = ? AND row_id = ?",
        params![table_id, row_id],
    )?)
}

fn transition(row: &Row, event: RowEvent) -> StorageResult<RowFate> {
    row.sync_state
        .apply(event)
        .map_err(|source| StorageError::InvalidTransition {
            row_id: row.row_id.clone(),
            source,
        })
}

fn check_columns(table: &TableDefinition, values: &RowValues) -> StorageResult<()> {
    match values.keys().find(|key| table.column(key).is_none()) {
        Some(unknown) => Err(StorageError::UnknownColumn {
            table_id: table.table_id.clone(),
            element_key: unknown.clone(),
        }),
        None => Ok(()),
    }
}

impl RowStore for SqliteStore {
    fn table_definition(&self, table_id: &str) -> StorageResult<Option<TableDefinition>> {
        catalog::load_table(self.connection(), table_id)
    }

    fn set_table_sync_tag(&mut self, table_id: &str, tag: &SyncTag) -> StorageResult<()> {
        self.transaction(|tx| catalog::write_sync_tag(tx, table_id, tag))
    }

    fn mark_table_synced(&mut self, table_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.transaction(|tx| catalog::write_last_sync_time(tx, table_id, at))
    }

    fn get_row(&self, table_id: &str, row_id: &str) -> StorageResult<Option<Row>> {
        read_local(self.connection(), table_id, row_id)
    }

    fn rows(&self, table_id: &str) -> StorageResult<Vec<Row>> {
        let mut stmt = self.connection().prepare(
            "SELECT row_id, row_values, sync_state, sync_tag, deleted FROM rows
             WHERE table_id = ? AND variant = ? ORDER BY row_id",
        )?;
        let raw = stmt
            .query_map(params![table_id, LOCAL], RawRow::from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::into_row).collect()
    }

    fn rows_in_state(&self, table_id: &str, state: SyncState) -> StorageResult<Vec<Row>> {
        let mut stmt = self.connection().prepare(
            "SELECT row_id, row_values, sync_state, sync_tag, deleted FROM rows
             WHERE table_id = ? AND variant = ? AND sync_state = ? ORDER BY row_id",
        )?;
        let raw = stmt
            .query_map(params![table_id, LOCAL, state.as_str()], RawRow::from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::into_row).collect()
    }

    fn server_variant(&self, table_id: &str, row_id: &str) -> StorageResult<Option<RowDelta>> {
        read_variant(self.connection(), table_id, row_id, SERVER)?
            .map(RawRow::into_delta)
            .transpose()
    }

    fn insert_row(&mut self, table_id: &str, values: RowValues) -> StorageResult<Row> {
        let row = self.transaction(|tx| {
            let table = catalog::require_table(tx, table_id)?;
            check_columns(&table, &values)?;
            let row = Row::new(values);
            write_local(tx, table_id, &row)?;
            Ok(row)
        })?;
        debug!(table_id, row_id = %row.row_id, "inserted row");
        Ok(row)
    }

    fn update_row(&mut self, table_id: &str, row_id: &str, values: &RowValues) -> StorageResult<Row> {
        let row = self.transaction(|tx| {
            let table = catalog::require_table(tx, table_id)?;
            check_columns(&table, values)?;

            let mut row = require_local(tx, table_id, row_id)?;
            if let RowFate::Keep(state) = transition(&row, RowEvent::LocalEdit)? {
                row.sync_state = state;
            }
            for (key, value) in values {
                row.values.insert(key.clone(), value.clone());
            }
            write_local(tx, table_id, &row)?;
            Ok(row)
        })?;
        debug!(table_id, row_id, state = %row.sync_state, "updated row");
        Ok(row)
    }

    fn mark_deleted(&mut self, table_id: &str, row_id: &str) -> StorageResult<RowFate> {
        let fate = self.transaction(|tx| {
            let mut row = require_local(tx, table_id, row_id)?;
            let fate = transition(&row, RowEvent::LocalDelete)?;
            match fate {
                RowFate::Keep(state) => {
                    row.sync_state = state;
                    row.deleted = true;
                    write_local(tx, table_id, &row)?;
                }
                RowFate::Remove => {
                    remove_all(tx, table_id, row_id)?;
                }
            }
            Ok(fate)
        })?;
        debug!(table_id, row_id, ?fate, "deleted row locally");
        Ok(fate)
    }

    fn store_pulled_row(&mut self, table_id: &str, delta: &RowDelta) -> StorageResult<()> {
        self.transaction(|tx| {
            if delta.deleted {
                remove_all(tx, table_id, &delta.row_id)?;
            } else {
                write_local(tx, table_id, &Row::from_delta(delta))?;
            }
            Ok(())
        })
    }

    fn acknowledge_push(&mut self, table_id: &str, row_id: &str, sync_tag: &SyncTag) -> StorageResult<RowFate> {
        self.transaction(|tx| {
            let mut row = require_local(tx, table_id, row_id)?;
            let fate = transition(&row, RowEvent::PushAccepted)?;
            match fate {
                RowFate::Keep(state) => {
                    row.sync_state = state;
                    row.sync_tag = Some(sync_tag.clone());
                    row.deleted = false;
                    write_local(tx, table_id, &row)?;
                }
                RowFate::Remove => {
                    remove_all(tx, table_id, row_id)?;
                }
            }
            Ok(fate)
        })
    }

    fn mark_conflicting(&mut self, table_id: &str, row_id: &str, server: &RowDelta) -> StorageResult<()> {
        self.transaction(|tx| {
            let mut row = require_local(tx, table_id, row_id)?;
            if row.sync_state != SyncState::Conflicting {
                if let RowFate::Keep(state) = transition(&row, RowEvent::PushRejected)? {
                    row.sync_state = state;
                }
                write_local(tx, table_id, &row)?;
            }
            write_server(tx, table_id, server)
        })?;
        debug!(table_id, row_id, "row marked conflicting");
        Ok(())
    }

    fn resolve_conflict(
        &mut self,
        table_id: &str,
        row_id: &str,
        sync_tag: &SyncTag,
        values: &RowValues,
    ) -> StorageResult<()> {
        self.transaction(|tx| {
            let table = catalog::require_table(tx, table_id)?;
            check_columns(&table, values)?;

            let mut row = require_local(tx, table_id, row_id)?;
            if let RowFate::Keep(state) = transition(&row, RowEvent::Resolved)? {
                row.sync_state = state;
            }
            row.values = values.clone();
            row.sync_tag = Some(sync_tag.clone());
            row.deleted = false;
            write_local(tx, table_id, &row)?;
            remove_server(tx, table_id, row_id)
        })?;
        debug!(table_id, row_id, %sync_tag, "conflict resolved");
        Ok(())
    }

    fn delete_row_actual(&mut self, table_id: &str, row_id: &str) -> StorageResult<()> {
        self.transaction(|tx| remove_all(tx, table_id, row_id).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;

    fn store() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let table = TableDefinition::new("crops", "Crops")
            .with_column("name", ColumnType::String)
            .with_column("yield", ColumnType::Number);
        store.register_table(&table).unwrap();
        store
    }

    fn values(pairs: &[(&str, &str)]) -> RowValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn delta(row_id: &str, tag: &str, name: &str) -> RowDelta {
        RowDelta {
            row_id: row_id.to_string(),
            values: values(&[("name", name)]),
            sync_tag: Some(SyncTag::from(tag)),
            deleted: false,
        }
    }

    #[test]
    fn test_insert_and_read() {
        let mut store = store();
        let row = store
            .insert_row("crops", values(&[("name", "Maize")]))
            .unwrap();

        let loaded = store.get_row("crops", &row.row_id).unwrap().unwrap();
        assert_eq!(loaded.value("name"), "Maize");
        assert_eq!(loaded.sync_state, SyncState::Inserting);
        assert_eq!(store.pending_rows("crops").unwrap().len(), 1);
    }

    #[test]
    fn test_insert_unknown_column_rejected() {
        let mut store = store();
        let err = store
            .insert_row("crops", values(&[("colour", "red")]))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownColumn { .. }));

        let err = store.insert_row("missing", RowValues::new()).unwrap_err();
        assert!(matches!(err, StorageError::TableNotFound { .. }));
    }

    #[test]
    fn test_edit_row_at_rest() {
        let mut store = store();
        store.store_pulled_row("crops", &delta("r1", "v1", "Maize")).unwrap();

        let row = store
            .update_row("crops", "r1", &values(&[("yield", "4.2")]))
            .unwrap();
        assert_eq!(row.sync_state, SyncState::Updating);
        assert_eq!(row.value("name"), "Maize");
        assert_eq!(row.value("yield"), "4.2");
        assert_eq!(row.sync_tag, Some(SyncTag::from("v1")));
    }

    #[test]
    fn test_delete_inserting_row_removes_it() {
        let mut store = store();
        let row = store.insert_row("crops", values(&[("name", "x")])).unwrap();

        let fate = store.mark_deleted("crops", &row.row_id).unwrap();
        assert_eq!(fate, RowFate::Remove);
        assert!(store.get_row("crops", &row.row_id).unwrap().is_none());
    }

    #[test]
    fn test_delete_rest_row_waits_for_push() {
        let mut store = store();
        store.store_pulled_row("crops", &delta("r1", "v1", "Maize")).unwrap();

        store.mark_deleted("crops", "r1").unwrap();
        let row = store.get_row("crops", "r1").unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Deleting);
        assert!(row.deleted);

        let fate = store
            .acknowledge_push("crops", "r1", &SyncTag::from("v2"))
            .unwrap();
        assert_eq!(fate, RowFate::Remove);
        assert!(store.rows("crops").unwrap().is_empty());
    }

    #[test]
    fn test_acknowledge_push_sets_tag() {
        let mut store = store();
        let row = store.insert_row("crops", values(&[("name", "x")])).unwrap();

        store
            .acknowledge_push("crops", &row.row_id, &SyncTag::from("v3"))
            .unwrap();
        let row = store.get_row("crops", &row.row_id).unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Rest);
        assert_eq!(row.sync_tag, Some(SyncTag::from("v3")));
    }

    #[test]
    fn test_conflict_keeps_both_variants_until_resolved() {
        let mut store = store();
        store.store_pulled_row("crops", &delta("r1", "v1", "Maize")).unwrap();
        store
            .update_row("crops", "r1", &values(&[("name", "Corn")]))
            .unwrap();

        store
            .mark_conflicting("crops", "r1", &delta("r1", "v2", "Maize (hybrid)"))
            .unwrap();
        let local = store.get_row("crops", "r1").unwrap().unwrap();
        assert_eq!(local.sync_state, SyncState::Conflicting);
        assert_eq!(local.value("name"), "Corn");
        let server = store.server_variant("crops", "r1").unwrap().unwrap();
        assert_eq!(server.value("name"), "Maize (hybrid)");

        // Local writes are rejected while in conflict
        let err = store
            .update_row("crops", "r1", &values(&[("name", "x")]))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
        assert!(store.mark_deleted("crops", "r1").is_err());

        // A second rejection only refreshes the server variant
        store
            .mark_conflicting("crops", "r1", &delta("r1", "v3", "Maize (v3)"))
            .unwrap();
        let server = store.server_variant("crops", "r1").unwrap().unwrap();
        assert_eq!(server.sync_tag, Some(SyncTag::from("v3")));

        store
            .resolve_conflict("crops", "r1", &SyncTag::from("v4"), &values(&[("name", "Corn")]))
            .unwrap();
        let row = store.get_row("crops", "r1").unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Rest);
        assert_eq!(row.sync_tag, Some(SyncTag::from("v4")));
        assert!(store.server_variant("crops", "r1").unwrap().is_none());
    }

    #[test]
    fn test_resolve_requires_conflict() {
        let mut store = store();
        store.store_pulled_row("crops", &delta("r1", "v1", "Maize")).unwrap();

        let err = store
            .resolve_conflict("crops", "r1", &SyncTag::from("v2"), &RowValues::new())
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pulled_delete_removes_row() {
        let mut store = store();
        store.store_pulled_row("crops", &delta("r1", "v1", "Maize")).unwrap();

        let mut gone = delta("r1", "v2", "");
        gone.deleted = true;
        store.store_pulled_row("crops", &gone).unwrap();
        assert!(store.get_row("crops", "r1").unwrap().is_none());
    }

    #[test]
    fn test_rows_dropped_with_table() {
        let mut store = store();
        store.store_pulled_row("crops", &delta("r1", "v1", "Maize")).unwrap();
        store.drop_table("crops").unwrap();

        assert!(store.rows("crops").unwrap().is_empty());
    }
}
