//! Committing conflict resolutions
//!
//! A resolution is pushed to the server first, based on the server variant's
//! tag. Only once the server accepts it is the local row moved back to rest,
//! so a failed push leaves the row conflicting with nothing half applied.

use tracing::{error, info, warn};

use crate::conflict::error::ConflictError;
use crate::conflict::table::ConflictTable;
use crate::models::{RowDelta, RowValues, SyncTag};
use crate::storage::{RowStore, StorageError};
use crate::sync::{SyncError, Synchronizer};

/// How a conflicting row should end up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the row with these values
    Values(RowValues),
    /// Delete the row everywhere
    Delete,
}

/// Pushes resolutions and applies them locally
pub struct ConflictResolver<'a, S: Synchronizer, R: RowStore> {
    synchronizer: &'a mut S,
    rows: &'a mut R,
}

impl<'a, S: Synchronizer, R: RowStore> ConflictResolver<'a, S, R> {
    pub fn new(synchronizer: &'a mut S, rows: &'a mut R) -> Self {
        Self { synchronizer, rows }
    }

    /// Commit `resolved_values` for a conflicting row
    ///
    /// Every conflicting column must be present in `resolved_values`; the
    /// given values overlay the row's concordant ones. The full row is pushed
    /// with `server_sync_tag` as the base tag. On success the row is at rest
    /// with the returned tag and leaves `conflicts`.
    pub fn resolve_conflict(
        &mut self,
        conflicts: &mut ConflictTable,
        row_id: &str,
        server_sync_tag: Option<&SyncTag>,
        resolved_values: &RowValues,
    ) -> Result<SyncTag, ConflictError> {
        let row = conflicts.row(row_id).ok_or_else(|| ConflictError::RowNotFound {
            row_id: row_id.to_string(),
        })?;

        let missing: Vec<String> = row
            .conflicting_columns()
            .filter(|c| !resolved_values.contains_key(&c.element_key))
            .map(|c| c.element_key.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ConflictError::Incomplete {
                row_id: row_id.to_string(),
                missing,
            });
        }

        // Columns the caller left out keep their concordant or chosen value
        let mut values: RowValues = row
            .columns
            .iter()
            .filter_map(|c| {
                c.resolved_value()
                    .map(|value| (c.element_key.clone(), value.to_string()))
            })
            .collect();
        values.extend(resolved_values.iter().map(|(k, v)| (k.clone(), v.clone())));

        let table_id = conflicts.table_id.clone();
        let pushed = self
            .synchronizer
            .push_row(&table_id, row_id, server_sync_tag, &values);

        match pushed {
            Ok(tag) => {
                if let Err(e) = self.rows.resolve_conflict(&table_id, row_id, &tag, &values) {
                    error!(
                        table_id = %table_id,
                        row_id,
                        %tag,
                        error = %e,
                        "server accepted resolution but local row could not be updated"
                    );
                    self.repair_after_local_failure(conflicts, row_id, tag);
                    return Err(e.into());
                }
                conflicts.remove(row_id);
                info!(table_id = %table_id, row_id, %tag, "conflict resolved");
                Ok(tag)
            }
            Err(e) => Err(self.push_failed(conflicts, row_id, e)),
        }
    }

    /// Pair the row with the server copy our own push produced
    ///
    /// The next attempt then pushes against the current server tag instead
    /// of failing on a mismatch it caused itself.
    fn repair_after_local_failure(&mut self, conflicts: &mut ConflictTable, row_id: &str, tag: SyncTag) {
        if let Err(e) = self.refresh_server_variant(conflicts, row_id, Some(tag)) {
            warn!(table_id = %conflicts.table_id, row_id, error = %e, "could not refresh server variant");
        }
    }

    /// Commit a row using the choices recorded in `conflicts`
    pub fn resolve_row(&mut self, conflicts: &mut ConflictTable, row_id: &str) -> Result<SyncTag, ConflictError> {
        let values = conflicts.resolved_values(row_id)?;
        let base = conflicts.server_sync_tag(row_id)?.cloned();
        self.resolve_conflict(conflicts, row_id, base.as_ref(), &values)
    }

    /// Commit an explicit outcome
    ///
    /// Returns the new server tag, or `None` when the row was deleted
    /// without a server round trip.
    pub fn resolve_with(
        &mut self,
        conflicts: &mut ConflictTable,
        row_id: &str,
        resolution: Resolution,
    ) -> Result<Option<SyncTag>, ConflictError> {
        match resolution {
            Resolution::Values(values) => {
                let base = conflicts.server_sync_tag(row_id)?.cloned();
                self.resolve_conflict(conflicts, row_id, base.as_ref(), &values)
                    .map(Some)
            }
            Resolution::Delete => self.delete_row(conflicts, row_id),
        }
    }

    /// Resolve a conflict by deleting the row
    ///
    /// When the server already deleted the row only the local copy is
    /// removed; otherwise the delete is pushed against the server tag first.
    pub fn delete_row(&mut self, conflicts: &mut ConflictTable, row_id: &str) -> Result<Option<SyncTag>, ConflictError> {
        let row = conflicts.row(row_id).ok_or_else(|| ConflictError::RowNotFound {
            row_id: row_id.to_string(),
        })?;
        let table_id = conflicts.table_id.clone();

        if row.server_deleted() {
            self.rows.delete_row_actual(&table_id, row_id)?;
            conflicts.remove(row_id);
            info!(table_id = %table_id, row_id, "conflict resolved by accepting server delete");
            return Ok(None);
        }

        let base = row.server_sync_tag().cloned();
        match self.synchronizer.delete_row(&table_id, row_id, base.as_ref()) {
            Ok(tag) => {
                self.rows.delete_row_actual(&table_id, row_id)?;
                conflicts.remove(row_id);
                info!(table_id = %table_id, row_id, %tag, "conflict resolved by delete");
                Ok(Some(tag))
            }
            Err(e) => Err(self.push_failed(conflicts, row_id, e)),
        }
    }

    /// Leave the row conflicting; refresh its server variant if it moved
    fn push_failed(&mut self, conflicts: &mut ConflictTable, row_id: &str, error: SyncError) -> ConflictError {
        let table_id = conflicts.table_id.clone();
        match &error {
            SyncError::TagMismatch { current, .. } => {
                warn!(table_id = %table_id, row_id, "server row changed again, resolution must be redone");
                if let Err(e) = self.refresh_server_variant(conflicts, row_id, current.clone()) {
                    return e;
                }
            }
            SyncError::Auth(_) => {
                self.synchronizer.invalidate_credentials();
                warn!(table_id = %table_id, row_id, "authentication required to resolve conflict");
            }
            _ => warn!(table_id = %table_id, row_id, error = %error, "could not push resolution"),
        }
        error.into()
    }

    fn refresh_server_variant(
        &mut self,
        conflicts: &mut ConflictTable,
        row_id: &str,
        current: Option<SyncTag>,
    ) -> Result<(), ConflictError> {
        let table_id = conflicts.table_id.clone();
        let server = self
            .synchronizer
            .get_row(&table_id, row_id)?
            .unwrap_or_else(|| RowDelta {
                row_id: row_id.to_string(),
                values: RowValues::new(),
                sync_tag: current,
                deleted: true,
            });
        self.rows.mark_conflicting(&table_id, row_id, &server)?;
        let local = self
            .rows
            .get_row(&table_id, row_id)?
            .ok_or_else(|| StorageError::RowNotFound {
                table_id: table_id.clone(),
                row_id: row_id.to_string(),
            })?;
        conflicts.refresh(local, server);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::table::ColumnChoice;
    use crate::models::{ColumnType, TableDefinition};
    use crate::storage::SqliteStore;
    use crate::sync::local::{LocalServer, LocalSynchronizer};
    use crate::sync::{SyncProcessor, SyncState};

    const TOKEN: &str = "secret";

    fn values(pairs: &[(&str, &str)]) -> RowValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn table() -> TableDefinition {
        let mut table = TableDefinition::new("crops", "Crops")
            .with_column("name", ColumnType::String)
            .with_column("yield", ColumnType::Number);
        table.set_to_sync = true;
        table
    }

    /// r1 synced at v1, then edited locally while the server moves it on
    fn conflicted() -> (LocalServer, LocalSynchronizer, SqliteStore) {
        conflicted_with(&[("name", "Corn"), ("yield", "5")])
    }

    fn conflicted_with(local_edit: &[(&str, &str)]) -> (LocalServer, LocalSynchronizer, SqliteStore) {
        let server = LocalServer::new(TOKEN);
        server.create_table("crops", "Crops", table().columns);
        server
            .put_row("crops", "r1", values(&[("name", "Maize"), ("yield", "4")]))
            .unwrap();

        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&table()).unwrap();
        let mut client = server.connect(Some(TOKEN.into()));
        sync(&mut client, &mut store);

        store.update_row("crops", "r1", &values(local_edit)).unwrap();
        server
            .put_row("crops", "r1", values(&[("name", "Maize (hybrid)"), ("yield", "4")]))
            .unwrap();
        sync(&mut client, &mut store);

        (server, client, store)
    }

    fn sync(client: &mut LocalSynchronizer, store: &mut SqliteStore) {
        let tables = store.tables().unwrap();
        SyncProcessor::new(client, store)
            .synchronize(&tables, false)
            .unwrap();
    }

    fn conflicts(store: &SqliteStore) -> ConflictTable {
        ConflictTable::load(store, &table()).unwrap()
    }

    #[test]
    fn test_resolve_with_explicit_values() {
        let (server, mut client, mut store) = conflicted();
        let mut conflicts = conflicts(&store);

        let tag = ConflictResolver::new(&mut client, &mut store)
            .resolve_conflict(
                &mut conflicts,
                "r1",
                Some(&SyncTag::from("v2")),
                &values(&[("name", "Corn"), ("yield", "5")]),
            )
            .unwrap();

        assert_eq!(tag, SyncTag::from("v3"));
        assert!(conflicts.is_empty());
        let row = store.get_row("crops", "r1").unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Rest);
        assert_eq!(row.sync_tag, Some(tag));
        assert!(store.server_variant("crops", "r1").unwrap().is_none());
        assert_eq!(server.row("crops", "r1").unwrap().value("name"), "Corn");
    }

    #[test]
    fn test_concordant_columns_survive_partial_values() {
        let (server, mut client, mut store) = conflicted_with(&[("name", "Corn")]);
        let mut conflicts = conflicts(&store);
        let unresolved = conflicts.unresolved_columns("r1").unwrap();
        assert_eq!(unresolved, vec!["name"]);

        let tag = ConflictResolver::new(&mut client, &mut store)
            .resolve_conflict(
                &mut conflicts,
                "r1",
                Some(&SyncTag::from("v2")),
                &values(&[("name", "Corn")]),
            )
            .unwrap();

        let remote = server.row("crops", "r1").unwrap();
        assert_eq!(remote.value("name"), "Corn");
        assert_eq!(remote.value("yield"), "4");
        let local = store.get_row("crops", "r1").unwrap().unwrap();
        assert_eq!(local.values, values(&[("name", "Corn"), ("yield", "4")]));
        assert_eq!(local.sync_tag, Some(tag));
    }

    /// Delegates to a real store but fails to finish resolutions
    struct BrokenResolve<'a>(&'a mut SqliteStore);

    impl RowStore for BrokenResolve<'_> {
        fn table_definition(&self, table_id: &str) -> Result<Option<TableDefinition>, StorageError> {
            self.0.table_definition(table_id)
        }
        fn set_table_sync_tag(&mut self, table_id: &str, tag: &SyncTag) -> Result<(), StorageError> {
            self.0.set_table_sync_tag(table_id, tag)
        }
        fn mark_table_synced(&mut self, table_id: &str, at: chrono::DateTime<chrono::Utc>) -> Result<(), StorageError> {
            self.0.mark_table_synced(table_id, at)
        }
        fn get_row(&self, table_id: &str, row_id: &str) -> Result<Option<crate::models::Row>, StorageError> {
            self.0.get_row(table_id, row_id)
        }
        fn rows(&self, table_id: &str) -> Result<Vec<crate::models::Row>, StorageError> {
            self.0.rows(table_id)
        }
        fn rows_in_state(&self, table_id: &str, state: SyncState) -> Result<Vec<crate::models::Row>, StorageError> {
            self.0.rows_in_state(table_id, state)
        }
        fn server_variant(&self, table_id: &str, row_id: &str) -> Result<Option<RowDelta>, StorageError> {
            self.0.server_variant(table_id, row_id)
        }
        fn insert_row(&mut self, table_id: &str, values: RowValues) -> Result<crate::models::Row, StorageError> {
            self.0.insert_row(table_id, values)
        }
        fn update_row(&mut self, table_id: &str, row_id: &str, values: &RowValues) -> Result<crate::models::Row, StorageError> {
            self.0.update_row(table_id, row_id, values)
        }
        fn mark_deleted(&mut self, table_id: &str, row_id: &str) -> Result<crate::sync::RowFate, StorageError> {
            self.0.mark_deleted(table_id, row_id)
        }
        fn store_pulled_row(&mut self, table_id: &str, delta: &RowDelta) -> Result<(), StorageError> {
            self.0.store_pulled_row(table_id, delta)
        }
        fn acknowledge_push(
            &mut self,
            table_id: &str,
            row_id: &str,
            sync_tag: &SyncTag,
        ) -> Result<crate::sync::RowFate, StorageError> {
            self.0.acknowledge_push(table_id, row_id, sync_tag)
        }
        fn mark_conflicting(&mut self, table_id: &str, row_id: &str, server: &RowDelta) -> Result<(), StorageError> {
            self.0.mark_conflicting(table_id, row_id, server)
        }
        fn resolve_conflict(&mut self, table_id: &str, _: &str, _: &SyncTag, _: &RowValues) -> Result<(), StorageError> {
            Err(StorageError::Corrupt {
                table: table_id.to_string(),
                details: "write failed".to_string(),
            })
        }
        fn delete_row_actual(&mut self, table_id: &str, row_id: &str) -> Result<(), StorageError> {
            self.0.delete_row_actual(table_id, row_id)
        }
    }

    #[test]
    fn test_local_failure_after_push_repairs_server_variant() {
        let (server, mut client, mut store) = conflicted_with(&[("name", "Corn")]);
        let mut conflicts = conflicts(&store);
        conflicts.take_local("r1").unwrap();

        let err = ConflictResolver::new(&mut client, &mut BrokenResolve(&mut store))
            .resolve_row(&mut conflicts, "r1")
            .unwrap_err();
        assert!(matches!(err, ConflictError::Storage(_)));

        // The server kept the push; the row now pairs with that copy
        assert_eq!(server.table_tag("crops"), Some(SyncTag::from("v3")));
        assert_eq!(
            conflicts.server_sync_tag("r1").unwrap(),
            Some(&SyncTag::from("v3"))
        );
        assert_eq!(
            store.get_row("crops", "r1").unwrap().unwrap().sync_state,
            SyncState::Conflicting
        );

        // Both sides now agree, so retrying needs no choices and no mismatch
        assert!(conflicts.is_resolvable("r1").unwrap());
        let tag = ConflictResolver::new(&mut client, &mut store)
            .resolve_row(&mut conflicts, "r1")
            .unwrap();
        assert_eq!(tag, SyncTag::from("v4"));
        assert_eq!(
            store.get_row("crops", "r1").unwrap().unwrap().sync_state,
            SyncState::Rest
        );
    }

    #[test]
    fn test_missing_column_is_rejected_without_push() {
        let (server, mut client, mut store) = conflicted();
        let mut conflicts = conflicts(&store);

        let err = ConflictResolver::new(&mut client, &mut store)
            .resolve_conflict(
                &mut conflicts,
                "r1",
                Some(&SyncTag::from("v2")),
                &values(&[("name", "Corn")]),
            )
            .unwrap_err();

        assert!(matches!(err, ConflictError::Incomplete { .. }));
        assert_eq!(
            store.get_row("crops", "r1").unwrap().unwrap().sync_state,
            SyncState::Conflicting
        );
        assert_eq!(server.table_tag("crops"), Some(SyncTag::from("v2")));
    }

    #[test]
    fn test_resolve_row_uses_recorded_choices() {
        let (server, mut client, mut store) = conflicted();
        let mut conflicts = conflicts(&store);

        conflicts.choose("r1", "name", ColumnChoice::Server).unwrap();
        conflicts.choose("r1", "yield", ColumnChoice::Local).unwrap();

        ConflictResolver::new(&mut client, &mut store)
            .resolve_row(&mut conflicts, "r1")
            .unwrap();

        let remote = server.row("crops", "r1").unwrap();
        assert_eq!(remote.value("name"), "Maize (hybrid)");
        assert_eq!(remote.value("yield"), "5");
    }

    #[test]
    fn test_stale_resolution_refreshes_server_variant() {
        let (server, mut client, mut store) = conflicted();
        let mut conflicts = conflicts(&store);
        conflicts.take_local("r1").unwrap();

        server
            .put_row("crops", "r1", values(&[("name", "Maize v3"), ("yield", "4")]))
            .unwrap();

        let err = ConflictResolver::new(&mut client, &mut store)
            .resolve_row(&mut conflicts, "r1")
            .unwrap_err();
        assert!(err.is_stale());

        // The row was re-paired with the newer server copy and needs new choices
        let row = conflicts.row("r1").unwrap();
        assert_eq!(row.server_sync_tag(), Some(&SyncTag::from("v3")));
        assert!(!row.is_resolvable());
        assert_eq!(
            store.server_variant("crops", "r1").unwrap().unwrap().value("name"),
            "Maize v3"
        );

        conflicts.take_local("r1").unwrap();
        let tag = ConflictResolver::new(&mut client, &mut store)
            .resolve_row(&mut conflicts, "r1")
            .unwrap();
        assert_eq!(tag, SyncTag::from("v4"));
    }

    #[test]
    fn test_offline_resolution_keeps_conflict() {
        let (server, mut client, mut store) = conflicted();
        let mut conflicts = conflicts(&store);
        conflicts.take_local("r1").unwrap();

        server.set_unreachable(true);
        let err = ConflictResolver::new(&mut client, &mut store)
            .resolve_row(&mut conflicts, "r1")
            .unwrap_err();

        assert!(matches!(err, ConflictError::Sync(SyncError::Network(_))));
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts.is_resolvable("r1").unwrap());
        assert_eq!(
            store.get_row("crops", "r1").unwrap().unwrap().sync_state,
            SyncState::Conflicting
        );
    }

    #[test]
    fn test_delete_outcome_pushes_delete() {
        let (server, mut client, mut store) = conflicted();
        let mut conflicts = conflicts(&store);

        let tag = ConflictResolver::new(&mut client, &mut store)
            .resolve_with(&mut conflicts, "r1", Resolution::Delete)
            .unwrap();

        assert_eq!(tag, Some(SyncTag::from("v3")));
        assert!(server.row("crops", "r1").unwrap().deleted);
        assert!(store.get_row("crops", "r1").unwrap().is_none());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_server_deleted_row_can_be_deleted_locally_or_revived() {
        let (server, mut client, mut store) = conflicted();
        server.remove_row("crops", "r1").unwrap();
        sync(&mut client, &mut store);

        let mut conflicts = conflicts(&store);
        assert!(conflicts.row("r1").unwrap().server_deleted());

        // Revive with the local values
        let tag = ConflictResolver::new(&mut client, &mut store)
            .resolve_with(
                &mut conflicts,
                "r1",
                Resolution::Values(values(&[("name", "Corn"), ("yield", "5")])),
            )
            .unwrap();
        assert_eq!(tag, Some(SyncTag::from("v4")));
        assert!(!server.row("crops", "r1").unwrap().deleted);
    }

    #[test]
    fn test_accept_server_delete() {
        let (server, mut client, mut store) = conflicted();
        server.remove_row("crops", "r1").unwrap();
        sync(&mut client, &mut store);
        let server_tag = server.table_tag("crops");

        let mut conflicts = conflicts(&store);
        let tag = ConflictResolver::new(&mut client, &mut store)
            .delete_row(&mut conflicts, "r1")
            .unwrap();

        assert!(tag.is_none());
        assert!(store.get_row("crops", "r1").unwrap().is_none());
        assert_eq!(server.table_tag("crops"), server_tag);
    }
}
