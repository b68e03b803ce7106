//! Unified storage interface
//!
//! The `Store` owns the SQLite database and the configuration it was opened
//! with. It is the entry point for local table and row edits, conflict
//! loading and resolution, and for connecting to the reference server.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = Store::open()?;
//!
//! store.add_table(&TableDefinition::new("crops", "Crops"))?;
//! let row = store.add_row("crops", values)?;
//!
//! let (server, mut client) = store.connect()?;
//! let mut conflicts = store.conflicts("crops")?;
//! store.resolve(&mut client, &mut conflicts, &row.row_id, Resolution::Delete)?;
//! server.save(&store.config().server_path())?;
//! ```

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::conflict::{ConflictResolver, ConflictTable, Resolution};
use crate::kvs::KeyValueStoreManager;
use crate::models::{Row, RowValues, SyncTag, TableDefinition};
use crate::storage::{RowStore, SqliteStore};
use crate::sync::{LocalServer, LocalSynchronizer, RowFate, Synchronizer};

/// Unified storage interface for tablesync
pub struct Store {
    db: SqliteStore,
    config: Config,
}

impl Store {
    /// Open the store using the default configuration
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open the store with a specific configuration
    pub fn open_with_config(config: Config) -> Result<Self> {
        let db = SqliteStore::open(&config).context("Failed to open SQLite database")?;
        Ok(Self { db, config })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Direct access to the database
    pub fn db(&self) -> &SqliteStore {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut SqliteStore {
        &mut self.db
    }

    /// Split into the database and configuration, e.g. to hand the database
    /// to a sync worker
    pub fn into_parts(self) -> (SqliteStore, Config) {
        (self.db, self.config)
    }

    /// Access the key value store tiers
    pub fn kvs(&mut self) -> KeyValueStoreManager<'_> {
        self.db.kvs()
    }

    // ==================== Table Operations ====================

    /// Register a new local table
    pub fn add_table(&mut self, table: &TableDefinition) -> Result<()> {
        self.db
            .register_table(table)
            .with_context(|| format!("Failed to add table '{}'", table.table_id))
    }

    /// Remove a table with its rows and properties
    pub fn drop_table(&mut self, table_id: &str) -> Result<bool> {
        self.db
            .drop_table(table_id)
            .with_context(|| format!("Failed to drop table '{}'", table_id))
    }

    /// Get a table that must exist
    pub fn table(&self, table_id: &str) -> Result<TableDefinition> {
        match self.db.table(table_id).context("Failed to load table")? {
            Some(table) => Ok(table),
            None => bail!("Table '{}' not found", table_id),
        }
    }

    pub fn tables(&self) -> Result<Vec<TableDefinition>> {
        self.db.tables().context("Failed to list tables")
    }

    /// Include or exclude a table from sync runs
    pub fn set_table_sync(&mut self, table_id: &str, enabled: bool) -> Result<()> {
        self.db
            .set_table_sync(table_id, enabled)
            .with_context(|| format!("Failed to update sync setting of '{}'", table_id))
    }

    // ==================== Row Operations ====================

    /// Insert a new local row
    pub fn add_row(&mut self, table_id: &str, values: RowValues) -> Result<Row> {
        self.db
            .insert_row(table_id, values)
            .with_context(|| format!("Failed to add row to '{}'", table_id))
    }

    /// Change some values of a local row
    pub fn edit_row(&mut self, table_id: &str, row_id: &str, values: &RowValues) -> Result<Row> {
        self.db
            .update_row(table_id, row_id, values)
            .with_context(|| format!("Failed to edit row '{}'", row_id))
    }

    /// Delete a local row
    ///
    /// Rows never synced are removed immediately; others wait for the next
    /// push.
    pub fn delete_row(&mut self, table_id: &str, row_id: &str) -> Result<RowFate> {
        self.db
            .mark_deleted(table_id, row_id)
            .with_context(|| format!("Failed to delete row '{}'", row_id))
    }

    pub fn get_row(&self, table_id: &str, row_id: &str) -> Result<Option<Row>> {
        self.db.get_row(table_id, row_id).context("Failed to get row")
    }

    pub fn rows(&self, table_id: &str) -> Result<Vec<Row>> {
        self.db
            .rows(table_id)
            .with_context(|| format!("Failed to list rows of '{}'", table_id))
    }

    // ==================== Conflicts ====================

    /// Load the conflicting rows of a table
    pub fn conflicts(&self, table_id: &str) -> Result<ConflictTable> {
        let table = self.table(table_id)?;
        ConflictTable::load(&self.db, &table)
            .with_context(|| format!("Failed to load conflicts of '{}'", table_id))
    }

    /// Commit a resolution for one conflicting row
    pub fn resolve<S: Synchronizer>(
        &mut self,
        synchronizer: &mut S,
        conflicts: &mut ConflictTable,
        row_id: &str,
        resolution: Resolution,
    ) -> Result<Option<SyncTag>> {
        ConflictResolver::new(synchronizer, &mut self.db)
            .resolve_with(conflicts, row_id, resolution)
            .with_context(|| format!("Failed to resolve row '{}'", row_id))
    }

    // ==================== Server ====================

    /// Open the reference server snapshot and connect with the cached token
    ///
    /// A missing snapshot starts an empty server that accepts the configured
    /// token. Callers save the server after making changes.
    pub fn connect(&self) -> Result<(LocalServer, LocalSynchronizer)> {
        let path = self.config.server_path();
        let server = if path.exists() {
            LocalServer::load(&path)?
        } else {
            match &self.config.auth_token {
                Some(token) => LocalServer::new(token.clone()),
                None => bail!("No auth token configured. Run 'tablesync auth <token>' first"),
            }
        };
        let client = server.connect(self.config.auth_token.clone());
        Ok((server, client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;
    use crate::sync::SyncProcessor;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            auth_token: Some("secret".to_string()),
            ..Config::default()
        }
    }

    fn crops() -> TableDefinition {
        let mut table = TableDefinition::new("crops", "Crops").with_column("name", ColumnType::String);
        table.set_to_sync = true;
        table
    }

    fn values(name: &str) -> RowValues {
        RowValues::from([("name".to_string(), name.to_string())])
    }

    #[test]
    fn test_open_and_persist_rows() {
        let dir = tempdir().unwrap();
        let row_id = {
            let mut store = Store::open_with_config(config(dir.path())).unwrap();
            store.add_table(&crops()).unwrap();
            store.add_row("crops", values("Maize")).unwrap().row_id
        };

        let store = Store::open_with_config(config(dir.path())).unwrap();
        let row = store.get_row("crops", &row_id).unwrap().unwrap();
        assert_eq!(row.value("name"), "Maize");
        assert!(store.config().sqlite_path().exists());
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let dir = tempdir().unwrap();
        let store = Store::open_with_config(config(dir.path())).unwrap();
        assert!(store.table("crops").is_err());
        assert!(store.conflicts("crops").is_err());
    }

    #[test]
    fn test_connect_requires_token_for_new_server() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.auth_token = None;
        let store = Store::open_with_config(config).unwrap();
        assert!(store.connect().is_err());
    }

    #[test]
    fn test_connect_loads_saved_server() {
        let dir = tempdir().unwrap();
        let mut store = Store::open_with_config(config(dir.path())).unwrap();
        store.add_table(&crops()).unwrap();
        store.add_row("crops", values("Maize")).unwrap();

        let (server, mut client) = store.connect().unwrap();
        let tables = store.tables().unwrap();
        let result = SyncProcessor::new(&mut client, store.db_mut())
            .synchronize(&tables, false)
            .unwrap();
        assert!(result.is_success());
        server.save(&store.config().server_path()).unwrap();

        let (reloaded, _) = store.connect().unwrap();
        assert_eq!(reloaded.rows("crops").len(), 1);
    }

    #[test]
    fn test_resolve_conflict_by_delete() {
        let dir = tempdir().unwrap();
        let mut store = Store::open_with_config(config(dir.path())).unwrap();
        store.add_table(&crops()).unwrap();
        let row_id = store.add_row("crops", values("Maize")).unwrap().row_id;

        let (server, mut client) = store.connect().unwrap();
        let tables = store.tables().unwrap();
        SyncProcessor::new(&mut client, store.db_mut())
            .synchronize(&tables, false)
            .unwrap();

        server.put_row("crops", &row_id, values("Sorghum")).unwrap();
        store.edit_row("crops", &row_id, &values("Millet")).unwrap();
        let tables = store.tables().unwrap();
        let result = SyncProcessor::new(&mut client, store.db_mut())
            .synchronize(&tables, false)
            .unwrap();
        assert_eq!(result.conflict_count(), 1);

        let mut conflicts = store.conflicts("crops").unwrap();
        let tag = store
            .resolve(&mut client, &mut conflicts, &row_id, Resolution::Delete)
            .unwrap();
        assert!(tag.is_some());
        assert!(conflicts.is_empty());
        assert!(store.get_row("crops", &row_id).unwrap().is_none());
        assert!(server.rows("crops").is_empty());
    }
}
