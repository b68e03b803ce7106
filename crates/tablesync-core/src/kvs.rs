//! Three-tier key value store
//!
//! Non-row configuration for each table (display names, column order, view
//! settings) lives in three tiers:
//!
//! - **ACTIVE**: what the device currently uses; edited by the user
//! - **DEFAULT**: the vetted baseline
//! - **SERVER**: snapshot of the last-known remote metadata
//!
//! ```text
//! active <-- default <--MERGE-- server
//! active --> default -->        server
//! ```
//!
//! Entries are addressed by `(tier, table_id, partition, aspect, key)`. A
//! separate sync store holds per-table flags such as `isSetToSync`.
//!
//! Every propagation operation runs in one SQLite transaction and is
//! idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::TableDefinition;
use crate::storage::{kvs as kvs_db, StorageResult, SqliteStore};

/// Partition for table-wide keys
pub const TABLE_PARTITION: &str = "Table";
/// Partition for per-column keys (aspect = element key)
pub const COLUMN_PARTITION: &str = "Column";
/// Aspect used when a partition has a single instance
pub const DEFAULT_ASPECT: &str = "default";

pub const KEY_DISPLAY_NAME: &str = "displayName";
pub const KEY_COLUMN_ORDER: &str = "colOrder";
pub const KEY_ELEMENT_TYPE: &str = "elementType";

/// Sync store key: whether the table takes part in sync runs
pub const SYNC_KEY_IS_SET_TO_SYNC: &str = "isSetToSync";
/// Sync store key: SERVER tier changed locally and must be pushed
pub const SYNC_KEY_PROPERTIES_DIRTY: &str = "propertiesDirty";

/// One of the three property tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyValueStoreType {
    Active,
    Default,
    Server,
}

impl KeyValueStoreType {
    pub const ALL: [KeyValueStoreType; 3] = [
        KeyValueStoreType::Active,
        KeyValueStoreType::Default,
        KeyValueStoreType::Server,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyValueStoreType::Active => "active",
            KeyValueStoreType::Default => "default",
            KeyValueStoreType::Server => "server",
        }
    }
}

impl fmt::Display for KeyValueStoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyValueStoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(KeyValueStoreType::Active),
            "default" => Ok(KeyValueStoreType::Default),
            "server" => Ok(KeyValueStoreType::Server),
            other => Err(format!("unknown key value store tier '{}'", other)),
        }
    }
}

/// How an entry's value string is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyValueType {
    Text,
    Integer,
    Number,
    Boolean,
    /// JSON-encoded structure
    Object,
}

impl KeyValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyValueType::Text => "text",
            KeyValueType::Integer => "integer",
            KeyValueType::Number => "number",
            KeyValueType::Boolean => "boolean",
            KeyValueType::Object => "object",
        }
    }
}

impl FromStr for KeyValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(KeyValueType::Text),
            "integer" => Ok(KeyValueType::Integer),
            "number" => Ok(KeyValueType::Number),
            "boolean" => Ok(KeyValueType::Boolean),
            "object" => Ok(KeyValueType::Object),
            other => Err(format!("unknown value type '{}'", other)),
        }
    }
}

/// A single property of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueEntry {
    pub table_id: String,
    pub partition: String,
    pub aspect: String,
    pub key: String,
    pub value_type: KeyValueType,
    pub value: String,
}

impl KeyValueEntry {
    pub fn new(
        table_id: impl Into<String>,
        partition: impl Into<String>,
        aspect: impl Into<String>,
        key: impl Into<String>,
        value_type: KeyValueType,
        value: impl Into<String>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            partition: partition.into(),
            aspect: aspect.into(),
            key: key.into(),
            value_type,
            value: value.into(),
        }
    }

    /// Identity within a table; the value is not part of it
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.partition, &self.aspect, &self.key)
    }
}

/// Entries written when a table is first registered
pub fn initial_entries(table: &TableDefinition) -> Vec<KeyValueEntry> {
    let id = table.table_id.as_str();
    let column_order =
        serde_json::to_string(&table.element_keys()).unwrap_or_else(|_| "[]".to_string());

    let mut entries = vec![
        KeyValueEntry::new(
            id,
            TABLE_PARTITION,
            DEFAULT_ASPECT,
            KEY_DISPLAY_NAME,
            KeyValueType::Text,
            &table.display_name,
        ),
        KeyValueEntry::new(
            id,
            TABLE_PARTITION,
            DEFAULT_ASPECT,
            KEY_COLUMN_ORDER,
            KeyValueType::Object,
            column_order,
        ),
    ];
    for column in &table.columns {
        entries.push(KeyValueEntry::new(
            id,
            COLUMN_PARTITION,
            &column.element_key,
            KEY_DISPLAY_NAME,
            KeyValueType::Text,
            &column.display_name,
        ));
        entries.push(KeyValueEntry::new(
            id,
            COLUMN_PARTITION,
            &column.element_key,
            KEY_ELEMENT_TYPE,
            KeyValueType::Text,
            column.column_type.as_str(),
        ));
    }
    entries
}

/// Merge SERVER entries into DEFAULT entries
///
/// The result is the union of both. Where both tiers hold the same
/// `(partition, aspect, key)`, the server value wins; DEFAULT-only keys are
/// kept untouched.
pub fn merge_entries(default: &[KeyValueEntry], server: &[KeyValueEntry]) -> Vec<KeyValueEntry> {
    let mut merged: BTreeMap<(String, String, String), KeyValueEntry> = BTreeMap::new();
    for entry in default.iter().chain(server.iter()) {
        let id = (
            entry.partition.clone(),
            entry.aspect.clone(),
            entry.key.clone(),
        );
        merged.insert(id, entry.clone());
    }
    merged.into_values().collect()
}

/// Propagation operations between the three tiers
pub struct KeyValueStoreManager<'a> {
    store: &'a mut SqliteStore,
}

impl<'a> KeyValueStoreManager<'a> {
    pub fn new(store: &'a mut SqliteStore) -> Self {
        Self { store }
    }

    // ==================== Tier access ====================

    /// All entries of one tier for a table, ordered by partition/aspect/key
    pub fn entries(&self, tier: KeyValueStoreType, table_id: &str) -> StorageResult<Vec<KeyValueEntry>> {
        kvs_db::entries(self.store.connection(), tier, table_id)
    }

    /// Values of one partition/aspect as a key -> value map
    pub fn key_values(
        &self,
        tier: KeyValueStoreType,
        table_id: &str,
        partition: &str,
        aspect: &str,
    ) -> StorageResult<BTreeMap<String, String>> {
        Ok(self
            .entries(tier, table_id)?
            .into_iter()
            .filter(|e| e.partition == partition && e.aspect == aspect)
            .map(|e| (e.key, e.value))
            .collect())
    }

    /// Insert or update a single entry
    pub fn set_entry(&mut self, tier: KeyValueStoreType, entry: &KeyValueEntry) -> StorageResult<()> {
        self.store
            .transaction(|tx| kvs_db::add_entries(tx, tier, std::slice::from_ref(entry)))
    }

    /// Remove one key, returning whether it existed
    pub fn delete_key(
        &mut self,
        tier: KeyValueStoreType,
        table_id: &str,
        partition: &str,
        aspect: &str,
        key: &str,
    ) -> StorageResult<bool> {
        self.store.transaction(|tx| {
            kvs_db::delete_key(tx, tier, table_id, partition, aspect, key).map(|n| n > 0)
        })
    }

    /// Ids of all tables with at least one entry in the tier
    pub fn table_ids(&self, tier: KeyValueStoreType) -> StorageResult<Vec<String>> {
        kvs_db::table_ids(self.store.connection(), tier)
    }

    /// Overwrite the SERVER tier with entries fetched from the server
    pub fn replace_server_entries(&mut self, table_id: &str, entries: &[KeyValueEntry]) -> StorageResult<()> {
        self.store.transaction(|tx| {
            kvs_db::replace_entries(tx, KeyValueStoreType::Server, table_id, entries)
        })?;
        debug!(table_id, count = entries.len(), "replaced server tier entries");
        Ok(())
    }

    // ==================== Propagation ====================

    /// active --> default, only when DEFAULT has nothing for the table
    ///
    /// Returns whether anything was copied.
    pub fn promote_active_to_default(&mut self, table_id: &str) -> StorageResult<bool> {
        let promoted = self.store.transaction(|tx| {
            if kvs_db::has_entries(tx, KeyValueStoreType::Default, table_id)? {
                return Ok(false);
            }
            let active = kvs_db::entries(tx, KeyValueStoreType::Active, table_id)?;
            if active.is_empty() {
                return Ok(false);
            }
            kvs_db::add_entries(tx, KeyValueStoreType::Default, &active)?;
            Ok(true)
        })?;
        if promoted {
            info!(table_id, "promoted active properties to default");
        }
        Ok(promoted)
    }

    /// default --> server, replacing whatever SERVER held
    ///
    /// Ensures the table has an `isSetToSync` flag. If the table has already
    /// been synced, marks its properties dirty so they are pushed again.
    pub fn copy_default_to_server(&mut self, table_id: &str) -> StorageResult<()> {
        self.store.transaction(|tx| {
            let default = kvs_db::entries(tx, KeyValueStoreType::Default, table_id)?;
            kvs_db::replace_entries(tx, KeyValueStoreType::Server, table_id, &default)?;
            kvs_db::add_sync_flag_if_absent(tx, table_id, SYNC_KEY_IS_SET_TO_SYNC, "0")?;
            if crate::storage::catalog::sync_tag(tx, table_id)?.is_some() {
                kvs_db::set_sync_flag(tx, table_id, SYNC_KEY_PROPERTIES_DIRTY, "1")?;
            }
            Ok(())
        })?;
        info!(table_id, "copied default properties to server tier");
        Ok(())
    }

    /// default <--MERGE-- server
    pub fn merge_server_to_default(&mut self, table_id: &str) -> StorageResult<()> {
        self.store.transaction(|tx| {
            let default = kvs_db::entries(tx, KeyValueStoreType::Default, table_id)?;
            let server = kvs_db::entries(tx, KeyValueStoreType::Server, table_id)?;
            let merged = merge_entries(&default, &server);
            kvs_db::replace_entries(tx, KeyValueStoreType::Default, table_id, &merged)
        })?;
        info!(table_id, "merged server properties into default");
        Ok(())
    }

    /// active <-- default, accepting the vetted settings
    pub fn copy_default_to_active(&mut self, table_id: &str) -> StorageResult<()> {
        self.copy_tier(KeyValueStoreType::Default, KeyValueStoreType::Active, table_id)?;
        info!(table_id, "copied default properties to active");
        Ok(())
    }

    /// Discard local property edits, going back to DEFAULT
    pub fn revert_active_to_default(&mut self, table_id: &str) -> StorageResult<()> {
        self.copy_tier(KeyValueStoreType::Default, KeyValueStoreType::Active, table_id)?;
        info!(table_id, "reverted active properties to default");
        Ok(())
    }

    /// active --> default, checkpointing the current settings
    pub fn set_current_as_default(&mut self, table_id: &str) -> StorageResult<()> {
        self.copy_tier(KeyValueStoreType::Active, KeyValueStoreType::Default, table_id)?;
        info!(table_id, "set active properties as default");
        Ok(())
    }

    fn copy_tier(
        &mut self,
        from: KeyValueStoreType,
        to: KeyValueStoreType,
        table_id: &str,
    ) -> StorageResult<()> {
        self.store.transaction(|tx| {
            let source = kvs_db::entries(tx, from, table_id)?;
            kvs_db::replace_entries(tx, to, table_id, &source)
        })
    }

    // ==================== Invariant ====================

    /// Give every SERVER-tier table a DEFAULT entry set
    ///
    /// Missing DEFAULT entries are promoted from ACTIVE when the table has
    /// local settings, otherwise seeded from SERVER. Returns the ids that
    /// needed fixing.
    pub fn ensure_default_for_server_tables(&mut self) -> StorageResult<Vec<String>> {
        let fixed = self.store.transaction(|tx| {
            let mut fixed = Vec::new();
            for table_id in kvs_db::table_ids(tx, KeyValueStoreType::Server)? {
                if kvs_db::has_entries(tx, KeyValueStoreType::Default, &table_id)? {
                    continue;
                }
                let mut source = kvs_db::entries(tx, KeyValueStoreType::Active, &table_id)?;
                if source.is_empty() {
                    source = kvs_db::entries(tx, KeyValueStoreType::Server, &table_id)?;
                }
                kvs_db::add_entries(tx, KeyValueStoreType::Default, &source)?;
                fixed.push(table_id);
            }
            Ok(fixed)
        })?;
        if !fixed.is_empty() {
            info!(tables = ?fixed, "created missing default properties");
        }
        Ok(fixed)
    }

    /// Tables offered for selection, built from the SERVER tier
    ///
    /// Enforces the DEFAULT invariant first.
    pub fn selectable_server_tables(&mut self) -> StorageResult<Vec<String>> {
        self.ensure_default_for_server_tables()?;
        self.table_ids(KeyValueStoreType::Server)
    }

    // ==================== Sync store ====================

    pub fn is_set_to_sync(&self, table_id: &str) -> StorageResult<bool> {
        Ok(
            kvs_db::sync_flag(self.store.connection(), table_id, SYNC_KEY_IS_SET_TO_SYNC)?
                .as_deref()
                == Some("1"),
        )
    }

    pub fn set_is_set_to_sync(&mut self, table_id: &str, enabled: bool) -> StorageResult<()> {
        let value = if enabled { "1" } else { "0" };
        self.store.transaction(|tx| {
            kvs_db::set_sync_flag(tx, table_id, SYNC_KEY_IS_SET_TO_SYNC, value)
        })
    }

    pub fn properties_dirty(&self, table_id: &str) -> StorageResult<bool> {
        Ok(
            kvs_db::sync_flag(self.store.connection(), table_id, SYNC_KEY_PROPERTIES_DIRTY)?
                .as_deref()
                == Some("1"),
        )
    }

    /// Flag the SERVER tier as changed locally so it is pushed next sync
    pub fn mark_properties_dirty(&mut self, table_id: &str) -> StorageResult<()> {
        self.store.transaction(|tx| {
            kvs_db::set_sync_flag(tx, table_id, SYNC_KEY_PROPERTIES_DIRTY, "1")
        })
    }

    pub fn clear_properties_dirty(&mut self, table_id: &str) -> StorageResult<()> {
        self.store.transaction(|tx| {
            kvs_db::set_sync_flag(tx, table_id, SYNC_KEY_PROPERTIES_DIRTY, "0")
        })
    }
}
