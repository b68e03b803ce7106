//! In-process reference server
//!
//! [`LocalServer`] holds authoritative table state shared by any number of
//! clients; each client talks to it through its own [`LocalSynchronizer`],
//! which carries a cached access token. Tags are per-table counters rendered
//! as `v<n>`: every accepted change bumps the table counter and stamps the
//! row with it.
//!
//! The server state can be saved to and loaded from a JSON snapshot so a
//! CLI can sync against a file. Network faults can be injected per table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kvs::KeyValueEntry;
use crate::models::{ColumnDefinition, RowDelta, RowValues, SyncTag};
use crate::storage::StorageError;
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::synchronizer::Synchronizer;

const TAG_PREFIX: &str = "v";

fn tag(counter: u64) -> SyncTag {
    SyncTag::new(format!("{}{}", TAG_PREFIX, counter))
}

fn parse_tag(tag: &SyncTag) -> Option<u64> {
    tag.as_str().strip_prefix(TAG_PREFIX)?.parse().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteRow {
    values: RowValues,
    counter: u64,
    deleted: bool,
}

impl RemoteRow {
    fn delta(&self, row_id: &str) -> RowDelta {
        RowDelta {
            row_id: row_id.to_string(),
            values: self.values.clone(),
            sync_tag: Some(tag(self.counter)),
            deleted: self.deleted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteTable {
    display_name: String,
    columns: Vec<ColumnDefinition>,
    counter: u64,
    rows: BTreeMap<String, RemoteRow>,
    #[serde(default)]
    properties: Vec<KeyValueEntry>,
}

impl RemoteTable {
    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn check_columns(&self, table_id: &str, values: &RowValues) -> SyncResult<()> {
        match values
            .keys()
            .find(|key| !self.columns.iter().any(|c| &c.element_key == *key))
        {
            Some(unknown) => Err(SyncError::Schema {
                table_id: table_id.to_string(),
                details: format!("unknown column '{}'", unknown),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerState {
    access_token: String,
    tables: BTreeMap<String, RemoteTable>,
    #[serde(skip)]
    offline_tables: BTreeSet<String>,
    #[serde(skip)]
    unreachable: bool,
}

impl ServerState {
    fn table(&self, table_id: &str) -> SyncResult<&RemoteTable> {
        self.tables
            .get(table_id)
            .ok_or_else(|| SyncError::TableNotFound(table_id.to_string()))
    }

    fn table_mut(&mut self, table_id: &str) -> SyncResult<&mut RemoteTable> {
        self.tables
            .get_mut(table_id)
            .ok_or_else(|| SyncError::TableNotFound(table_id.to_string()))
    }

    fn check_reachable(&self, table_id: Option<&str>) -> SyncResult<()> {
        if self.unreachable {
            return Err(SyncError::Network("server unreachable".to_string()));
        }
        if let Some(id) = table_id {
            if self.offline_tables.contains(id) {
                return Err(SyncError::Network(format!(
                    "connection reset while syncing '{}'",
                    id
                )));
            }
        }
        Ok(())
    }
}

/// Authoritative server state shared between clients
#[derive(Debug, Clone)]
pub struct LocalServer {
    state: Arc<Mutex<ServerState>>,
}

impl LocalServer {
    /// Create an empty server accepting `access_token`
    pub fn new(access_token: impl Into<String>) -> Self {
        let state = ServerState {
            access_token: access_token.into(),
            ..ServerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Load a server snapshot from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read server snapshot: {:?}", path))?;
        let state: ServerState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse server snapshot: {:?}", path))?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Load a snapshot, or start an empty server if the file does not exist
    pub fn load_or_create(path: &Path, access_token: &str) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(access_token))
        }
    }

    /// Write the server state to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }
        let content = {
            let state = self.lock();
            serde_json::to_string_pretty(&*state).context("Failed to serialize server state")?
        };
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write server snapshot: {:?}", path))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a client connection with a cached token
    pub fn connect(&self, token: Option<String>) -> LocalSynchronizer {
        LocalSynchronizer {
            server: self.clone(),
            token,
        }
    }

    pub fn access_token(&self) -> String {
        self.lock().access_token.clone()
    }

    /// Issue a new access token; existing client tokens stop working
    pub fn rotate_token(&self, token: impl Into<String>) {
        self.lock().access_token = token.into();
    }

    /// Make every request for `table_id` fail with a network error
    pub fn set_offline(&self, table_id: &str, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline_tables.insert(table_id.to_string());
        } else {
            state.offline_tables.remove(table_id);
        }
    }

    /// Make every request fail with a network error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn table_ids(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    /// Current table-level tag, `None` if the table does not exist
    pub fn table_tag(&self, table_id: &str) -> Option<SyncTag> {
        self.lock().tables.get(table_id).map(|t| tag(t.counter))
    }

    // ==================== Edits by another client ====================

    /// Create a table directly on the server
    pub fn create_table(&self, table_id: &str, display_name: &str, columns: Vec<ColumnDefinition>) {
        self.lock()
            .tables
            .entry(table_id.to_string())
            .or_insert_with(|| RemoteTable {
                display_name: display_name.to_string(),
                columns,
                counter: 0,
                rows: BTreeMap::new(),
                properties: Vec::new(),
            });
    }

    /// Write a row unconditionally, returning its new tag
    pub fn put_row(&self, table_id: &str, row_id: &str, values: RowValues) -> SyncResult<SyncTag> {
        let mut state = self.lock();
        let table = state.table_mut(table_id)?;
        table.check_columns(table_id, &values)?;
        let counter = table.next_counter();
        table.rows.insert(
            row_id.to_string(),
            RemoteRow {
                values,
                counter,
                deleted: false,
            },
        );
        Ok(tag(counter))
    }

    /// Delete a row unconditionally
    pub fn remove_row(&self, table_id: &str, row_id: &str) -> SyncResult<SyncTag> {
        let mut state = self.lock();
        let table = state.table_mut(table_id)?;
        if !table.rows.contains_key(row_id) {
            return Ok(tag(table.counter));
        }
        let counter = table.next_counter();
        if let Some(row) = table.rows.get_mut(row_id) {
            row.counter = counter;
            row.values.clear();
            row.deleted = true;
        }
        Ok(tag(counter))
    }

    /// Replace a table's properties directly on the server
    pub fn put_properties(&self, table_id: &str, entries: Vec<KeyValueEntry>) -> SyncResult<()> {
        let mut state = self.lock();
        state.table_mut(table_id)?.properties = entries;
        Ok(())
    }

    /// Current server copy of a row, including deleted rows
    pub fn row(&self, table_id: &str, row_id: &str) -> Option<RowDelta> {
        let state = self.lock();
        state
            .tables
            .get(table_id)?
            .rows
            .get(row_id)
            .map(|r| r.delta(row_id))
    }

    /// Live (non-deleted) rows of a table
    pub fn rows(&self, table_id: &str) -> Vec<RowDelta> {
        let state = self.lock();
        state
            .tables
            .get(table_id)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|(_, r)| !r.deleted)
                    .map(|(id, r)| r.delta(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One client's connection to a [`LocalServer`]
#[derive(Debug, Clone)]
pub struct LocalSynchronizer {
    server: LocalServer,
    token: Option<String>,
}

impl LocalSynchronizer {
    /// Store a fresh credential after re-authentication
    pub fn authorize(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    pub fn has_credentials(&self) -> bool {
        self.token.is_some()
    }

    pub fn server(&self) -> &LocalServer {
        &self.server
    }

    /// Lock the server state after checking credentials and reachability
    fn session(&mut self, table_id: Option<&str>) -> SyncResult<MutexGuard<'_, ServerState>> {
        let state = self.server.lock();
        state.check_reachable(table_id)?;

        if self.token.is_none() {
            return Err(SyncError::Auth("no credentials cached".to_string()));
        }
        if self.token.as_deref() != Some(state.access_token.as_str()) {
            drop(state);
            warn!("server rejected cached credentials");
            self.token = None;
            return Err(SyncError::Auth("access token expired".to_string()));
        }
        Ok(state)
    }
}

impl Synchronizer for LocalSynchronizer {
    fn list_tables(&mut self) -> SyncResult<BTreeMap<String, String>> {
        let state = self.session(None)?;
        Ok(state
            .tables
            .iter()
            .map(|(id, t)| (id.clone(), t.display_name.clone()))
            .collect())
    }

    fn table_schema(&mut self, table_id: &str) -> SyncResult<Option<Vec<ColumnDefinition>>> {
        let state = self.session(Some(table_id))?;
        Ok(state.tables.get(table_id).map(|t| t.columns.clone()))
    }

    fn create_or_update_schema(
        &mut self,
        table_id: &str,
        display_name: &str,
        columns: &[ColumnDefinition],
    ) -> SyncResult<()> {
        let mut state = self.session(Some(table_id))?;
        match state.tables.get_mut(table_id) {
            Some(table) => table.display_name = display_name.to_string(),
            None => {
                state.tables.insert(
                    table_id.to_string(),
                    RemoteTable {
                        display_name: display_name.to_string(),
                        columns: columns.to_vec(),
                        counter: 0,
                        rows: BTreeMap::new(),
                        properties: Vec::new(),
                    },
                );
                debug!(table_id, "created remote table");
            }
        }
        Ok(())
    }

    fn get_rows_since(&mut self, table_id: &str, since: Option<&SyncTag>) -> SyncResult<Vec<RowDelta>> {
        let state = self.session(Some(table_id))?;
        let table = state.table(table_id)?;

        let floor = match since {
            None => 0,
            Some(tag) => parse_tag(tag).unwrap_or_else(|| {
                warn!(table_id, %tag, "unrecognized sync tag, sending full table");
                0
            }),
        };

        let mut deltas: Vec<(u64, RowDelta)> = table
            .rows
            .iter()
            .filter(|(_, r)| r.counter > floor)
            .map(|(id, r)| (r.counter, r.delta(id)))
            .collect();
        deltas.sort_by_key(|(counter, _)| *counter);
        Ok(deltas.into_iter().map(|(_, d)| d).collect())
    }

    fn get_row(&mut self, table_id: &str, row_id: &str) -> SyncResult<Option<RowDelta>> {
        let state = self.session(Some(table_id))?;
        Ok(state.table(table_id)?.rows.get(row_id).map(|r| r.delta(row_id)))
    }

    fn push_row(
        &mut self,
        table_id: &str,
        row_id: &str,
        expected: Option<&SyncTag>,
        values: &RowValues,
    ) -> SyncResult<SyncTag> {
        let mut state = self.session(Some(table_id))?;
        let table = state.table_mut(table_id)?;
        table.check_columns(table_id, values)?;

        let current = table.rows.get(row_id).map(|r| tag(r.counter));
        if current.as_ref() != expected {
            return Err(SyncError::TagMismatch {
                row_id: row_id.to_string(),
                expected: expected.cloned(),
                current,
            });
        }

        let counter = table.next_counter();
        table.rows.insert(
            row_id.to_string(),
            RemoteRow {
                values: values.clone(),
                counter,
                deleted: false,
            },
        );
        Ok(tag(counter))
    }

    fn delete_row(&mut self, table_id: &str, row_id: &str, expected: Option<&SyncTag>) -> SyncResult<SyncTag> {
        let mut state = self.session(Some(table_id))?;
        let table = state.table_mut(table_id)?;

        let current = match table.rows.get(row_id) {
            None => return Ok(tag(table.counter)),
            Some(row) if row.deleted => return Ok(tag(row.counter)),
            Some(row) => tag(row.counter),
        };
        if Some(&current) != expected {
            return Err(SyncError::TagMismatch {
                row_id: row_id.to_string(),
                expected: expected.cloned(),
                current: Some(current),
            });
        }

        let counter = table.next_counter();
        if let Some(row) = table.rows.get_mut(row_id) {
            row.counter = counter;
            row.values.clear();
            row.deleted = true;
        }
        Ok(tag(counter))
    }

    fn table_properties(&mut self, table_id: &str) -> SyncResult<Vec<KeyValueEntry>> {
        let state = self.session(Some(table_id))?;
        Ok(state.table(table_id)?.properties.clone())
    }

    fn set_table_properties(&mut self, table_id: &str, entries: &[KeyValueEntry]) -> SyncResult<()> {
        let mut state = self.session(Some(table_id))?;
        let table = state.table_mut(table_id)?;
        table.properties = entries
            .iter()
            .map(|e| KeyValueEntry {
                table_id: table_id.to_string(),
                ..e.clone()
            })
            .collect();
        Ok(())
    }

    fn invalidate_credentials(&mut self) {
        self.token = None;
    }
}
