//! Sync run coordination
//!
//! Wraps a [`SyncProcessor`] run with the table property bookkeeping a
//! client does around it:
//!
//! 1. List remote tables, download the ones unknown locally and make sure
//!    every SERVER-tier table has DEFAULT properties
//! 2. Seed the SERVER tier of local tables that were never pushed
//! 3. Synchronize rows
//! 4. For tables that synced, push dirty properties or pull the server's
//!    and merge them into DEFAULT

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::kvs::KeyValueStoreType;
use crate::models::TableDefinition;
use crate::storage::{SqliteStore, StorageError};
use crate::sync::error::{ErrorKind, SyncError};
use crate::sync::processor::{AuthRequired, SyncProcessor, SynchronizationResult, TableResult, TableStatus};
use crate::sync::synchronizer::Synchronizer;

/// Errors that stop a coordinated run
#[derive(Error, Debug)]
pub enum RunError {
    /// The server rejected the credentials part way through
    ///
    /// `source.partial` holds every table result gathered before the abort;
    /// `downloaded_tables` lists remote tables already created locally.
    #[error("{source}")]
    AuthRequired {
        source: AuthRequired,
        downloaded_tables: Vec<String>,
    },

    /// The server could not be asked which tables exist
    #[error("Could not list server tables: {0}")]
    Listing(#[source] SyncError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a coordinated run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncOutcome {
    /// Remote tables created locally during this run
    pub downloaded_tables: Vec<String>,
    pub result: SynchronizationResult,
}

/// Runs a full sync including table property propagation
pub struct SyncCoordinator<'a, S: Synchronizer> {
    store: &'a mut SqliteStore,
    synchronizer: &'a mut S,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a, S: Synchronizer> SyncCoordinator<'a, S> {
    pub fn new(store: &'a mut SqliteStore, synchronizer: &'a mut S) -> Self {
        Self {
            store,
            synchronizer,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn run(&mut self, push_attachments: bool) -> Result<SyncOutcome, RunError> {
        let mut outcome = SyncOutcome::default();
        let mut early_failures = Vec::new();

        self.download_remote_tables(&mut outcome, &mut early_failures)?;
        self.store.kvs().ensure_default_for_server_tables()?;
        self.seed_server_properties()?;

        let tables = self.store.tables()?;
        let synchronized = {
            let mut processor = SyncProcessor::new(&mut *self.synchronizer, &mut *self.store);
            if let Some(cancel) = self.cancel.clone() {
                processor = processor.with_cancellation(cancel);
            }
            processor.synchronize(&tables, push_attachments)
        };
        let mut result = match synchronized {
            Ok(result) => result,
            Err(mut auth) => {
                self.finish_downloads(&outcome.downloaded_tables, &auth.partial)?;
                auth.partial.table_results.extend(early_failures);
                return Err(RunError::AuthRequired {
                    source: auth,
                    downloaded_tables: outcome.downloaded_tables,
                });
            }
        };

        let mut auth_error = None;
        for table_result in result.table_results.iter_mut() {
            if !table_result.is_success() {
                continue;
            }
            match self.exchange_properties(table_result) {
                Ok(()) => {}
                Err(SyncError::LocalStorage(e)) => return Err(e.into()),
                Err(e) => {
                    auth_error = Some(e);
                    break;
                }
            }
        }
        self.finish_downloads(&outcome.downloaded_tables, &result)?;
        result.table_results.extend(early_failures);

        if let Some(error) = auth_error {
            return Err(self.auth_abort(error, result, outcome.downloaded_tables));
        }
        outcome.result = result;
        Ok(outcome)
    }

    fn auth_abort(
        &mut self,
        error: SyncError,
        partial: SynchronizationResult,
        downloaded_tables: Vec<String>,
    ) -> RunError {
        self.synchronizer.invalidate_credentials();
        warn!(tables = partial.table_results.len(), "sync run aborted, authentication required");
        RunError::AuthRequired {
            source: AuthRequired {
                message: error.to_string(),
                partial,
            },
            downloaded_tables,
        }
    }

    /// Step 1: create local copies of tables that only exist remotely
    fn download_remote_tables(
        &mut self,
        outcome: &mut SyncOutcome,
        failures: &mut Vec<TableResult>,
    ) -> Result<(), RunError> {
        let remote = match self.synchronizer.list_tables() {
            Ok(remote) => remote,
            Err(e) if e.kind() == ErrorKind::Auth => {
                return Err(self.auth_abort(e, SynchronizationResult::default(), Vec::new()));
            }
            Err(e) => return Err(RunError::Listing(e)),
        };

        for (table_id, display_name) in remote {
            if self.store.table(&table_id)?.is_some() {
                continue;
            }
            match self.download_table(&table_id, &display_name) {
                Ok(true) => outcome.downloaded_tables.push(table_id),
                Ok(false) => {}
                Err(e) if e.kind() == ErrorKind::Auth => {
                    let partial = SynchronizationResult {
                        table_results: std::mem::take(failures),
                        cancelled: false,
                    };
                    let downloaded = std::mem::take(&mut outcome.downloaded_tables);
                    return Err(self.auth_abort(e, partial, downloaded));
                }
                Err(SyncError::LocalStorage(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(table_id = %table_id, error = %e, "could not download table");
                    failures.push(TableResult::failed(&table_id, e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn download_table(&mut self, table_id: &str, display_name: &str) -> Result<bool, SyncError> {
        let Some(columns) = self.synchronizer.table_schema(table_id)? else {
            return Ok(false);
        };
        let properties = self.synchronizer.table_properties(table_id)?;

        let mut table = TableDefinition::new(table_id, display_name);
        table.columns = columns;
        table.set_to_sync = true;
        self.store.register_table(&table)?;

        let mut kvs = self.store.kvs();
        kvs.replace_server_entries(table_id, &properties)?;
        kvs.promote_active_to_default(table_id)?;
        kvs.merge_server_to_default(table_id)?;

        info!(table_id, "downloaded table from server");
        Ok(true)
    }

    /// Step 2: give never-pushed tables a SERVER tier to push
    fn seed_server_properties(&mut self) -> Result<(), RunError> {
        for table in self.store.tables()? {
            if !table.set_to_sync {
                continue;
            }
            let mut kvs = self.store.kvs();
            if !kvs.entries(KeyValueStoreType::Server, &table.table_id)?.is_empty() {
                continue;
            }
            kvs.promote_active_to_default(&table.table_id)?;
            kvs.copy_default_to_server(&table.table_id)?;
            kvs.mark_properties_dirty(&table.table_id)?;
        }
        Ok(())
    }

    /// Step 4: push or pull properties for a table that synced
    ///
    /// Only auth and local storage failures are returned; anything else is
    /// recorded on the table's result.
    fn exchange_properties(&mut self, table_result: &mut TableResult) -> Result<(), SyncError> {
        let table_id = table_result.table_id.clone();
        match self.exchange_properties_for(&table_id) {
            Ok(()) => Ok(()),
            Err(e @ SyncError::LocalStorage(_)) => Err(e),
            Err(e) if e.kind() == ErrorKind::Auth => {
                table_result.status = TableStatus::AuthRequired;
                table_result.message = Some(e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!(table_id = %table_id, error = %e, "table property exchange failed");
                table_result.status = TableStatus::Failure;
                table_result.message = Some(format!("Table properties: {}", e));
                Ok(())
            }
        }
    }

    fn exchange_properties_for(&mut self, table_id: &str) -> Result<(), SyncError> {
        if self.store.kvs().properties_dirty(table_id)? {
            let entries = self
                .store
                .kvs()
                .entries(KeyValueStoreType::Server, table_id)?;
            self.synchronizer.set_table_properties(table_id, &entries)?;
            self.store.kvs().clear_properties_dirty(table_id)?;
            info!(table_id, entries = entries.len(), "pushed table properties");
            return Ok(());
        }

        let remote = self.synchronizer.table_properties(table_id)?;
        if remote.is_empty() {
            return Ok(());
        }
        let mut kvs = self.store.kvs();
        kvs.replace_server_entries(table_id, &remote)?;
        kvs.merge_server_to_default(table_id)?;
        Ok(())
    }

    /// Downloaded tables take their vetted settings once their rows arrived
    fn finish_downloads(&mut self, downloaded: &[String], result: &SynchronizationResult) -> Result<(), StorageError> {
        for table_id in downloaded {
            if result.table(table_id).map(TableResult::is_success).unwrap_or(false) {
                self.store.kvs().copy_default_to_active(table_id)?;
            }
        }
        Ok(())
    }
}
