//! Per-table push/pull synchronization
//!
//! ## Algorithm
//!
//! For each table set to sync, in ascending `table_id` order:
//!
//! 1. Make sure the remote table exists and has the same columns
//! 2. Push every pending row with the tag it was based on. Accepted pushes
//!    return the row to rest; rejected pushes (tag mismatch) park the row in
//!    `conflicting` next to a copy of the current server row
//! 3. Pull rows changed since the table's last tag. Rows at rest are
//!    overwritten, absent rows are inserted, rows with local changes are left
//!    alone
//! 4. Advance the table tag to the newest tag seen in steps 2 and 3
//!
//! Only an auth failure stops a run. Every other error ends the current
//! table with a failure result and the run moves on.

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::{RowDelta, RowValues, SyncTag, TableDefinition};
use crate::storage::{RowStore, StorageError};
use crate::sync::error::{ErrorKind, SyncError, SyncResult};
use crate::sync::state::SyncState;
use crate::sync::synchronizer::Synchronizer;

/// Outcome of one table within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Success,
    Failure,
    AuthRequired,
}

/// Summary of synchronizing a single table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableResult {
    pub table_id: String,
    pub status: TableStatus,
    pub message: Option<String>,
    pub pushed_count: usize,
    pub pulled_count: usize,
    /// Rows left in `conflicting` after this table's sync
    pub conflict_row_ids: Vec<String>,
}

impl TableResult {
    fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            status: TableStatus::Success,
            message: None,
            pushed_count: 0,
            pulled_count: 0,
            conflict_row_ids: Vec::new(),
        }
    }

    pub(crate) fn failed(table_id: &str, message: String) -> Self {
        Self {
            status: TableStatus::Failure,
            message: Some(message),
            ..Self::new(table_id)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TableStatus::Success
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflict_row_ids.is_empty()
    }
}

/// Outcome of a whole run, one entry per table attempted
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SynchronizationResult {
    pub table_results: Vec<TableResult>,
    /// The run was cancelled before every table was attempted
    pub cancelled: bool,
}

impl SynchronizationResult {
    pub fn table(&self, table_id: &str) -> Option<&TableResult> {
        self.table_results.iter().find(|r| r.table_id == table_id)
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.table_results.iter().all(TableResult::is_success)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.table_results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.table_id.as_str())
            .collect()
    }

    pub fn conflict_count(&self) -> usize {
        self.table_results
            .iter()
            .map(|r| r.conflict_row_ids.len())
            .sum()
    }
}

/// A run stopped because the server rejected the credentials
///
/// `partial` holds the results of the tables attempted so far, ending with
/// the table that hit the auth failure.
#[derive(Error, Debug)]
#[error("Authentication required: {message}")]
pub struct AuthRequired {
    pub message: String,
    pub partial: SynchronizationResult,
}

/// Drives push/pull for tables against a [`Synchronizer`]
pub struct SyncProcessor<'a, S: Synchronizer, R: RowStore> {
    synchronizer: &'a mut S,
    rows: &'a mut R,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a, S: Synchronizer, R: RowStore> SyncProcessor<'a, S, R> {
    pub fn new(synchronizer: &'a mut S, rows: &'a mut R) -> Self {
        Self {
            synchronizer,
            rows,
            cancel: None,
        }
    }

    /// Stop between tables once `cancel` reads `true`
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Synchronize every table marked set-to-sync, in `table_id` order
    pub fn synchronize(
        &mut self,
        tables: &[TableDefinition],
        push_attachments: bool,
    ) -> Result<SynchronizationResult, AuthRequired> {
        let mut selected: Vec<&TableDefinition> = tables.iter().filter(|t| t.set_to_sync).collect();
        selected.sort_by(|a, b| a.table_id.cmp(&b.table_id));

        info!(tables = selected.len(), "starting sync run");
        let mut result = SynchronizationResult::default();

        for table in selected {
            if self.is_cancelled() {
                info!(
                    completed = result.table_results.len(),
                    "sync run cancelled"
                );
                result.cancelled = true;
                break;
            }

            let table_result = self.run_table(table, push_attachments);
            if table_result.status == TableStatus::AuthRequired {
                let message = table_result.message.clone().unwrap_or_default();
                result.table_results.push(table_result);
                return Err(AuthRequired {
                    message,
                    partial: result,
                });
            }
            result.table_results.push(table_result);
        }

        info!(
            tables = result.table_results.len(),
            failed = result.failed_tables().len(),
            conflicts = result.conflict_count(),
            "sync run finished"
        );
        Ok(result)
    }

    /// Synchronize one table
    pub fn synchronize_table(
        &mut self,
        table: &TableDefinition,
        push_attachments: bool,
    ) -> Result<TableResult, AuthRequired> {
        let table_result = self.run_table(table, push_attachments);
        if table_result.status == TableStatus::AuthRequired {
            return Err(AuthRequired {
                message: table_result.message.clone().unwrap_or_default(),
                partial: SynchronizationResult {
                    table_results: vec![table_result],
                    cancelled: false,
                },
            });
        }
        Ok(table_result)
    }

    fn run_table(&mut self, table: &TableDefinition, push_attachments: bool) -> TableResult {
        let mut result = TableResult::new(&table.table_id);

        let outcome = self.sync_table(table, push_attachments, &mut result);

        // Conflicts are reported even when the table failed part way
        match self
            .rows
            .rows_in_state(&table.table_id, SyncState::Conflicting)
        {
            Ok(rows) => result.conflict_row_ids = rows.into_iter().map(|r| r.row_id).collect(),
            Err(e) => warn!(table_id = %table.table_id, error = %e, "could not list conflicting rows"),
        }

        match outcome {
            Ok(()) => {
                info!(
                    table_id = %table.table_id,
                    pushed = result.pushed_count,
                    pulled = result.pulled_count,
                    conflicts = result.conflict_row_ids.len(),
                    "table synced"
                );
            }
            Err(e) if e.kind() == ErrorKind::Auth => {
                error!(table_id = %table.table_id, error = %e, "authentication failed, aborting sync run");
                self.synchronizer.invalidate_credentials();
                result.status = TableStatus::AuthRequired;
                result.message = Some(e.to_string());
            }
            Err(e) => {
                warn!(table_id = %table.table_id, error = %e, kind = ?e.kind(), "table sync failed");
                result.status = TableStatus::Failure;
                result.message = Some(e.to_string());
            }
        }
        result
    }

    fn sync_table(
        &mut self,
        table: &TableDefinition,
        push_attachments: bool,
        result: &mut TableResult,
    ) -> SyncResult<()> {
        let table_id = table.table_id.as_str();
        let current = self
            .rows
            .table_definition(table_id)?
            .ok_or_else(|| StorageError::TableNotFound {
                table_id: table_id.to_string(),
            })?;
        let start_tag = current.sync_tag.clone();

        self.ensure_remote_schema(&current)?;

        let mut newest = start_tag.clone();
        self.push(table_id, result, &mut newest)?;
        self.pull(table_id, start_tag.as_ref(), result, &mut newest)?;

        if let Some(tag) = newest.as_ref() {
            if Some(tag) != start_tag.as_ref() {
                self.rows.set_table_sync_tag(table_id, tag)?;
                debug!(table_id, %tag, "advanced table sync tag");
            }
        }

        self.synchronizer
            .sync_row_attachments(table_id, push_attachments)?;
        self.rows.mark_table_synced(table_id, Utc::now())?;
        Ok(())
    }

    fn ensure_remote_schema(&mut self, table: &TableDefinition) -> SyncResult<()> {
        match self.synchronizer.table_schema(&table.table_id)? {
            None => {
                info!(table_id = %table.table_id, "creating table on server");
                self.synchronizer.create_or_update_schema(
                    &table.table_id,
                    &table.display_name,
                    &table.columns,
                )
            }
            Some(remote) if table.same_schema(&remote) => Ok(()),
            Some(remote) => {
                let remote_keys: Vec<&str> = remote.iter().map(|c| c.element_key.as_str()).collect();
                Err(SyncError::Schema {
                    table_id: table.table_id.clone(),
                    details: format!(
                        "local columns [{}] do not match server columns [{}]",
                        table.element_keys().join(", "),
                        remote_keys.join(", ")
                    ),
                })
            }
        }
    }

    fn push(
        &mut self,
        table_id: &str,
        result: &mut TableResult,
        newest: &mut Option<SyncTag>,
    ) -> SyncResult<()> {
        for row in self.rows.pending_rows(table_id)? {
            let expected = row.sync_tag.as_ref();
            let pushed = match row.sync_state {
                SyncState::Deleting => self.synchronizer.delete_row(table_id, &row.row_id, expected),
                _ => self
                    .synchronizer
                    .push_row(table_id, &row.row_id, expected, &row.values),
            };

            match pushed {
                Ok(tag) => {
                    self.rows.acknowledge_push(table_id, &row.row_id, &tag)?;
                    *newest = Some(SyncTag::newest(newest.take(), &tag));
                    result.pushed_count += 1;
                    debug!(table_id, row_id = %row.row_id, state = %row.sync_state, %tag, "pushed row");
                }
                Err(SyncError::TagMismatch { current, .. }) => {
                    let server = self
                        .synchronizer
                        .get_row(table_id, &row.row_id)?
                        .unwrap_or_else(|| RowDelta {
                            row_id: row.row_id.clone(),
                            values: RowValues::new(),
                            sync_tag: current,
                            deleted: true,
                        });
                    self.rows.mark_conflicting(table_id, &row.row_id, &server)?;
                    warn!(
                        table_id,
                        row_id = %row.row_id,
                        server_deleted = server.deleted,
                        "push rejected, row is now conflicting"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn pull(
        &mut self,
        table_id: &str,
        since: Option<&SyncTag>,
        result: &mut TableResult,
        newest: &mut Option<SyncTag>,
    ) -> SyncResult<()> {
        let deltas = self.synchronizer.get_rows_since(table_id, since)?;
        debug!(table_id, deltas = deltas.len(), "pulled row deltas");

        for delta in deltas {
            if let Some(tag) = delta.sync_tag.as_ref() {
                *newest = Some(SyncTag::newest(newest.take(), tag));
            }

            match self.rows.get_row(table_id, &delta.row_id)? {
                None if delta.deleted => {}
                None => {
                    self.rows.store_pulled_row(table_id, &delta)?;
                    result.pulled_count += 1;
                }
                Some(local) => match local.sync_state {
                    SyncState::Rest => {
                        // Our own acknowledged pushes come back in the pull
                        if !delta.deleted && local.sync_tag == delta.sync_tag {
                            continue;
                        }
                        self.rows.store_pulled_row(table_id, &delta)?;
                        result.pulled_count += 1;
                    }
                    SyncState::Conflicting => {
                        self.rows.mark_conflicting(table_id, &delta.row_id, &delta)?;
                    }
                    SyncState::Inserting | SyncState::Updating | SyncState::Deleting => {
                        debug!(table_id, row_id = %delta.row_id, "skipping pull for row with local changes");
                    }
                },
            }
        }
        Ok(())
    }
}
