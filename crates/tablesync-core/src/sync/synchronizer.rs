//! Transport seam between the sync engine and a server
//!
//! The engine only ever talks to a server through [`Synchronizer`]. A
//! synchronizer carries its own credentials; an [`SyncError::Auth`] from any
//! call means they are no longer good.

use std::collections::BTreeMap;

use crate::kvs::KeyValueEntry;
use crate::models::{ColumnDefinition, RowDelta, RowValues, SyncTag};
use crate::sync::error::SyncResult;

/// Operations a sync server offers
pub trait Synchronizer {
    /// Tables the server knows, as `table_id -> display name`
    fn list_tables(&mut self) -> SyncResult<BTreeMap<String, String>>;

    /// Column definitions of a remote table, `None` if it does not exist
    fn table_schema(&mut self, table_id: &str) -> SyncResult<Option<Vec<ColumnDefinition>>>;

    /// Create a remote table, or update its display name if it exists
    fn create_or_update_schema(
        &mut self,
        table_id: &str,
        display_name: &str,
        columns: &[ColumnDefinition],
    ) -> SyncResult<()>;

    /// Rows changed after `since`; every row when `since` is `None`
    ///
    /// Deleted rows appear with `deleted` set.
    fn get_rows_since(&mut self, table_id: &str, since: Option<&SyncTag>) -> SyncResult<Vec<RowDelta>>;

    /// Current server version of a single row, `None` if never created
    fn get_row(&mut self, table_id: &str, row_id: &str) -> SyncResult<Option<RowDelta>>;

    /// Insert or update a row
    ///
    /// `expected` is the tag the change is based on (`None` for a row the
    /// server has never seen). Fails with [`SyncError::TagMismatch`] when the
    /// server copy has moved on.
    ///
    /// [`SyncError::TagMismatch`]: crate::sync::SyncError::TagMismatch
    fn push_row(
        &mut self,
        table_id: &str,
        row_id: &str,
        expected: Option<&SyncTag>,
        values: &RowValues,
    ) -> SyncResult<SyncTag>;

    /// Delete a row, under the same tag rules as [`Synchronizer::push_row`]
    fn delete_row(&mut self, table_id: &str, row_id: &str, expected: Option<&SyncTag>) -> SyncResult<SyncTag>;

    /// Table-level properties held by the server
    fn table_properties(&mut self, table_id: &str) -> SyncResult<Vec<KeyValueEntry>>;

    /// Replace the server's table-level properties
    fn set_table_properties(&mut self, table_id: &str, entries: &[KeyValueEntry]) -> SyncResult<()>;

    /// Transfer file attachments for a table's rows
    fn sync_row_attachments(&mut self, _table_id: &str, _push: bool) -> SyncResult<()> {
        Ok(())
    }

    /// Forget cached credentials after the server rejected them
    fn invalidate_credentials(&mut self) {}
}
