//! Conflict table
//!
//! Pairs the local and server variants of every conflicting row of a table.
//! Each column of a row is either concordant (both sides display the same
//! text) or conflicting, in which case the caller must pick a side. Choices
//! are recorded on a per-row stack so they can be undone until the row is
//! resolved.

use serde::Serialize;

use crate::conflict::error::ConflictError;
use crate::models::{ColumnDefinition, Row, RowDelta, RowValues, SyncTag, TableDefinition};
use crate::storage::RowStore;
use crate::sync::SyncState;

/// Which variant a conflicting column takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnChoice {
    Local,
    Server,
}

/// Classification of one column of a conflicting row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ColumnState {
    Concordant {
        value: String,
    },
    Conflicting {
        local: String,
        server: String,
        choice: Option<ColumnChoice>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnResolution {
    pub element_key: String,
    pub display_name: String,
    pub state: ColumnState,
}

impl ColumnResolution {
    fn classify(column: &ColumnDefinition, local: &str, server: &str) -> Self {
        let ty = column.column_type;
        let state = if ty.display_text(local) == ty.display_text(server) {
            ColumnState::Concordant {
                value: local.to_string(),
            }
        } else {
            ColumnState::Conflicting {
                local: local.to_string(),
                server: server.to_string(),
                choice: None,
            }
        };
        Self {
            element_key: column.element_key.clone(),
            display_name: column.display_name.clone(),
            state,
        }
    }

    pub fn is_conflicting(&self) -> bool {
        matches!(self.state, ColumnState::Conflicting { .. })
    }

    /// Value the column resolves to, `None` while a choice is missing
    pub fn resolved_value(&self) -> Option<&str> {
        match &self.state {
            ColumnState::Concordant { value } => Some(value),
            ColumnState::Conflicting {
                local,
                choice: Some(ColumnChoice::Local),
                ..
            } => Some(local),
            ColumnState::Conflicting {
                server,
                choice: Some(ColumnChoice::Server),
                ..
            } => Some(server),
            ColumnState::Conflicting { choice: None, .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Decision {
    element_key: String,
    previous: Option<ColumnChoice>,
}

/// One conflicting row with both variants side by side
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRow {
    pub row_id: String,
    pub local: Row,
    pub server: RowDelta,
    pub columns: Vec<ColumnResolution>,
    #[serde(skip)]
    history: Vec<Decision>,
}

impl ConflictRow {
    fn new(columns: &[ColumnDefinition], local: Row, server: RowDelta) -> Self {
        let resolutions = columns
            .iter()
            .map(|c| ColumnResolution::classify(c, local.value(&c.element_key), server.value(&c.element_key)))
            .collect();
        Self {
            row_id: local.row_id.clone(),
            local,
            server,
            columns: resolutions,
            history: Vec::new(),
        }
    }

    /// The server deleted the row while it was conflicting locally
    pub fn server_deleted(&self) -> bool {
        self.server.deleted
    }

    /// Tag of the server variant; the base tag for a resolving push
    pub fn server_sync_tag(&self) -> Option<&SyncTag> {
        self.server.sync_tag.as_ref()
    }

    pub fn conflicting_columns(&self) -> impl Iterator<Item = &ColumnResolution> {
        self.columns.iter().filter(|c| c.is_conflicting())
    }

    /// Conflicting columns that still lack a choice
    pub fn unresolved_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.resolved_value().is_none())
            .map(|c| c.element_key.as_str())
            .collect()
    }

    pub fn is_resolvable(&self) -> bool {
        self.columns.iter().all(|c| c.resolved_value().is_some())
    }

    /// Full set of values after applying every choice
    pub fn resolved_values(&self) -> Result<RowValues, ConflictError> {
        let missing: Vec<String> = self
            .unresolved_columns()
            .into_iter()
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            return Err(ConflictError::Incomplete {
                row_id: self.row_id.clone(),
                missing,
            });
        }
        Ok(self
            .columns
            .iter()
            .map(|c| {
                (
                    c.element_key.clone(),
                    c.resolved_value().unwrap_or_default().to_string(),
                )
            })
            .collect())
    }

    fn choose(&mut self, element_key: &str, choice: ColumnChoice) -> Result<(), ConflictError> {
        let row_id = self.row_id.clone();
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.element_key == element_key)
            .ok_or_else(|| ConflictError::ColumnNotFound {
                row_id: row_id.clone(),
                element_key: element_key.to_string(),
            })?;

        match &mut column.state {
            ColumnState::Concordant { .. } => Err(ConflictError::ColumnNotInConflict {
                row_id,
                element_key: element_key.to_string(),
            }),
            ColumnState::Conflicting { choice: current, .. } => {
                self.history.push(Decision {
                    element_key: element_key.to_string(),
                    previous: *current,
                });
                *current = Some(choice);
                Ok(())
            }
        }
    }

    fn choose_all(&mut self, choice: ColumnChoice) {
        for column in self.columns.iter_mut() {
            if let ColumnState::Conflicting { choice: current, .. } = &mut column.state {
                self.history.push(Decision {
                    element_key: column.element_key.clone(),
                    previous: *current,
                });
                *current = Some(choice);
            }
        }
    }

    fn undo(&mut self) -> bool {
        let Some(decision) = self.history.pop() else {
            return false;
        };
        if let Some(column) = self
            .columns
            .iter_mut()
            .find(|c| c.element_key == decision.element_key)
        {
            if let ColumnState::Conflicting { choice, .. } = &mut column.state {
                *choice = decision.previous;
            }
        }
        true
    }
}

/// Conflicting rows of one table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictTable {
    pub table_id: String,
    #[serde(skip)]
    columns: Vec<ColumnDefinition>,
    rows: Vec<ConflictRow>,
}

impl ConflictTable {
    /// Build the conflict table from every conflicting row in the store
    pub fn load<R: RowStore>(store: &R, table: &TableDefinition) -> Result<Self, ConflictError> {
        let local_rows = store.rows_in_state(&table.table_id, SyncState::Conflicting)?;
        let mut server_rows = Vec::with_capacity(local_rows.len());
        for row in &local_rows {
            let server = store
                .server_variant(&table.table_id, &row.row_id)?
                .ok_or_else(|| {
                    ConflictError::Misaligned(format!(
                        "row '{}' has no server variant",
                        row.row_id
                    ))
                })?;
            server_rows.push(server);
        }
        Self::from_rows(table, local_rows, server_rows)
    }

    /// Pair local and server rows; both lists must carry the same ids in the
    /// same order
    pub fn from_rows(
        table: &TableDefinition,
        local_rows: Vec<Row>,
        server_rows: Vec<RowDelta>,
    ) -> Result<Self, ConflictError> {
        if local_rows.len() != server_rows.len() {
            return Err(ConflictError::Misaligned(format!(
                "{} local rows but {} server rows",
                local_rows.len(),
                server_rows.len()
            )));
        }

        let mut rows = Vec::with_capacity(local_rows.len());
        for (local, server) in local_rows.into_iter().zip(server_rows) {
            if local.row_id != server.row_id {
                return Err(ConflictError::Misaligned(format!(
                    "local row '{}' paired with server row '{}'",
                    local.row_id, server.row_id
                )));
            }
            rows.push(ConflictRow::new(&table.columns, local, server));
        }

        Ok(Self {
            table_id: table.table_id.clone(),
            columns: table.columns.clone(),
            rows,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[ConflictRow] {
        &self.rows
    }

    pub fn row_ids(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.row_id.as_str()).collect()
    }

    pub fn local_rows(&self) -> Vec<&Row> {
        self.rows.iter().map(|r| &r.local).collect()
    }

    pub fn server_rows(&self) -> Vec<&RowDelta> {
        self.rows.iter().map(|r| &r.server).collect()
    }

    pub fn row(&self, row_id: &str) -> Option<&ConflictRow> {
        self.rows.iter().find(|r| r.row_id == row_id)
    }

    fn row_mut(&mut self, row_id: &str) -> Result<&mut ConflictRow, ConflictError> {
        self.rows
            .iter_mut()
            .find(|r| r.row_id == row_id)
            .ok_or_else(|| ConflictError::RowNotFound {
                row_id: row_id.to_string(),
            })
    }

    fn require_row(&self, row_id: &str) -> Result<&ConflictRow, ConflictError> {
        self.row(row_id).ok_or_else(|| ConflictError::RowNotFound {
            row_id: row_id.to_string(),
        })
    }

    /// Pick a side for one conflicting column
    pub fn choose(&mut self, row_id: &str, element_key: &str, choice: ColumnChoice) -> Result<(), ConflictError> {
        self.row_mut(row_id)?.choose(element_key, choice)
    }

    /// Choose the local value for every conflicting column
    pub fn take_local(&mut self, row_id: &str) -> Result<(), ConflictError> {
        self.row_mut(row_id)?.choose_all(ColumnChoice::Local);
        Ok(())
    }

    /// Choose the server value for every conflicting column
    pub fn take_server(&mut self, row_id: &str) -> Result<(), ConflictError> {
        self.row_mut(row_id)?.choose_all(ColumnChoice::Server);
        Ok(())
    }

    /// Revert the most recent choice on a row; `false` if there was none
    pub fn undo(&mut self, row_id: &str) -> Result<bool, ConflictError> {
        Ok(self.row_mut(row_id)?.undo())
    }

    pub fn is_resolvable(&self, row_id: &str) -> Result<bool, ConflictError> {
        Ok(self.require_row(row_id)?.is_resolvable())
    }

    pub fn unresolved_columns(&self, row_id: &str) -> Result<Vec<&str>, ConflictError> {
        Ok(self.require_row(row_id)?.unresolved_columns())
    }

    pub fn resolved_values(&self, row_id: &str) -> Result<RowValues, ConflictError> {
        self.require_row(row_id)?.resolved_values()
    }

    pub fn server_sync_tag(&self, row_id: &str) -> Result<Option<&SyncTag>, ConflictError> {
        Ok(self.require_row(row_id)?.server_sync_tag())
    }

    /// Drop a row once it has been resolved
    pub(crate) fn remove(&mut self, row_id: &str) -> Option<ConflictRow> {
        let index = self.rows.iter().position(|r| r.row_id == row_id)?;
        Some(self.rows.remove(index))
    }

    /// Re-pair a row with a newer server variant, discarding its choices
    pub(crate) fn refresh(&mut self, local: Row, server: RowDelta) {
        let fresh = ConflictRow::new(&self.columns, local, server);
        match self.rows.iter_mut().find(|r| r.row_id == fresh.row_id) {
            Some(row) => *row = fresh,
            None => self.rows.push(fresh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;

    fn table() -> TableDefinition {
        TableDefinition::new("crops", "Crops")
            .with_column("name", ColumnType::String)
            .with_column("yield", ColumnType::Number)
            .with_column("organic", ColumnType::Boolean)
    }

    fn local(row_id: &str, name: &str, yield_: &str, organic: &str) -> Row {
        Row {
            row_id: row_id.to_string(),
            values: RowValues::from([
                ("name".to_string(), name.to_string()),
                ("yield".to_string(), yield_.to_string()),
                ("organic".to_string(), organic.to_string()),
            ]),
            sync_state: SyncState::Conflicting,
            sync_tag: Some(SyncTag::from("v1")),
            deleted: false,
        }
    }

    fn server(row_id: &str, name: &str, yield_: &str, organic: &str) -> RowDelta {
        RowDelta {
            row_id: row_id.to_string(),
            values: RowValues::from([
                ("name".to_string(), name.to_string()),
                ("yield".to_string(), yield_.to_string()),
                ("organic".to_string(), organic.to_string()),
            ]),
            sync_tag: Some(SyncTag::from("v2")),
            deleted: false,
        }
    }

    fn conflicts() -> ConflictTable {
        ConflictTable::from_rows(
            &table(),
            vec![local("r1", "Corn", "4.50", "1")],
            vec![server("r1", "Maize (hybrid)", "5.1", "true")],
        )
        .unwrap()
    }

    #[test]
    fn test_columns_compare_by_display_text() {
        let conflicts = conflicts();
        let row = conflicts.row("r1").unwrap();

        let conflicting: Vec<&str> = row
            .conflicting_columns()
            .map(|c| c.element_key.as_str())
            .collect();
        // "1" and "true" display the same for a boolean column
        assert_eq!(conflicting, vec!["name", "yield"]);
        assert_eq!(row.server_sync_tag(), Some(&SyncTag::from("v2")));
        assert!(!row.server_deleted());
    }

    #[test]
    fn test_misaligned_rows_rejected() {
        let err = ConflictTable::from_rows(
            &table(),
            vec![local("r1", "a", "1", "0")],
            vec![server("r2", "b", "1", "0")],
        )
        .unwrap_err();
        assert!(matches!(err, ConflictError::Misaligned(_)));

        let err = ConflictTable::from_rows(&table(), vec![local("r1", "a", "1", "0")], vec![])
            .unwrap_err();
        assert!(matches!(err, ConflictError::Misaligned(_)));
    }

    #[test]
    fn test_incomplete_choices_block_resolution() {
        let mut conflicts = conflicts();
        conflicts.choose("r1", "name", ColumnChoice::Local).unwrap();

        assert!(!conflicts.is_resolvable("r1").unwrap());
        assert_eq!(conflicts.unresolved_columns("r1").unwrap(), vec!["yield"]);
        let err = conflicts.resolved_values("r1").unwrap_err();
        assert!(matches!(err, ConflictError::Incomplete { ref missing, .. } if missing == &vec!["yield".to_string()]));

        conflicts.choose("r1", "yield", ColumnChoice::Server).unwrap();
        let values = conflicts.resolved_values("r1").unwrap();
        assert_eq!(values["name"], "Corn");
        assert_eq!(values["yield"], "5.1");
        assert_eq!(values["organic"], "1");
    }

    #[test]
    fn test_choose_rejects_concordant_and_unknown_columns() {
        let mut conflicts = conflicts();
        assert!(matches!(
            conflicts.choose("r1", "organic", ColumnChoice::Server),
            Err(ConflictError::ColumnNotInConflict { .. })
        ));
        assert!(matches!(
            conflicts.choose("r1", "colour", ColumnChoice::Server),
            Err(ConflictError::ColumnNotFound { .. })
        ));
        assert!(matches!(
            conflicts.choose("r9", "name", ColumnChoice::Server),
            Err(ConflictError::RowNotFound { .. })
        ));
    }

    #[test]
    fn test_undo_restores_previous_choice() {
        let mut conflicts = conflicts();
        conflicts.choose("r1", "name", ColumnChoice::Local).unwrap();
        conflicts.choose("r1", "name", ColumnChoice::Server).unwrap();

        assert!(conflicts.undo("r1").unwrap());
        assert_eq!(
            conflicts.row("r1").unwrap().columns[0].resolved_value(),
            Some("Corn")
        );

        assert!(conflicts.undo("r1").unwrap());
        assert_eq!(conflicts.row("r1").unwrap().columns[0].resolved_value(), None);
        assert!(!conflicts.undo("r1").unwrap());
    }

    #[test]
    fn test_take_server_and_undo_each_column() {
        let mut conflicts = conflicts();
        conflicts.take_server("r1").unwrap();
        let values = conflicts.resolved_values("r1").unwrap();
        assert_eq!(values["name"], "Maize (hybrid)");

        conflicts.undo("r1").unwrap();
        assert_eq!(conflicts.unresolved_columns("r1").unwrap(), vec!["yield"]);

        conflicts.take_local("r1").unwrap();
        assert_eq!(conflicts.resolved_values("r1").unwrap()["yield"], "4.50");
    }

    #[test]
    fn test_take_local_records_only_conflicting_columns() {
        let mut conflicts = conflicts();
        conflicts.take_local("r1").unwrap();

        let values = conflicts.resolved_values("r1").unwrap();
        assert_eq!(values["name"], "Corn");
        assert_eq!(values["organic"], "1");

        assert!(conflicts.undo("r1").unwrap());
        assert!(conflicts.undo("r1").unwrap());
        assert!(!conflicts.undo("r1").unwrap());
        assert_eq!(conflicts.unresolved_columns("r1").unwrap(), vec!["name", "yield"]);
    }

    #[test]
    fn test_server_deleted_row() {
        let mut gone = server("r1", "", "", "");
        gone.values.clear();
        gone.deleted = true;
        let mut conflicts =
            ConflictTable::from_rows(&table(), vec![local("r1", "Corn", "4.5", "0")], vec![gone])
                .unwrap();

        let row = conflicts.row("r1").unwrap();
        assert!(row.server_deleted());
        assert_eq!(row.unresolved_columns(), vec!["name", "yield", "organic"]);

        conflicts.take_local("r1").unwrap();
        assert_eq!(conflicts.resolved_values("r1").unwrap()["name"], "Corn");
    }

    #[test]
    fn test_remove_and_refresh() {
        let mut conflicts = conflicts();
        conflicts.choose("r1", "name", ColumnChoice::Local).unwrap();

        conflicts.refresh(
            local("r1", "Corn", "4.50", "1"),
            server("r1", "Corn", "4.5", "1"),
        );
        // Newer server copy agrees on every column
        assert!(conflicts.is_resolvable("r1").unwrap());

        assert!(conflicts.remove("r1").is_some());
        assert!(conflicts.is_empty());
        assert!(conflicts.remove("r1").is_none());
    }

    #[test]
    fn test_load_from_store() {
        use crate::storage::SqliteStore;

        let mut store = SqliteStore::open_in_memory().unwrap();
        store.register_table(&table()).unwrap();
        store
            .store_pulled_row("crops", &server("r1", "Maize", "4.5", "0"))
            .unwrap();
        store
            .update_row(
                "crops",
                "r1",
                &RowValues::from([("name".to_string(), "Corn".to_string())]),
            )
            .unwrap();
        store
            .mark_conflicting("crops", "r1", &server("r1", "Maize (hybrid)", "4.5", "0"))
            .unwrap();

        let conflicts = ConflictTable::load(&store, &table()).unwrap();
        assert_eq!(conflicts.row_ids(), vec!["r1"]);
        assert_eq!(conflicts.local_rows()[0].value("name"), "Corn");
        assert_eq!(conflicts.server_rows()[0].value("name"), "Maize (hybrid)");
    }
}
