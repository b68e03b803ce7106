//! Row command handlers

use anyhow::{bail, Result};

use tablesync_core::sync::RowFate;
use tablesync_core::Store;

use crate::commands::{parse_assignments, parse_row_id};
use crate::output::Output;

/// Insert a row
pub fn add(store: &mut Store, table_id: &str, assignments: Vec<String>, output: &Output) -> Result<()> {
    let values = parse_assignments(&assignments)?;
    let row = store.add_row(table_id, values)?;

    output.success(&format!("Added row: {}", row.row_id));
    output.print_row(&row);
    Ok(())
}

/// Change values of a row
pub fn edit(
    store: &mut Store,
    table_id: &str,
    id: &str,
    assignments: Vec<String>,
    output: &Output,
) -> Result<()> {
    if assignments.is_empty() {
        bail!("Nothing to change. Pass values with --set key=value");
    }
    let values = parse_assignments(&assignments)?;
    let row_id = parse_row_id(store, table_id, id)?;
    let row = store.edit_row(table_id, &row_id, &values)?;

    output.success(&format!("Updated row: {}", row.row_id));
    output.print_row(&row);
    Ok(())
}

/// Delete a row
pub fn delete(store: &mut Store, table_id: &str, id: &str, output: &Output) -> Result<()> {
    let row_id = parse_row_id(store, table_id, id)?;

    match store.delete_row(table_id, &row_id)? {
        RowFate::Remove => output.success(&format!("Deleted row: {}", row_id)),
        RowFate::Keep(_) => output.success(&format!(
            "Marked row {} for deletion; it is removed after the next sync",
            row_id
        )),
    }
    Ok(())
}

/// List rows of a table
pub fn list(store: &Store, table_id: &str, output: &Output) -> Result<()> {
    let table = store.table(table_id)?;
    let rows = store.rows(table_id)?;
    output.print_rows(&table, &rows);
    Ok(())
}
