//! Command handlers

pub mod config;
pub mod conflict;
pub mod kvs;
pub mod row;
pub mod status;
pub mod sync;
pub mod table;

use anyhow::{bail, Result};

use tablesync_core::{RowValues, Store};

/// Parse `key=value` arguments into row values
///
/// The value may be empty; the key may not.
pub fn parse_assignments(assignments: &[String]) -> Result<RowValues> {
    let mut values = RowValues::new();
    for assignment in assignments {
        let Some((key, value)) = assignment.split_once('=') else {
            bail!("Expected key=value, got '{}'", assignment);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Missing column name in '{}'", assignment);
        }
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}

/// Resolve a row ID (supports full ID or prefix)
pub fn parse_row_id(store: &Store, table_id: &str, id: &str) -> Result<String> {
    let rows = store.rows(table_id)?;
    if rows.iter().any(|r| r.row_id == id) {
        return Ok(id.to_string());
    }

    let matches: Vec<_> = rows.iter().filter(|r| r.row_id.starts_with(id)).collect();
    match matches.len() {
        0 => bail!("No row in '{}' matching: {}", table_id, id),
        1 => Ok(matches[0].row_id.clone()),
        _ => {
            eprintln!("Multiple rows match '{}':", id);
            for row in &matches {
                eprintln!("  {}", row.row_id);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}
