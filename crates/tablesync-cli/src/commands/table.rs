//! Table command handlers

use anyhow::{bail, Context, Result};

use tablesync_core::{ColumnType, Store, TableDefinition};

use crate::output::Output;

/// Register a new table
pub fn add(
    store: &mut Store,
    table_id: String,
    name: Option<String>,
    columns: Vec<String>,
    sync: bool,
    output: &Output,
) -> Result<()> {
    if columns.is_empty() {
        bail!("A table needs at least one column (--column key[:type])");
    }

    let display_name = name.unwrap_or_else(|| table_id.clone());
    let mut table = TableDefinition::new(&table_id, display_name);
    for column in &columns {
        let (key, column_type) = parse_column(column)?;
        if table.column(key).is_some() {
            bail!("Duplicate column '{}'", key);
        }
        table = table.with_column(key, column_type);
    }
    table.set_to_sync = sync;

    store.add_table(&table)?;

    output.success(&format!("Created table: {}", table_id));
    output.print_tables(std::slice::from_ref(&table));
    Ok(())
}

/// List tables
pub fn list(store: &Store, output: &Output) -> Result<()> {
    let tables = store.tables()?;
    output.print_tables(&tables);
    Ok(())
}

/// Drop a table
pub fn drop(store: &mut Store, table_id: &str, output: &Output) -> Result<()> {
    if !store.drop_table(table_id)? {
        bail!("Table '{}' not found", table_id);
    }
    output.success(&format!("Dropped table: {}", table_id));
    Ok(())
}

/// Include or exclude a table from sync runs
pub fn set_sync(store: &mut Store, table_id: &str, enabled: bool, output: &Output) -> Result<()> {
    store.table(table_id)?;
    store.set_table_sync(table_id, enabled)?;

    let state = if enabled { "included in" } else { "excluded from" };
    output.success(&format!("Table '{}' {} sync", table_id, state));
    Ok(())
}

/// Parse `key[:type]`; the type defaults to string
fn parse_column(arg: &str) -> Result<(&str, ColumnType)> {
    let (key, column_type) = match arg.split_once(':') {
        Some((key, ty)) => {
            let column_type = ty
                .parse::<ColumnType>()
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("Invalid column '{}'", arg))?;
            (key, column_type)
        }
        None => (arg, ColumnType::String),
    };
    if key.is_empty() {
        bail!("Missing column name in '{}'", arg);
    }
    Ok((key, column_type))
}
