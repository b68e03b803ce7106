//! Key value store command handlers

use anyhow::{Context, Result};

use tablesync_core::kvs::KeyValueType;
use tablesync_core::{KeyValueEntry, KeyValueStoreType, Store};

use crate::output::Output;

/// Tier propagation operations exposed on the command line
#[derive(Debug, Clone, Copy)]
pub enum Propagation {
    /// ACTIVE -> DEFAULT when DEFAULT is empty
    Promote,
    /// DEFAULT -> SERVER
    PushDefault,
    /// SERVER merged into DEFAULT
    Merge,
    /// DEFAULT -> ACTIVE
    Accept,
    /// ACTIVE reset from DEFAULT
    Revert,
    /// ACTIVE -> DEFAULT, replacing it
    SetDefault,
}

/// Show one tier's entries for a table
pub fn show(store: &mut Store, table_id: &str, tier: KeyValueStoreType, output: &Output) -> Result<()> {
    store.table(table_id)?;
    let entries = store
        .kvs()
        .entries(tier, table_id)
        .with_context(|| format!("Failed to read {} properties", tier))?;
    output.print_entries(&entries);
    Ok(())
}

/// Set one ACTIVE property
pub fn set(
    store: &mut Store,
    table_id: &str,
    partition: &str,
    aspect: &str,
    key: &str,
    value: &str,
    output: &Output,
) -> Result<()> {
    store.table(table_id)?;
    let entry = KeyValueEntry::new(table_id, partition, aspect, key, KeyValueType::Text, value);
    store
        .kvs()
        .set_entry(KeyValueStoreType::Active, &entry)
        .context("Failed to set property")?;
    output.success(&format!("Set {}/{}/{} = {}", partition, aspect, key, value));
    Ok(())
}

/// Run a propagation operation for a table
pub fn propagate(store: &mut Store, table_id: &str, operation: Propagation, output: &Output) -> Result<()> {
    store.table(table_id)?;
    let mut kvs = store.kvs();

    let message = match operation {
        Propagation::Promote => {
            if kvs.promote_active_to_default(table_id)? {
                "Promoted active properties to default"
            } else {
                "Default properties already present; nothing promoted"
            }
        }
        Propagation::PushDefault => {
            kvs.copy_default_to_server(table_id)?;
            kvs.mark_properties_dirty(table_id)?;
            "Copied default properties to server; they are pushed on the next sync"
        }
        Propagation::Merge => {
            kvs.merge_server_to_default(table_id)?;
            "Merged server properties into default"
        }
        Propagation::Accept => {
            kvs.copy_default_to_active(table_id)?;
            "Copied default properties to active"
        }
        Propagation::Revert => {
            kvs.revert_active_to_default(table_id)?;
            "Reverted active properties to default"
        }
        Propagation::SetDefault => {
            kvs.set_current_as_default(table_id)?;
            "Set active properties as default"
        }
    };

    output.success(&format!("{}: {}", table_id, message));
    Ok(())
}

/// List server tables available for selection
///
/// Every listed table is guaranteed to have DEFAULT properties.
pub fn remote(store: &mut Store, output: &Output) -> Result<()> {
    let mut kvs = store.kvs();
    let fixed = kvs.ensure_default_for_server_tables()?;
    let tables = kvs.table_ids(KeyValueStoreType::Server)?;

    if output.is_json() {
        output.json(&serde_json::json!({
            "tables": tables,
            "defaults_created": fixed,
        }));
        return Ok(());
    }

    if tables.is_empty() {
        output.message("No server tables known yet. Run 'tablesync sync' first.");
        return Ok(());
    }
    for table_id in &tables {
        if output.is_quiet() {
            println!("{}", table_id);
        } else if fixed.contains(table_id) {
            println!("{} (default properties created)", table_id);
        } else {
            println!("{}", table_id);
        }
    }
    Ok(())
}
