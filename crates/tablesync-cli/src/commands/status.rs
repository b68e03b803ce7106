//! Status command handler

use anyhow::Result;

use tablesync_core::{RowStore, Store, SyncState};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(store: &Store, output: &Output) -> Result<()> {
    let config = store.config();
    let tables = store.tables()?;

    let mut summaries = Vec::new();
    for table in &tables {
        let pending = store.db().pending_rows(&table.table_id)?.len();
        let conflicts = store
            .db()
            .rows_in_state(&table.table_id, SyncState::Conflicting)?
            .len();
        summaries.push((table, pending, conflicts));
    }

    match output.format {
        OutputFormat::Json => {
            let tables: Vec<_> = summaries
                .iter()
                .map(|(table, pending, conflicts)| {
                    serde_json::json!({
                        "table_id": table.table_id,
                        "set_to_sync": table.set_to_sync,
                        "sync_tag": table.sync_tag,
                        "last_sync_time": table.last_sync_time,
                        "pending_rows": pending,
                        "conflicting_rows": conflicts
                    })
                })
                .collect();
            output.json(&serde_json::json!({
                "data_dir": config.data_dir,
                "server_path": config.server_path(),
                "authenticated": config.auth_token.is_some(),
                "tables": tables
            }));
        }
        OutputFormat::Quiet => {
            let conflicts: usize = summaries.iter().map(|(_, _, c)| c).sum();
            println!("{}", conflicts);
        }
        OutputFormat::Human => {
            println!("tablesync Status");
            println!("================");
            println!();
            println!("Server:");
            println!("  Snapshot: {}", config.server_path().display());
            println!(
                "  Auth:     {}",
                if config.auth_token.is_some() {
                    "token set"
                } else {
                    "not authenticated"
                }
            );
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Tables:");
            if summaries.is_empty() {
                println!("  (none)");
            }
            for (table, pending, conflicts) in &summaries {
                let last_sync = table
                    .last_sync_time
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {}{}: {} pending, {} conflicting, last sync {}",
                    table.table_id,
                    if table.set_to_sync { "" } else { " (local only)" },
                    pending,
                    conflicts,
                    last_sync
                );
            }
        }
    }

    Ok(())
}
