//! Conflict command handlers

use anyhow::{bail, Result};

use tablesync_core::{Resolution, Store, SyncTag};

use crate::commands::parse_assignments;
use crate::output::Output;

/// How the user wants a conflicting row resolved
pub enum Choice {
    TakeLocal,
    TakeServer,
    /// Explicit values for the conflicting columns
    Set(Vec<String>),
    Delete,
}

/// List the conflicting rows of a table
pub fn list(store: &Store, table_id: &str, output: &Output) -> Result<()> {
    let conflicts = store.conflicts(table_id)?;
    output.print_conflicts(&conflicts);
    Ok(())
}

/// Resolve one conflicting row and push the result to the server
pub fn resolve(store: &mut Store, table_id: &str, id: &str, choice: Choice, output: &Output) -> Result<()> {
    let mut conflicts = store.conflicts(table_id)?;
    let row_id = conflict_row_id(conflicts.row_ids(), id)?;

    let resolution = match choice {
        Choice::Delete => Resolution::Delete,
        Choice::TakeLocal => {
            conflicts.take_local(&row_id)?;
            Resolution::Values(conflicts.resolved_values(&row_id)?)
        }
        Choice::TakeServer => {
            conflicts.take_server(&row_id)?;
            Resolution::Values(conflicts.resolved_values(&row_id)?)
        }
        Choice::Set(assignments) => {
            if assignments.is_empty() {
                bail!("Choose a resolution: --take local|server, --set key=value or --delete");
            }
            Resolution::Values(parse_assignments(&assignments)?)
        }
    };

    let (server, mut client) = store.connect()?;
    let outcome = store.resolve(&mut client, &mut conflicts, &row_id, resolution);
    server.save(&store.config().server_path())?;
    report(outcome?, &row_id, output);
    Ok(())
}

fn report(tag: Option<SyncTag>, row_id: &str, output: &Output) {
    match tag {
        Some(tag) => output.success(&format!("Resolved row {} (tag {})", row_id, tag)),
        None => output.success(&format!("Resolved row {} by accepting the server delete", row_id)),
    }
}

/// Match a full or prefix row ID against the conflicting rows
fn conflict_row_id(row_ids: Vec<&str>, id: &str) -> Result<String> {
    if row_ids.contains(&id) {
        return Ok(id.to_string());
    }
    let matches: Vec<&str> = row_ids.into_iter().filter(|r| r.starts_with(id)).collect();
    match matches.as_slice() {
        [] => bail!("No conflicting row matching: {}", id),
        [row_id] => Ok(row_id.to_string()),
        _ => bail!("Ambiguous ID '{}'. Please provide more characters.", id),
    }
}
