//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use tablesync_core::conflict::ColumnState;
use tablesync_core::{ConflictTable, KeyValueEntry, Row, SynchronizationResult, TableDefinition, TableStatus};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print a list of tables
    pub fn print_tables(&self, tables: &[TableDefinition]) {
        match self.format {
            OutputFormat::Human => {
                if tables.is_empty() {
                    println!("No tables found.");
                    return;
                }
                for table in tables {
                    let sync = if table.set_to_sync { "sync" } else { "local" };
                    let tag = table
                        .sync_tag
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{} | {} | {} column(s) | {} | tag {}",
                        table.table_id,
                        truncate(&table.display_name, 30),
                        table.columns.len(),
                        sync,
                        tag
                    );
                }
                println!("\n{} table(s)", tables.len());
            }
            OutputFormat::Json => self.json(tables),
            OutputFormat::Quiet => {
                for table in tables {
                    println!("{}", table.table_id);
                }
            }
        }
    }

    /// Print a single row
    pub fn print_row(&self, row: &Row) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:     {}", row.row_id);
                println!("State:  {}", row.sync_state);
                println!(
                    "Tag:    {}",
                    row.sync_tag.as_ref().map(|t| t.as_str()).unwrap_or("-")
                );
                for (key, value) in &row.values {
                    println!("  {}: {}", key, value);
                }
            }
            OutputFormat::Json => self.json(row),
            OutputFormat::Quiet => println!("{}", row.row_id),
        }
    }

    /// Print the rows of a table
    pub fn print_rows(&self, table: &TableDefinition, rows: &[Row]) {
        match self.format {
            OutputFormat::Human => {
                if rows.is_empty() {
                    println!("No rows in '{}'.", table.table_id);
                    return;
                }
                for row in rows {
                    let values: Vec<String> = table
                        .columns
                        .iter()
                        .map(|c| truncate(row.value(&c.element_key), 20))
                        .collect();
                    println!(
                        "{} | {:<11} | {}",
                        short_id(&row.row_id),
                        row.sync_state.as_str(),
                        values.join(" | ")
                    );
                }
                println!("\n{} row(s)", rows.len());
            }
            OutputFormat::Json => self.json(rows),
            OutputFormat::Quiet => {
                for row in rows {
                    println!("{}", row.row_id);
                }
            }
        }
    }

    /// Print the conflicting rows of a table, column by column
    pub fn print_conflicts(&self, conflicts: &ConflictTable) {
        match self.format {
            OutputFormat::Human => {
                if conflicts.is_empty() {
                    println!("No conflicts in '{}'.", conflicts.table_id);
                    return;
                }
                for row in conflicts.rows() {
                    println!("────────────────────────────────────────");
                    let server_tag = row.server_sync_tag().map(|t| t.as_str()).unwrap_or("-");
                    if row.server_deleted() {
                        println!("Row {} (deleted on server, tag {})", row.row_id, server_tag);
                    } else {
                        println!("Row {} (server tag {})", row.row_id, server_tag);
                    }
                    for column in &row.columns {
                        match &column.state {
                            ColumnState::Concordant { value } => {
                                println!("    {}: {}", column.display_name, value);
                            }
                            ColumnState::Conflicting { local, server, .. } => {
                                println!(
                                    "  ! {}: local '{}' / server '{}'",
                                    column.display_name, local, server
                                );
                            }
                        }
                    }
                }
                println!("\n{} conflicting row(s)", conflicts.len());
            }
            OutputFormat::Json => self.json(conflicts.rows()),
            OutputFormat::Quiet => {
                for row_id in conflicts.row_ids() {
                    println!("{}", row_id);
                }
            }
        }
    }

    /// Print the per-table outcome of a sync run
    pub fn print_sync_result(&self, result: &SynchronizationResult) {
        match self.format {
            OutputFormat::Human => {
                if result.table_results.is_empty() {
                    println!("No tables set to sync.");
                }
                for table in &result.table_results {
                    let status = match table.status {
                        TableStatus::Success => "✓",
                        TableStatus::Failure => "✗",
                        TableStatus::AuthRequired => "🔒",
                    };
                    println!(
                        "{} {}: pushed {}, pulled {}, {} conflict(s)",
                        status,
                        table.table_id,
                        table.pushed_count,
                        table.pulled_count,
                        table.conflict_row_ids.len()
                    );
                    if let Some(ref message) = table.message {
                        println!("    {}", message);
                    }
                }
                if result.cancelled {
                    println!("Sync cancelled before all tables were attempted.");
                }
            }
            OutputFormat::Json => self.json(result),
            OutputFormat::Quiet => {
                for table_id in result.failed_tables() {
                    println!("{}", table_id);
                }
            }
        }
    }

    /// Print key value store entries
    pub fn print_entries(&self, entries: &[KeyValueEntry]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No entries.");
                    return;
                }
                for entry in entries {
                    println!(
                        "{}/{}/{} = {}",
                        entry.partition,
                        entry.aspect,
                        entry.key,
                        truncate(&entry.value, 50)
                    );
                }
            }
            OutputFormat::Json => self.json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.value);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// First 8 characters of an id
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("Maïs hybride", 7), "Maïs...");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("r1"), "r1");
    }
}
