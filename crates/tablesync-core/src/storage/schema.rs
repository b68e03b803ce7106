//! SQLite schema for the local row and key-value stores

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- User-defined tables
        CREATE TABLE IF NOT EXISTS table_definitions (
            table_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            sync_tag TEXT,
            last_sync_time INTEGER
        );

        -- Columns, in display order
        CREATE TABLE IF NOT EXISTS column_definitions (
            table_id TEXT NOT NULL,
            element_key TEXT NOT NULL,
            display_name TEXT NOT NULL,
            column_type TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (table_id, element_key),
            FOREIGN KEY (table_id) REFERENCES table_definitions(table_id) ON DELETE CASCADE
        );

        -- Row data. A conflicting row has two records: 'local' and 'server'.
        CREATE TABLE IF NOT EXISTS rows (
            table_id TEXT NOT NULL,
            row_id TEXT NOT NULL,
            variant TEXT NOT NULL CHECK (variant IN ('local', 'server')),
            row_values TEXT NOT NULL,
            sync_state TEXT NOT NULL,
            sync_tag TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            saved_at INTEGER NOT NULL,
            PRIMARY KEY (table_id, row_id, variant),
            FOREIGN KEY (table_id) REFERENCES table_definitions(table_id) ON DELETE CASCADE
        );

        -- Three-tier key value store (active, default, server)
        CREATE TABLE IF NOT EXISTS key_value_store (
            tier TEXT NOT NULL CHECK (tier IN ('active', 'default', 'server')),
            table_id TEXT NOT NULL,
            partition TEXT NOT NULL,
            aspect TEXT NOT NULL,
            key TEXT NOT NULL,
            value_type TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (tier, table_id, partition, aspect, key)
        );

        -- Per-table sync flags (isSetToSync, propertiesDirty)
        CREATE TABLE IF NOT EXISTS key_value_store_sync (
            table_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (table_id, key)
        );

        CREATE INDEX IF NOT EXISTS idx_rows_state ON rows(table_id, sync_state);
        CREATE INDEX IF NOT EXISTS idx_kvs_table ON key_value_store(table_id);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"table_definitions".to_string()));
        assert!(tables.contains(&"column_definitions".to_string()));
        assert!(tables.contains(&"rows".to_string()));
        assert!(tables.contains(&"key_value_store".to_string()));
        assert!(tables.contains(&"key_value_store_sync".to_string()));
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_tier_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO key_value_store VALUES ('staging', 't', 'Table', 'default', 'k', 'text', 'v')",
            [],
        );
        assert!(result.is_err());
    }
}
