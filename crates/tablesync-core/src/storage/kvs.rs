//! SQL access to the key value store tiers and the sync flag store

use rusqlite::{params, Connection, OptionalExtension};

use crate::kvs::{KeyValueEntry, KeyValueStoreType, KeyValueType};
use crate::storage::error::{StorageError, StorageResult};

struct EntryRow {
    table_id: String,
    partition: String,
    aspect: String,
    key: String,
    value_type: String,
    value: String,
}

impl EntryRow {
    fn into_entry(self) -> StorageResult<KeyValueEntry> {
        let value_type: KeyValueType =
            self.value_type
                .parse()
                .map_err(|details| StorageError::Corrupt {
                    table: "key_value_store".to_string(),
                    details,
                })?;
        Ok(KeyValueEntry {
            table_id: self.table_id,
            partition: self.partition,
            aspect: self.aspect,
            key: self.key,
            value_type,
            value: self.value,
        })
    }
}

/// Entries of one tier for a table
pub fn entries(
    conn: &Connection,
    tier: KeyValueStoreType,
    table_id: &str,
) -> StorageResult<Vec<KeyValueEntry>> {
    let mut stmt = conn.prepare(
        "SELECT table_id, partition, aspect, key, value_type, value FROM key_value_store
         WHERE tier = ? AND table_id = ?
         ORDER BY partition, aspect, key",
    )?;

    let rows = stmt.query_map(params![tier.as_str(), table_id], |row| {
        Ok(EntryRow {
            table_id: row.get(0)?,
            partition: row.get(1)?,
            aspect: row.get(2)?,
            key: row.get(3)?,
            value_type: row.get(4)?,
            value: row.get(5)?,
        })
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?.into_entry()?);
    }
    Ok(result)
}

pub fn has_entries(conn: &Connection, tier: KeyValueStoreType, table_id: &str) -> StorageResult<bool> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM key_value_store WHERE tier = ? AND table_id = ? LIMIT 1")?;
    Ok(stmt.exists(params![tier.as_str(), table_id])?)
}

/// Distinct table ids present in a tier
pub fn table_ids(conn: &Connection, tier: KeyValueStoreType) -> StorageResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT table_id FROM key_value_store WHERE tier = ? ORDER BY table_id",
    )?;
    let ids = stmt
        .query_map(params![tier.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Insert entries, overwriting any with the same identity
pub fn add_entries(
    conn: &Connection,
    tier: KeyValueStoreType,
    entries: &[KeyValueEntry],
) -> StorageResult<()> {
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO key_value_store
         (tier, table_id, partition, aspect, key, value_type, value)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for entry in entries {
        stmt.execute(params![
            tier.as_str(),
            entry.table_id,
            entry.partition,
            entry.aspect,
            entry.key,
            entry.value_type.as_str(),
            entry.value,
        ])?;
    }
    Ok(())
}

pub fn clear(conn: &Connection, tier: KeyValueStoreType, table_id: &str) -> StorageResult<usize> {
    Ok(conn.execute(
        "DELETE FROM key_value_store WHERE tier = ? AND table_id = ?",
        params![tier.as_str(), table_id],
    )?)
}

/// Make `entries` the complete content of a tier for the table
///
/// Entries are re-keyed to `table_id` so a copy between tables cannot leak.
pub fn replace_entries(
    conn: &Connection,
    tier: KeyValueStoreType,
    table_id: &str,
    entries: &[KeyValueEntry],
) -> StorageResult<()> {
    clear(conn, tier, table_id)?;
    let rekeyed: Vec<KeyValueEntry> = entries
        .iter()
        .map(|e| KeyValueEntry {
            table_id: table_id.to_string(),
            ..e.clone()
        })
        .collect();
    add_entries(conn, tier, &rekeyed)
}

pub fn delete_key(
    conn: &Connection,
    tier: KeyValueStoreType,
    table_id: &str,
    partition: &str,
    aspect: &str,
    key: &str,
) -> StorageResult<usize> {
    Ok(conn.execute(
        "DELETE FROM key_value_store
         WHERE tier = ? AND table_id = ? AND partition = ? AND aspect = ? AND key = ?",
        params![tier.as_str(), table_id, partition, aspect, key],
    )?)
}

/// Remove a table from every tier and from the sync store
pub fn clear_table(conn: &Connection, table_id: &str) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM key_value_store WHERE table_id = ?",
        params![table_id],
    )?;
    conn.execute(
        "DELETE FROM key_value_store_sync WHERE table_id = ?",
        params![table_id],
    )?;
    Ok(())
}

// ==================== Sync store ====================

pub fn sync_flag(conn: &Connection, table_id: &str, key: &str) -> StorageResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM key_value_store_sync WHERE table_id = ? AND key = ?",
            params![table_id, key],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn set_sync_flag(conn: &Connection, table_id: &str, key: &str, value: &str) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO key_value_store_sync (table_id, key, value) VALUES (?, ?, ?)",
        params![table_id, key, value],
    )?;
    Ok(())
}

/// Set a flag only if it has no value yet; returns whether it was written
pub fn add_sync_flag_if_absent(
    conn: &Connection,
    table_id: &str,
    key: &str,
    value: &str,
) -> StorageResult<bool> {
    let written = conn.execute(
        "INSERT OR IGNORE INTO key_value_store_sync (table_id, key, value) VALUES (?, ?, ?)",
        params![table_id, key, value],
    )?;
    Ok(written > 0)
}
