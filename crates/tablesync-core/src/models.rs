//! Data models for tablesync
//!
//! Defines the table catalog (tables and their columns), rows, the
//! server-side row deltas exchanged during sync, and the opaque sync tags
//! that version both.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::SyncState;

/// Column values of a row, keyed by element key
pub type RowValues = BTreeMap<String, String>;

/// Opaque version stamp issued by the server
///
/// Tags are compared only to pick the newest one observed during a sync.
/// Tags of the form `<prefix><digits>` with the same prefix compare by their
/// numeric suffix (`v9 < v10`); anything else falls back to plain string
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncTag(String);

impl SyncTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the newer of an optional current tag and a candidate
    pub fn newest(current: Option<SyncTag>, candidate: &SyncTag) -> SyncTag {
        match current {
            Some(tag) if tag >= *candidate => tag,
            _ => candidate.clone(),
        }
    }

    fn sort_key(&self) -> (&str, Option<u128>) {
        let digits = self
            .0
            .bytes()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let (prefix, suffix) = self.0.split_at(self.0.len() - digits);
        (prefix, suffix.parse().ok())
    }
}

impl Ord for SyncTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SyncTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Type of a user-defined column
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    DateTime,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
        }
    }

    /// Normalize a raw stored value into the text a user would see
    ///
    /// Values that do not parse as the column type are shown verbatim.
    pub fn display_text(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self {
            ColumnType::String => raw.to_string(),
            ColumnType::Integer => trimmed
                .parse::<i64>()
                .map(|n| n.to_string())
                .unwrap_or_else(|_| raw.to_string()),
            ColumnType::Number => trimmed
                .parse::<f64>()
                .map(|n| n.to_string())
                .unwrap_or_else(|_| raw.to_string()),
            ColumnType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => "true".to_string(),
                "0" | "false" | "no" => "false".to_string(),
                _ => raw.to_string(),
            },
            ColumnType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|_| raw.to_string()),
            ColumnType::DateTime => DateTime::parse_from_rfc3339(trimmed)
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
                .unwrap_or_else(|_| raw.to_string()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "text" => Ok(ColumnType::String),
            "integer" | "int" => Ok(ColumnType::Integer),
            "number" | "decimal" => Ok(ColumnType::Number),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "datetime" => Ok(ColumnType::DateTime),
            other => Err(format!("unknown column type '{}'", other)),
        }
    }
}

/// A user-defined column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Stable key of the column within its table
    pub element_key: String,
    /// Human-readable name
    pub display_name: String,
    pub column_type: ColumnType,
}

impl ColumnDefinition {
    pub fn new(element_key: impl Into<String>, column_type: ColumnType) -> Self {
        let element_key = element_key.into();
        Self {
            display_name: element_key.clone(),
            element_key,
            column_type,
        }
    }
}

/// A user-defined table and its sync bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_id: String,
    pub display_name: String,
    /// Columns in display order
    pub columns: Vec<ColumnDefinition>,
    /// Latest table-level tag observed from the server
    pub sync_tag: Option<SyncTag>,
    /// Whether the table takes part in sync runs
    pub set_to_sync: bool,
    /// When the table last finished a successful sync
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl TableDefinition {
    pub fn new(table_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            display_name: display_name.into(),
            columns: Vec::new(),
            sync_tag: None,
            set_to_sync: false,
            last_sync_time: None,
        }
    }

    /// Builder-style column addition
    pub fn with_column(mut self, element_key: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns
            .push(ColumnDefinition::new(element_key, column_type));
        self
    }

    pub fn column(&self, element_key: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.element_key == element_key)
    }

    pub fn element_keys(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.element_key.clone()).collect()
    }

    /// Whether two column sets describe the same schema (order-insensitive)
    pub fn same_schema(&self, other: &[ColumnDefinition]) -> bool {
        let mut local: Vec<(&str, ColumnType)> = self
            .columns
            .iter()
            .map(|c| (c.element_key.as_str(), c.column_type))
            .collect();
        let mut remote: Vec<(&str, ColumnType)> = other
            .iter()
            .map(|c| (c.element_key.as_str(), c.column_type))
            .collect();
        local.sort();
        remote.sort();
        local == remote
    }
}

/// The local variant of a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub row_id: String,
    pub values: RowValues,
    pub sync_state: SyncState,
    /// Tag of the server version this row was last based on
    pub sync_tag: Option<SyncTag>,
    /// Set while a local delete waits to be pushed
    pub deleted: bool,
}

impl Row {
    /// Create a new locally inserted row with a fresh id
    pub fn new(values: RowValues) -> Self {
        Self {
            row_id: Uuid::new_v4().to_string(),
            values,
            sync_state: SyncState::Inserting,
            sync_tag: None,
            deleted: false,
        }
    }

    /// Create a row at rest from a pulled server delta
    pub fn from_delta(delta: &RowDelta) -> Self {
        Self {
            row_id: delta.row_id.clone(),
            values: delta.values.clone(),
            sync_state: SyncState::Rest,
            sync_tag: delta.sync_tag.clone(),
            deleted: false,
        }
    }

    /// Value of a column, empty when unset
    pub fn value(&self, element_key: &str) -> &str {
        self.values.get(element_key).map(String::as_str).unwrap_or("")
    }
}

/// A row as the server currently holds it
///
/// Returned by pulls and by single-row fetches; also stored as the server
/// variant of a conflicting row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDelta {
    pub row_id: String,
    pub values: RowValues,
    /// `None` only for rows the server has never seen
    pub sync_tag: Option<SyncTag>,
    pub deleted: bool,
}

impl RowDelta {
    pub fn value(&self, element_key: &str) -> &str {
        self.values.get(element_key).map(String::as_str).unwrap_or("")
    }
}
