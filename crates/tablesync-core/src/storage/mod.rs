//! Storage layer
//!
//! Everything the device knows locally lives in one SQLite database:
//!
//! - **Catalog**: table and column definitions plus each table's sync tag
//! - **Rows**: the local variant of every row, and the server variant of
//!   rows in conflict
//! - **Key value store**: the ACTIVE/DEFAULT/SERVER property tiers and the
//!   per-table sync flags

pub mod catalog;
pub mod error;
pub mod kvs;
pub mod rows;
pub mod schema;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use rows::RowStore;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sqlite::SqliteStore;
