//! tablesync Core Library
//!
//! This crate provides the core functionality for tablesync, an offline
//! table synchronization engine. Rows are edited locally, pushed and pulled
//! against a server with optimistic concurrency on sync tags, and every
//! concurrent edit surfaces as an explicit conflict for the user to resolve.
//!
//! # Architecture
//!
//! - **SQLite**: local rows (with their server variants while conflicting),
//!   table definitions and the three-tier key value store
//! - **Synchronizer**: the server seam; [`sync::LocalServer`] is an
//!   in-process reference server
//! - **SyncProcessor**: push/pull of pending rows per table
//! - **ConflictTable**: column-by-column view of conflicting rows
//!
//! # Quick Start
//!
//! ```text
//! let mut store = Store::open()?;
//! store.add_table(&TableDefinition::new("crops", "Crops"))?;
//! store.add_row("crops", values)?;
//!
//! let (server, mut client) = store.connect()?;
//! let outcome = SyncCoordinator::new(store.db_mut(), &mut client).run(false)?;
//! ```
//!
//! # Modules
//!
//! - `store`: Unified storage interface (main entry point)
//! - `models`: Tables, columns, rows and sync tags
//! - `storage`: SQLite persistence
//! - `kvs`: Three-tier table properties
//! - `sync`: Row state machine, push/pull and the sync worker
//! - `conflict`: Conflict tables and resolution
//! - `config`: Application configuration

pub mod config;
pub mod conflict;
pub mod kvs;
pub mod models;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::Config;
pub use conflict::{ColumnChoice, ConflictError, ConflictResolver, ConflictTable, Resolution};
pub use kvs::{KeyValueEntry, KeyValueStoreManager, KeyValueStoreType};
pub use models::{ColumnDefinition, ColumnType, Row, RowDelta, RowValues, SyncTag, TableDefinition};
pub use storage::{RowStore, SqliteStore, StorageError};
pub use store::Store;
pub use sync::{
    spawn_sync_worker, AuthRequired, LocalServer, SyncCoordinator, SyncError, SyncEvent, SyncProcessor,
    SyncState, SynchronizationResult, TableResult, TableStatus,
};
