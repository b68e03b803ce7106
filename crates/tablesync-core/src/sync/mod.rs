//! Table synchronization
//!
//! ## Layers
//!
//! - [`state`]: the per-row sync state machine
//! - [`Synchronizer`]: the transport seam, with [`LocalServer`] as an
//!   in-process reference server
//! - [`SyncProcessor`]: push/pull for each table set to sync
//! - [`SyncCoordinator`]: a processor run plus table property propagation
//! - [`spawn_sync_worker`]: runs coordinated syncs on a background worker
//!
//! ## Usage
//!
//! ```ignore
//! let mut client = server.connect(Some(token));
//! let outcome = SyncCoordinator::new(&mut store, &mut client).run(false)?;
//! for table in &outcome.result.table_results {
//!     println!("{}: {:?}", table.table_id, table.status);
//! }
//! ```

mod coordinator;
mod error;
pub mod local;
mod processor;
pub mod state;
mod synchronizer;
mod worker;

pub use coordinator::{RunError, SyncCoordinator, SyncOutcome};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use local::{LocalServer, LocalSynchronizer};
pub use processor::{AuthRequired, SyncProcessor, SynchronizationResult, TableResult, TableStatus};
pub use state::{RowEvent, RowFate, SyncState, TransitionError};
pub use synchronizer::Synchronizer;
pub use worker::{spawn_sync_worker, SyncCommand, SyncEvent, SyncWorkerHandle, WorkerStatus};
