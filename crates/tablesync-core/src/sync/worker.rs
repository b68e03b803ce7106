//! Background sync worker
//!
//! The sync engine is blocking, so runs happen on a single blocking worker.
//! Callers talk to it through channels:
//!
//! - `command_tx`: request a run or shut the worker down
//! - `event_rx`: run lifecycle events, including the run result
//! - `status_rx`: whether a run is in progress
//!
//! Because there is exactly one worker, runs never overlap.

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::storage::SqliteStore;
use crate::sync::coordinator::{RunError, SyncCoordinator, SyncOutcome};
use crate::sync::synchronizer::Synchronizer;

/// Commands sent to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Start a sync run
    SyncNow,
    /// Stop the worker once the current run finishes
    Shutdown,
}

/// Events emitted by the worker
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    Completed(SyncOutcome),
    /// The run stopped because credentials were rejected
    AuthRequired(String),
    Failed(String),
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Syncing,
}

/// Handle to control the sync worker
pub struct SyncWorkerHandle {
    /// Send commands to the worker
    pub command_tx: mpsc::Sender<SyncCommand>,
    /// Receive events from the worker
    pub event_rx: mpsc::Receiver<SyncEvent>,
    /// Watch worker status
    pub status_rx: watch::Receiver<WorkerStatus>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Request a sync run
    pub async fn sync_now(&self) -> Result<()> {
        self.cancel_tx.send_replace(false);
        self.command_tx
            .send(SyncCommand::SyncNow)
            .await
            .context("Sync worker has stopped")
    }

    /// Cancel the current run after the table in flight
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status_rx.borrow()
    }

    /// Wait for the next event; `None` once the worker has stopped
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.event_rx.recv().await
    }

    /// Stop the worker and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        // The worker may already be gone; joining below still succeeds
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        self.task.await.context("Sync worker panicked")
    }
}

/// Spawn the sync worker
///
/// Must be called from within a tokio runtime.
pub fn spawn_sync_worker<S>(store: SqliteStore, synchronizer: S, push_attachments: bool) -> SyncWorkerHandle
where
    S: Synchronizer + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(WorkerStatus::Idle);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let task = tokio::task::spawn_blocking(move || {
        worker_loop(
            store,
            synchronizer,
            push_attachments,
            command_rx,
            event_tx,
            status_tx,
            cancel_rx,
        )
    });

    SyncWorkerHandle {
        command_tx,
        event_rx,
        status_rx,
        cancel_tx,
        task,
    }
}

fn worker_loop<S: Synchronizer>(
    mut store: SqliteStore,
    mut synchronizer: S,
    push_attachments: bool,
    mut command_rx: mpsc::Receiver<SyncCommand>,
    event_tx: mpsc::Sender<SyncEvent>,
    status_tx: watch::Sender<WorkerStatus>,
    cancel_rx: watch::Receiver<bool>,
) {
    info!("sync worker started");

    while let Some(command) = command_rx.blocking_recv() {
        match command {
            SyncCommand::Shutdown => break,
            SyncCommand::SyncNow => {
                status_tx.send_replace(WorkerStatus::Syncing);
                emit(&event_tx, SyncEvent::Started);

                let event = match SyncCoordinator::new(&mut store, &mut synchronizer)
                    .with_cancellation(cancel_rx.clone())
                    .run(push_attachments)
                {
                    Ok(outcome) => SyncEvent::Completed(outcome),
                    Err(RunError::AuthRequired { source, .. }) => {
                        warn!("sync run needs re-authentication");
                        SyncEvent::AuthRequired(source.message)
                    }
                    Err(e) => {
                        warn!(error = %e, "sync run failed");
                        SyncEvent::Failed(e.to_string())
                    }
                };

                status_tx.send_replace(WorkerStatus::Idle);
                emit(&event_tx, event);
            }
        }
    }

    info!("sync worker stopped");
}

fn emit(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if event_tx.blocking_send(event).is_err() {
        debug!("event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnType, RowValues, TableDefinition};
    use crate::storage::RowStore;
    use crate::sync::local::LocalServer;

    fn store_with_row() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut table = TableDefinition::new("crops", "Crops").with_column("name", ColumnType::String);
        table.set_to_sync = true;
        store.register_table(&table).unwrap();
        store
            .insert_row(
                "crops",
                RowValues::from([("name".to_string(), "Maize".to_string())]),
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_worker_runs_sync() {
        let server = LocalServer::new("secret");
        let mut handle = spawn_sync_worker(
            store_with_row(),
            server.connect(Some("secret".into())),
            false,
        );
        assert_eq!(handle.status(), WorkerStatus::Idle);

        handle.sync_now().await.unwrap();
        assert!(matches!(handle.next_event().await, Some(SyncEvent::Started)));
        match handle.next_event().await {
            Some(SyncEvent::Completed(outcome)) => {
                assert_eq!(outcome.result.table("crops").unwrap().pushed_count, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(server.rows("crops").len(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_reports_auth_required() {
        let server = LocalServer::new("secret");
        let mut handle = spawn_sync_worker(store_with_row(), server.connect(None), false);

        handle.sync_now().await.unwrap();
        assert!(matches!(handle.next_event().await, Some(SyncEvent::Started)));
        assert!(matches!(
            handle.next_event().await,
            Some(SyncEvent::AuthRequired(_))
        ));

        handle.shutdown().await.unwrap();
    }
}
