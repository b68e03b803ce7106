//! Sync command handler

use anyhow::{bail, Context, Result};
use tracing::info;

use tablesync_core::{spawn_sync_worker, Store, SyncEvent};

use crate::output::Output;

/// Run one sync on the background worker and report the result
///
/// Ctrl-C cancels the run once the table in flight finishes.
pub async fn sync(store: Store, output: &Output) -> Result<()> {
    let (server, client) = store.connect()?;
    let (db, config) = store.into_parts();

    let mut worker = spawn_sync_worker(db, client, config.push_attachments);
    worker.sync_now().await?;

    let mut outcome = None;
    let mut failure = None;
    loop {
        let event = tokio::select! {
            event = worker.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                output.message("Cancelling after the current table...");
                worker.cancel();
                continue;
            }
        };

        match event {
            Some(SyncEvent::Started) => output.message("Syncing..."),
            Some(SyncEvent::Completed(done)) => {
                outcome = Some(done);
                break;
            }
            Some(SyncEvent::AuthRequired(message)) => {
                failure = Some(format!(
                    "{}\nRun 'tablesync auth <token>' and sync again.",
                    message
                ));
                break;
            }
            Some(SyncEvent::Failed(message)) => {
                failure = Some(message);
                break;
            }
            None => {
                failure = Some("Sync worker stopped unexpectedly".to_string());
                break;
            }
        }
    }
    worker.shutdown().await?;

    server
        .save(&config.server_path())
        .context("Failed to save server state")?;

    if let Some(message) = failure {
        bail!("Sync failed: {}", message);
    }
    let Some(outcome) = outcome else {
        return Ok(());
    };

    info!(downloaded = outcome.downloaded_tables.len(), "sync command finished");
    for table_id in &outcome.downloaded_tables {
        output.message(&format!("Downloaded table: {}", table_id));
    }
    output.print_sync_result(&outcome.result);

    let conflicts = outcome.result.conflict_count();
    if conflicts > 0 {
        output.message(&format!(
            "{} row(s) need resolving. See 'tablesync conflicts <table>'.",
            conflicts
        ));
    }
    Ok(())
}
