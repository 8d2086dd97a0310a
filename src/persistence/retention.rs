//! Retention sweeper for time-based session purge.
//!
//! Deletes session records whose `started_at` is older than the retention
//! window, and independently deletes records that fail to decode. Running
//! the sweep twice with the same window removes nothing the second time.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::session_store::SessionStore;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Delete expired and corrupt session records.
///
/// Returns the number of records removed.
///
/// # Errors
///
/// Returns `AppError::Db` if reading or deleting fails.
pub async fn sweep(store: &SessionStore, max_age: chrono::Duration) -> Result<u64> {
    let cutoff = Utc::now() - max_age;
    let scan = store.scan().await?;

    let mut removed = 0u64;

    for record in &scan.corrupt {
        if store.delete(&record.session_id).await? {
            info!(session_id = record.session_id, reason = record.reason, "removed corrupt session record");
            removed += 1;
        }
    }

    for session in scan.sessions.iter().filter(|s| s.started_at < cutoff) {
        if store.delete(&session.session_id).await? {
            removed += 1;
        }
    }

    info!(removed, cutoff = %cutoff, "retention sweep completed");
    Ok(removed)
}

/// Spawn the retention sweep background task.
///
/// The task sweeps hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    store: SessionStore,
    max_age: chrono::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("retention task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = sweep(&store, max_age).await {
                            error!(%err, "retention sweep failed");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("retention")),
    )
}
