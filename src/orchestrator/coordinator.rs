//! Batch coordinator.
//!
//! Drives a task set to completion: each iteration refreshes session
//! status, computes the ready set, and dispatches up to `batch_size` ready
//! tasks concurrently. With nothing ready it either finishes, reports a
//! stall (tasks remain but nothing is in flight to unblock them), or backs
//! off while in-flight sessions run. A dispatched task leaves the pending
//! set whatever the outcome of its dispatch.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::launcher::Launcher;
use super::monitor::Monitor;
use super::readiness;
use crate::config::SchedulerConfig;
use crate::models::session::SessionStatus;
use crate::models::task::Task;
use crate::persistence::session_store::SessionStore;
use crate::Result;

/// How a coordination run ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every task was dispatched and nothing is left in flight.
    Completed,
    /// Tasks remain but none can become ready.
    Stalled,
    /// Shutdown was requested before the run finished.
    Cancelled,
}

/// Result of [`Coordinator::run`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CoordinatorSummary {
    /// How the run ended.
    pub outcome: Outcome,
    /// Tasks handed to the launcher.
    pub dispatched: usize,
    /// Dispatched tasks whose latest session is `completed`.
    pub completed: usize,
    /// Dispatched tasks whose latest session is `failed`.
    pub failed: usize,
    /// Dispatched tasks whose latest session is `error` or `exception`,
    /// or that have no session at all.
    pub error: usize,
    /// Dispatched tasks still `starting`/`running` when the run ended.
    pub in_flight: usize,
    /// Tasks that were never dispatched.
    pub never_ready: usize,
    /// Ids of the never-dispatched tasks.
    pub never_ready_ids: Vec<String>,
    /// Task ids dispatched per batch, in order.
    pub batches: Vec<Vec<String>>,
}

/// Batch size and idle backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Maximum tasks dispatched concurrently.
    pub batch_size: usize,
    /// Sleep between iterations while sessions are in flight.
    pub backoff: Duration,
}

impl From<&SchedulerConfig> for BatchSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            backoff: config.backoff(),
        }
    }
}

/// Runs the dispatch loop over a task set.
pub struct Coordinator {
    store: SessionStore,
    launcher: Launcher,
    monitor: Monitor,
    settings: BatchSettings,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        store: SessionStore,
        launcher: Launcher,
        monitor: Monitor,
        settings: BatchSettings,
    ) -> Self {
        Self {
            store,
            launcher,
            monitor,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// End the run with [`Outcome::Cancelled`] when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Dispatch `tasks` in dependency order until done, stalled or cancelled.
    ///
    /// Individual dispatch failures are recorded as sessions and counted in
    /// the summary; they do not abort the run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the session store becomes unusable.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<CoordinatorSummary> {
        let span = info_span!("coordinate", tasks = tasks.len());
        self.run_inner(tasks).instrument(span).await
    }

    async fn run_inner(&self, tasks: Vec<Task>) -> Result<CoordinatorSummary> {
        let batch_size = self.settings.batch_size.max(1);
        let mut pending = tasks;
        pending.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut batches: Vec<Vec<String>> = Vec::new();

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break Outcome::Cancelled;
            }

            self.monitor.refresh().await?;
            let ready = readiness::ready(&pending, &self.store).await?;

            if ready.is_empty() {
                let in_flight = self.store.all_non_terminal().await?.sessions.len();
                if in_flight == 0 {
                    if pending.is_empty() {
                        break Outcome::Completed;
                    }
                    warn!(
                        remaining = pending.len(),
                        "no task can become ready; scheduling stalled"
                    );
                    break Outcome::Stalled;
                }
                debug!(in_flight, pending = pending.len(), "waiting on in-flight sessions");
                tokio::select! {
                    () = self.cancel.cancelled() => break Outcome::Cancelled,
                    () = tokio::time::sleep(self.settings.backoff) => continue,
                }
            }

            let batch: Vec<Task> = ready.into_iter().take(batch_size).collect();
            let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
            info!(batch = batches.len() + 1, tasks = ?ids, "dispatching batch");

            self.dispatch_batch(&batch).await?;

            let dispatched: HashSet<&str> = ids.iter().map(String::as_str).collect();
            pending.retain(|t| !dispatched.contains(t.id.as_str()));
            batches.push(ids);
        };

        let summary = self.summarize(outcome, &pending, batches).await?;
        info!(
            outcome = ?summary.outcome,
            dispatched = summary.dispatched,
            completed = summary.completed,
            failed = summary.failed,
            error = summary.error,
            never_ready = summary.never_ready,
            "coordination finished"
        );
        Ok(summary)
    }

    async fn dispatch_batch(&self, batch: &[Task]) -> Result<()> {
        let handles = batch.iter().cloned().map(|task| {
            let launcher = self.launcher.clone();
            tokio::spawn(async move { launcher.dispatch(&task).await })
        });
        let results = join_all(handles).await;

        for (task, joined) in batch.iter().zip(results) {
            match joined {
                Ok(Ok(session)) => {
                    debug!(task_id = task.id, session_id = session.session_id, "dispatched");
                }
                Ok(Err(err)) => {
                    warn!(task_id = task.id, %err, "dispatch failed");
                }
                Err(join_err) => {
                    error!(task_id = task.id, %join_err, "dispatch task aborted");
                    self.launcher
                        .record_exception(&task.id, &join_err.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn summarize(
        &self,
        outcome: Outcome,
        pending: &[Task],
        batches: Vec<Vec<String>>,
    ) -> Result<CoordinatorSummary> {
        let mut summary = CoordinatorSummary {
            outcome,
            dispatched: 0,
            completed: 0,
            failed: 0,
            error: 0,
            in_flight: 0,
            never_ready: pending.len(),
            never_ready_ids: pending.iter().map(|t| t.id.clone()).collect(),
            batches: Vec::new(),
        };

        for task_id in batches.iter().flatten() {
            summary.dispatched += 1;
            let latest = self.store.sessions_for(task_id).await?.sessions.pop();
            match latest.map(|s| s.status) {
                Some(SessionStatus::Completed) => summary.completed += 1,
                Some(SessionStatus::Failed) => summary.failed += 1,
                Some(SessionStatus::Starting | SessionStatus::Running) => summary.in_flight += 1,
                Some(SessionStatus::Error | SessionStatus::Exception) | None => summary.error += 1,
            }
        }
        summary.batches = batches;
        Ok(summary)
    }
}
