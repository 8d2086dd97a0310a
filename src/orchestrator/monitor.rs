//! Session monitor.
//!
//! Polls the executor for every non-terminal session and records terminal
//! transitions in the store. [`Monitor::refresh`] runs a single pass;
//! [`Monitor::watch`] polls a set of sessions until they all finish or the
//! timeout elapses. A timeout is reported in the summary and leaves the
//! stored sessions untouched.
//!
//! `starting` sessions belong to their launcher. One that outlives the
//! configured starting deadline has lost its launcher and is closed out as
//! `exception` so it stops holding the task's single-flight slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::executor::Executor;
use crate::models::session::{Session, SessionStatus};
use crate::persistence::session_store::{CorruptRecord, SessionStore};
use crate::{AppError, Result};

/// Outcome of a [`Monitor::watch`] call.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Number of session ids watched.
    pub watched: usize,
    /// Sessions that ended `completed`.
    pub completed: usize,
    /// Sessions that ended `failed`.
    pub failed: usize,
    /// Sessions that ended `error` or `exception`.
    pub error: usize,
    /// Sessions still non-terminal when the watch stopped.
    pub timed_out: Vec<String>,
    /// Requested ids with no stored session.
    pub missing: Vec<String>,
    /// Requested ids whose stored record could not be decoded.
    pub corrupt: Vec<CorruptRecord>,
    /// Wall-clock time spent watching.
    pub elapsed_ms: u64,
}

/// Polls executor status for in-flight sessions.
#[derive(Clone)]
pub struct Monitor {
    store: SessionStore,
    executor: Arc<dyn Executor>,
    poll_interval: Duration,
    starting_deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl Monitor {
    /// Create a monitor polling every `poll_interval`.
    #[must_use]
    pub fn new(store: SessionStore, executor: Arc<dyn Executor>, poll_interval: Duration) -> Self {
        Self {
            store,
            executor,
            poll_interval,
            starting_deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop [`watch`](Self::watch) early when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Close out `starting` sessions older than `deadline` as `exception`.
    #[must_use]
    pub fn with_starting_deadline(mut self, deadline: Duration) -> Self {
        self.starting_deadline = Some(deadline);
        self
    }

    /// Probe every `running` session once, close out abandoned `starting`
    /// sessions, and apply terminal transitions.
    ///
    /// Returns the number of sessions that reached a terminal status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn refresh(&self) -> Result<usize> {
        let scan = self.store.all_non_terminal().await?;
        let mut finished = 0;
        for session in &scan.sessions {
            if self.poll(session).await?.status.is_terminal() {
                finished += 1;
            }
        }
        if finished > 0 {
            info!(finished, "monitor pass recorded terminal sessions");
        }
        Ok(finished)
    }

    /// Poll until every session in `session_ids` (or every non-terminal
    /// session, when `None`) is terminal, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn watch(
        &self,
        session_ids: Option<&[String]>,
        timeout: Duration,
    ) -> Result<MonitorSummary> {
        let span = info_span!("monitor", timeout_ms = duration_ms(timeout));
        self.watch_inner(session_ids, timeout).instrument(span).await
    }

    async fn watch_inner(
        &self,
        session_ids: Option<&[String]>,
        timeout: Duration,
    ) -> Result<MonitorSummary> {
        let started = Instant::now();
        let deadline = started + timeout;

        let ids: Vec<String> = match session_ids {
            Some(ids) => ids.to_vec(),
            None => self
                .store
                .all_non_terminal()
                .await?
                .sessions
                .into_iter()
                .map(|s| s.session_id)
                .collect(),
        };
        info!(watched = ids.len(), "watching sessions");

        let mut outstanding;
        loop {
            outstanding = Vec::new();
            for id in &ids {
                let Some(session) = self.load(id).await? else {
                    continue;
                };
                if session.is_active() && self.poll(&session).await?.is_active() {
                    outstanding.push(id.clone());
                }
            }

            if outstanding.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(remaining = outstanding.len(), "monitor timed out");
                break;
            }
            debug!(remaining = outstanding.len(), "sessions still in flight");
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("monitor cancelled");
                    break;
                }
                () = tokio::time::sleep(self.poll_interval.min(deadline - now)) => {}
            }
        }

        let mut summary = MonitorSummary {
            watched: ids.len(),
            timed_out: outstanding,
            ..MonitorSummary::default()
        };
        for id in &ids {
            match self.store.get(id).await {
                Ok(Some(session)) => match session.status {
                    SessionStatus::Completed => summary.completed += 1,
                    SessionStatus::Failed => summary.failed += 1,
                    SessionStatus::Error | SessionStatus::Exception => summary.error += 1,
                    SessionStatus::Starting | SessionStatus::Running => {}
                },
                Ok(None) => summary.missing.push(id.clone()),
                Err(AppError::CorruptRecord(reason)) => summary.corrupt.push(CorruptRecord {
                    session_id: id.clone(),
                    reason,
                }),
                Err(err) => return Err(err),
            }
        }
        summary.elapsed_ms = duration_ms(started.elapsed());
        Ok(summary)
    }

    /// Stored session for `id`, or `None` when it is missing or corrupt.
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        match self.store.get(id).await {
            Ok(session) => Ok(session),
            Err(AppError::CorruptRecord(reason)) => {
                warn!(session_id = id, reason, "skipping corrupt session record");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Probe one session and persist a terminal status if the executor
    /// reports one. `starting` sessions are only touched once abandoned.
    async fn poll(&self, session: &Session) -> Result<Session> {
        match session.status {
            SessionStatus::Running => {}
            SessionStatus::Starting if self.is_abandoned(session) => {
                warn!(
                    session_id = session.session_id,
                    task_id = session.task_id,
                    started_at = %session.started_at,
                    "starting session outlived its launcher"
                );
                return self.finish(session, SessionStatus::Exception).await;
            }
            _ => return Ok(session.clone()),
        }

        let reported = match self.executor.probe(session).await {
            Ok(reported) => reported,
            Err(err) => {
                warn!(session_id = session.session_id, %err, "status probe failed");
                None
            }
        };

        match reported {
            Some(next) if next.is_terminal() => self.finish(session, next).await,
            _ => Ok(session.clone()),
        }
    }

    fn is_abandoned(&self, session: &Session) -> bool {
        let Some(deadline) = self.starting_deadline else {
            return false;
        };
        (Utc::now() - session.started_at)
            .to_std()
            .is_ok_and(|age| age > deadline)
    }

    async fn finish(&self, session: &Session, next: SessionStatus) -> Result<Session> {
        match self.store.transition(&session.session_id, next).await {
            Ok(updated) => {
                info!(
                    session_id = updated.session_id,
                    task_id = updated.task_id,
                    status = %updated.status,
                    "session finished"
                );
                Ok(updated)
            }
            // Someone else moved it first; report what is stored now.
            Err(AppError::InvalidTransition(msg)) => {
                debug!(session_id = session.session_id, msg, "transition lost race");
                Ok(self
                    .load(&session.session_id)
                    .await?
                    .unwrap_or_else(|| session.clone()))
            }
            Err(err) => Err(err),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
