//! Readiness resolution.
//!
//! A task is ready when every dependency has at least one `completed`
//! session and the task itself has no `starting`/`running` session.
//! Dependencies with no sessions at all (including ids missing from the
//! catalog) keep the task unready.
//!
//! [`progress`] applies the same rules to a single task for status queries.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::session::{Session, SessionStatus};
use crate::models::task::Task;
use crate::persistence::session_store::{CorruptRecord, SessionStore};
use crate::Result;

/// Where a task stands across all of its sessions.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No session was ever recorded.
    NotStarted,
    /// A `starting` or `running` session exists.
    InFlight,
    /// At least one session completed; dependents are released.
    Completed,
    /// Every session ended without completing.
    Unsuccessful,
}

/// Status report for one task.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskProgress {
    /// Task the report covers.
    pub task_id: String,
    /// Aggregate state.
    pub state: TaskState,
    /// Most recently started session, if any.
    pub latest: Option<Session>,
    /// Number of recorded sessions.
    pub attempts: usize,
    /// Records for the task that could not be decoded.
    pub corrupt: Vec<CorruptRecord>,
}

/// Tasks from `tasks` that may be dispatched given `sessions`, ordered by
/// `(priority, id)`.
#[must_use]
pub fn compute_ready(tasks: &[Task], sessions: &[Session]) -> Vec<Task> {
    let completed: HashSet<&str> = sessions
        .iter()
        .filter(|s| s.status == SessionStatus::Completed)
        .map(|s| s.task_id.as_str())
        .collect();
    let in_flight: HashSet<&str> = sessions
        .iter()
        .filter(|s| s.is_active())
        .map(|s| s.task_id.as_str())
        .collect();

    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|task| !in_flight.contains(task.id.as_str()))
        .filter(|task| {
            task.dependencies
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
        })
        .cloned()
        .collect();

    ready.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    ready
}

/// Read the store and compute the ready subset of `tasks`.
///
/// Corrupt records are excluded (and logged by the store).
///
/// # Errors
///
/// Returns `AppError::Db` if the store cannot be read.
pub async fn ready(tasks: &[Task], store: &SessionStore) -> Result<Vec<Task>> {
    let scan = store.scan().await?;
    Ok(compute_ready(tasks, &scan.sessions))
}

/// Summarize `sessions` of `task_id`; sessions of other tasks are ignored.
#[must_use]
pub fn progress(task_id: &str, sessions: &[Session]) -> TaskProgress {
    let own: Vec<&Session> = sessions.iter().filter(|s| s.task_id == task_id).collect();

    let state = if own.iter().any(|s| s.status == SessionStatus::Completed) {
        TaskState::Completed
    } else if own.iter().any(|s| s.is_active()) {
        TaskState::InFlight
    } else if own.is_empty() {
        TaskState::NotStarted
    } else {
        TaskState::Unsuccessful
    };

    TaskProgress {
        task_id: task_id.to_owned(),
        state,
        latest: own.iter().max_by_key(|s| s.started_at).map(|s| (*s).clone()),
        attempts: own.len(),
        corrupt: Vec::new(),
    }
}

/// Read the sessions of `task_id` from the store and summarize them.
///
/// # Errors
///
/// Returns `AppError::Db` if the store cannot be read.
pub async fn task_progress(task_id: &str, store: &SessionStore) -> Result<TaskProgress> {
    let scan = store.sessions_for(task_id).await?;
    let mut report = progress(task_id, &scan.sessions);
    report.corrupt = scan.corrupt;
    Ok(report)
}
