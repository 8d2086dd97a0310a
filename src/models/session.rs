//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::AppError;

/// Lifecycle status for one dispatch attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Claimed by the launcher; executor not yet reported back.
    Starting,
    /// Executor accepted the work and is running detached.
    Running,
    /// Executor finished successfully.
    Completed,
    /// Executor exited with a non-zero code.
    Failed,
    /// Executor could not be started or timed out.
    Error,
    /// Dispatch itself crashed before a result was recorded.
    Exception,
}

impl SessionStatus {
    /// All statuses in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Starting,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Error,
        Self::Exception,
    ];

    /// Stable storage and wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Exception => "exception",
        }
    }

    /// Whether no further transition can occur from this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Starting | Self::Running)
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::CorruptRecord(format!("unknown session status: {s}")))
    }
}

/// One dispatch attempt of a task to the external executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub session_id: String,
    /// Task this attempt belongs to.
    pub task_id: String,
    /// SHA-256 hex digest of the task content at dispatch time.
    pub content_fingerprint: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Dispatch timestamp.
    pub started_at: DateTime<Utc>,
    /// Opaque handle reported by the executor, if any.
    pub external_ref: Option<String>,
    /// Bounded diagnostic output captured from the executor.
    pub output_excerpt: Option<String>,
}

impl Session {
    /// Construct a `starting` session with an identifier derived from the
    /// task, its fingerprint and the dispatch time.
    #[must_use]
    pub fn new(prefix: &str, task_id: &str, content_fingerprint: &str) -> Self {
        // Stored timestamps carry microseconds.
        let started_at = Utc::now().trunc_subsecs(6);
        Self {
            session_id: derive_session_id(prefix, task_id, content_fingerprint, started_at),
            task_id: task_id.to_owned(),
            content_fingerprint: content_fingerprint.to_owned(),
            status: SessionStatus::Starting,
            started_at,
            external_ref: None,
            output_excerpt: None,
        }
    }

    /// Whether the session is still in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self.status, next) {
            (SessionStatus::Starting, next) => next != SessionStatus::Starting,
            (SessionStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Build `{prefix}-{task}-{fingerprint8}-{millis}`.
#[must_use]
pub fn derive_session_id(
    prefix: &str,
    task_id: &str,
    content_fingerprint: &str,
    at: DateTime<Utc>,
) -> String {
    let short: String = content_fingerprint.chars().take(8).collect();
    format!(
        "{prefix}-{}-{short}-{}",
        task_id.replace('.', "-"),
        at.timestamp_millis()
    )
}

/// Truncate `text` to at most `max_chars` characters.
#[must_use]
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
