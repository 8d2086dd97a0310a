//! External executor abstraction.
//!
//! The [`Executor`] trait is the only seam between the scheduler and the
//! environment that actually runs an agent. The launcher hands it a
//! [`LaunchRequest`] and gets back an [`ExecOutput`]; the monitor asks it
//! for live status of sessions it previously launched.

pub mod command;
pub mod output;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::models::session::{Session, SessionStatus};
use crate::Result;

pub use command::CommandExecutor;

/// Whether a launch waits for completion or only an initial grace period.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Wait for the executor to finish.
    Sync,
    /// Wait a short grace period, then leave the process running detached.
    #[default]
    Async,
}

impl DispatchMode {
    /// Stable wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// Everything the executor needs to start one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Session the launch belongs to.
    pub session_id: String,
    /// Task being dispatched.
    pub task_id: String,
    /// Full task definition text.
    pub context: String,
    /// Wait behaviour.
    pub mode: DispatchMode,
}

/// What the executor reported for one launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code; `None` while detached or when killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output (possibly partial when detached).
    pub stdout: String,
    /// Captured standard error (possibly partial when detached).
    pub stderr: String,
    /// The process was still running when the launch returned.
    pub detached: bool,
}

impl ExecOutput {
    /// Output of a process that finished with `exit_code`.
    #[must_use]
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            detached: false,
        }
    }

    /// Output of a process still running after the grace period.
    #[must_use]
    pub fn detached(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            detached: true,
        }
    }

    /// Whether the process finished with exit code zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Boxed future returned by [`Executor`] methods.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Interface to the environment that runs agents.
pub trait Executor: Send + Sync {
    /// Start the agent for one session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Launch`](crate::AppError::Launch) if the process
    /// cannot be started, or
    /// [`AppError::LaunchTimeout`](crate::AppError::LaunchTimeout) if the
    /// executor enforces its own hard timeout and it elapses.
    fn launch(&self, request: LaunchRequest) -> ExecFuture<'_, ExecOutput>;

    /// Report live status for a non-terminal session.
    ///
    /// Returns `Ok(None)` when the executor cannot tell or the session is
    /// still running.
    ///
    /// # Errors
    ///
    /// Returns an error only when the status query itself fails in a way the
    /// caller should log.
    fn probe<'a>(&'a self, session: &'a Session) -> ExecFuture<'a, Option<SessionStatus>>;
}
