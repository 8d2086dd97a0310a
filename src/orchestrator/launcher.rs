//! Session launcher.
//!
//! Dispatches one task to the executor and records the attempt as a
//! session. Re-dispatching a task whose in-flight session has the same
//! content fingerprint returns that session without touching the executor.
//! Every path that gets past reading the task persists a session record
//! before returning.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::executor::{output, DispatchMode, ExecOutput, Executor, LaunchRequest};
use crate::models::session::{excerpt, Session, SessionStatus};
use crate::models::task::Task;
use crate::persistence::session_store::{Claim, SessionStore};
use crate::{AppError, Result};

const CLAIM_ATTEMPTS: u32 = 5;

/// Launch parameters taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    /// Prefix for generated session identifiers.
    pub session_prefix: String,
    /// Wait behaviour passed to the executor.
    pub mode: DispatchMode,
    /// Hard upper bound on one executor call.
    pub hard_timeout: Duration,
    /// Maximum characters kept in `output_excerpt`.
    pub excerpt_chars: usize,
}

impl LaunchSettings {
    /// Build settings from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            session_prefix: config.session_prefix.clone(),
            mode: config.executor.mode,
            hard_timeout: config.executor.launch_timeout(),
            excerpt_chars: config.executor.output_excerpt_chars,
        }
    }
}

/// Dispatches tasks through an [`Executor`] and records sessions.
#[derive(Clone)]
pub struct Launcher {
    store: SessionStore,
    executor: Arc<dyn Executor>,
    settings: LaunchSettings,
}

impl Launcher {
    /// Create a launcher.
    #[must_use]
    pub fn new(store: SessionStore, executor: Arc<dyn Executor>, settings: LaunchSettings) -> Self {
        Self {
            store,
            executor,
            settings,
        }
    }

    /// Dispatch `task`, returning the session that now represents it.
    ///
    /// # Errors
    ///
    /// - `AppError::Conflict` if the task already has an in-flight session
    ///   for different content.
    /// - `AppError::LaunchTimeout` if the executor overran the hard timeout
    ///   (an `error` session is recorded).
    /// - `AppError::Launch` if the task could not be read or the executor
    ///   could not be started (an `error` session is recorded).
    /// - `AppError::Db` if the store cannot be written.
    pub async fn dispatch(&self, task: &Task) -> Result<Session> {
        let span = info_span!("dispatch", task_id = task.id);
        self.dispatch_inner(task).instrument(span).await
    }

    async fn dispatch_inner(&self, task: &Task) -> Result<Session> {
        let content = match tokio::fs::read_to_string(&task.source_path).await {
            Ok(content) => content,
            Err(err) => {
                let message = format!("cannot read {}: {err}", task.source_path.display());
                self.record_failure(&task.id, "", SessionStatus::Error, &message)
                    .await?;
                return Err(AppError::Launch(message));
            }
        };

        let fingerprint = fingerprint(&content);

        let session = match self.claim(&task.id, &fingerprint).await? {
            Claim::Existing(existing) if existing.content_fingerprint == fingerprint => {
                info!(
                    session_id = existing.session_id,
                    "in-flight session found for unchanged content"
                );
                return Ok(existing);
            }
            Claim::Existing(existing) => {
                return Err(AppError::Conflict(format!(
                    "task {} already has in-flight session {} for different content",
                    task.id, existing.session_id
                )));
            }
            Claim::Claimed(session) => session,
        };

        let request = LaunchRequest {
            session_id: session.session_id.clone(),
            task_id: task.id.clone(),
            context: content,
            mode: self.settings.mode,
        };

        let launched =
            tokio::time::timeout(self.settings.hard_timeout, self.executor.launch(request)).await;

        let (recorded, failure) = match launched {
            Ok(Ok(output)) => (self.apply_output(session, &output), None),
            Ok(Err(AppError::LaunchTimeout(message))) => {
                let err = AppError::LaunchTimeout(message);
                (self.mark_error(session, &err), Some(err))
            }
            Err(_elapsed) => {
                let err = AppError::LaunchTimeout(format!(
                    "executor did not return within {:?}",
                    self.settings.hard_timeout
                ));
                (self.mark_error(session, &err), Some(err))
            }
            Ok(Err(other)) => {
                let err = AppError::Launch(other.to_string());
                (self.mark_error(session, &err), Some(err))
            }
        };

        self.store.put(&recorded).await?;

        match failure {
            Some(err) => {
                warn!(session_id = recorded.session_id, %err, "dispatch failed");
                Err(err)
            }
            None => {
                info!(
                    session_id = recorded.session_id,
                    status = %recorded.status,
                    external_ref = recorded.external_ref.as_deref().unwrap_or("unknown"),
                    "task dispatched"
                );
                Ok(recorded)
            }
        }
    }

    /// Claim a fresh session for the task. Ids carry a millisecond timestamp,
    /// so a re-dispatch inside the same millisecond as an earlier attempt
    /// waits and derives a new one.
    async fn claim(&self, task_id: &str, fingerprint: &str) -> Result<Claim> {
        let mut attempt = 1;
        loop {
            let candidate = Session::new(&self.settings.session_prefix, task_id, fingerprint);
            match self.store.claim(&candidate).await {
                Err(AppError::Conflict(msg)) if attempt < CLAIM_ATTEMPTS => {
                    debug!(msg, attempt, "session id collision, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                other => return other,
            }
        }
    }

    /// Record that a dispatch of `task_id` crashed.
    ///
    /// A `starting` session left behind by the crashed dispatch is moved to
    /// `exception`; otherwise a new `exception` session is written.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read or written.
    pub async fn record_exception(&self, task_id: &str, message: &str) -> Result<Session> {
        let orphan = self
            .store
            .sessions_for(task_id)
            .await?
            .sessions
            .into_iter()
            .rev()
            .find(|s| s.status == SessionStatus::Starting);

        match orphan {
            Some(mut session) => {
                session.status = SessionStatus::Exception;
                session.output_excerpt = Some(excerpt(message, self.settings.excerpt_chars));
                self.store.put(&session).await?;
                Ok(session)
            }
            None => {
                self.record_failure(task_id, "", SessionStatus::Exception, message)
                    .await
            }
        }
    }

    async fn record_failure(
        &self,
        task_id: &str,
        fingerprint: &str,
        status: SessionStatus,
        message: &str,
    ) -> Result<Session> {
        let mut session = Session::new(&self.settings.session_prefix, task_id, fingerprint);
        session.status = status;
        session.output_excerpt = Some(excerpt(message, self.settings.excerpt_chars));
        self.store.put(&session).await?;
        Ok(session)
    }

    fn apply_output(&self, mut session: Session, output: &ExecOutput) -> Session {
        session.status = match (self.settings.mode, output.detached, output.succeeded()) {
            (_, true, _) | (DispatchMode::Async, false, true) => SessionStatus::Running,
            (DispatchMode::Sync, false, true) => SessionStatus::Completed,
            (_, false, false) => SessionStatus::Failed,
        };
        session.external_ref = output::external_ref(&output.stdout);

        let mut text = output.stdout.clone();
        if !output.stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&output.stderr);
        }
        session.output_excerpt =
            (!text.is_empty()).then(|| excerpt(&text, self.settings.excerpt_chars));
        session
    }

    fn mark_error(&self, mut session: Session, err: &AppError) -> Session {
        session.status = SessionStatus::Error;
        session.output_excerpt = Some(excerpt(&err.to_string(), self.settings.excerpt_chars));
        session
    }
}

/// SHA-256 hex digest of task content.
#[must_use]
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
