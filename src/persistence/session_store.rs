//! Session store backed by `SQLite`.
//!
//! All writes go through an internal lock plus a single statement or
//! transaction, so callers only ever observe whole records. Rows that fail
//! to decode are reported as [`CorruptRecord`] diagnostics and excluded from
//! results rather than failing the read.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;

const COLUMNS: &str =
    "session_id, task_id, content_fingerprint, status, started_at, external_ref, output_excerpt";

const NON_TERMINAL_FILTER: &str =
    "status NOT IN ('completed', 'failed', 'error', 'exception')";

/// A stored row that could not be decoded into a [`Session`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CorruptRecord {
    /// Key of the offending row.
    pub session_id: String,
    /// Decode failure detail.
    pub reason: String,
}

/// Sessions read from the store plus any rows that failed to decode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionScan {
    /// Successfully decoded sessions, oldest first.
    pub sessions: Vec<Session>,
    /// Rows excluded because they could not be decoded.
    pub corrupt: Vec<CorruptRecord>,
}

/// Outcome of [`SessionStore::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The new session was inserted.
    Claimed(Session),
    /// A non-terminal session already existed for the task.
    Existing(Session),
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    task_id: String,
    content_fingerprint: String,
    status: String,
    started_at: String,
    external_ref: Option<String>,
    output_excerpt: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let status = self.status.parse::<SessionStatus>()?;
        let started_at = chrono::DateTime::parse_from_rfc3339(&self.started_at)
            .map_err(|e| AppError::CorruptRecord(format!("invalid started_at: {e}")))?
            .with_timezone(&Utc);

        if self.task_id.is_empty() {
            return Err(AppError::CorruptRecord("empty task_id".into()));
        }

        Ok(Session {
            session_id: self.session_id,
            task_id: self.task_id,
            content_fingerprint: self.content_fingerprint,
            status,
            started_at,
            external_ref: self.external_ref,
            output_excerpt: self.output_excerpt,
        })
    }
}

fn timestamp(session: &Session) -> String {
    session
        .started_at
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_all(rows: Vec<SessionRow>) -> SessionScan {
    let mut scan = SessionScan::default();
    for row in rows {
        let session_id = row.session_id.clone();
        match row.into_session() {
            Ok(session) => scan.sessions.push(session),
            Err(err) => {
                warn!(session_id, %err, "excluding corrupt session record");
                scan.corrupt.push(CorruptRecord {
                    session_id,
                    reason: err.to_string(),
                });
            }
        }
    }
    scan
}

/// Durable mapping of `session_id` to [`Session`].
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Database>,
    write_lock: Arc<Mutex<()>>,
}

impl SessionStore {
    /// Create a new store over an open database.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Insert or overwrite a session by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn put(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO session (session_id, task_id, content_fingerprint, status, started_at, external_ref, output_excerpt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(session_id) DO UPDATE SET
                task_id = excluded.task_id,
                content_fingerprint = excluded.content_fingerprint,
                status = excluded.status,
                started_at = excluded.started_at,
                external_ref = excluded.external_ref,
                output_excerpt = excluded.output_excerpt",
        )
        .bind(&session.session_id)
        .bind(&session.task_id)
        .bind(&session.content_fingerprint)
        .bind(session.status.as_str())
        .bind(timestamp(session))
        .bind(&session.external_ref)
        .bind(&session.output_excerpt)
        .execute(self.db.as_ref())
        .await?;

        debug!(session_id = session.session_id, status = %session.status, "session stored");
        Ok(())
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorruptRecord` if the row exists but cannot be
    /// decoded, or `AppError::Db` if the query fails.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM session WHERE session_id = ?1"
        ))
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Remove a session; deleting a missing id is a no-op.
    ///
    /// Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM session WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Read every record in the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn scan(&self) -> Result<SessionScan> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM session ORDER BY started_at ASC, session_id ASC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(decode_all(rows))
    }

    /// All sessions recorded for one task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn sessions_for(&self, task_id: &str) -> Result<SessionScan> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM session WHERE task_id = ?1 \
             ORDER BY started_at ASC, session_id ASC"
        ))
        .bind(task_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(decode_all(rows))
    }

    /// All sessions still `starting` or `running`.
    ///
    /// Rows with unrecognised status values match this query and are
    /// reported as corrupt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn all_non_terminal(&self) -> Result<SessionScan> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM session WHERE {NON_TERMINAL_FILTER} \
             ORDER BY started_at ASC, session_id ASC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(decode_all(rows))
    }

    /// Insert `session` unless the task already has a non-terminal session.
    ///
    /// The check and the insert run under the store's write lock inside one
    /// transaction, which is what enforces single-flight per task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if `session.session_id` is already
    /// stored, or `AppError::Db` if the transaction fails.
    pub async fn claim(&self, session: &Session) -> Result<Claim> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;

        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM session WHERE task_id = ?1 AND {NON_TERMINAL_FILTER} \
             ORDER BY started_at DESC"
        ))
        .bind(&session.task_id)
        .fetch_all(&mut *tx)
        .await?;

        let live = rows
            .into_iter()
            .filter_map(|row| row.into_session().ok())
            .find(Session::is_active);

        if let Some(existing) = live {
            tx.commit().await?;
            return Ok(Claim::Existing(existing));
        }

        let taken: Option<(String,)> =
            sqlx::query_as("SELECT session_id FROM session WHERE session_id = ?1")
                .bind(&session.session_id)
                .fetch_optional(&mut *tx)
                .await?;
        if taken.is_some() {
            tx.rollback().await?;
            return Err(AppError::Conflict(format!(
                "session id {} already recorded",
                session.session_id
            )));
        }

        sqlx::query(
            "INSERT INTO session (session_id, task_id, content_fingerprint, status, started_at, external_ref, output_excerpt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&session.session_id)
        .bind(&session.task_id)
        .bind(&session.content_fingerprint)
        .bind(session.status.as_str())
        .bind(timestamp(session))
        .bind(&session.external_ref)
        .bind(&session.output_excerpt)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Claim::Claimed(session.clone()))
    }

    /// Move a session to `next`, respecting the lifecycle state machine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist,
    /// `AppError::InvalidTransition` if the move is not permitted (terminal
    /// sessions are immutable), or `AppError::Db` on persistence failure.
    pub async fn transition(&self, session_id: &str, next: SessionStatus) -> Result<Session> {
        let mut current = self
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

        if !current.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "session {session_id} cannot move from {} to {next}",
                current.status
            )));
        }

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE session SET status = ?1 WHERE session_id = ?2 AND status = ?3")
            .bind(next.as_str())
            .bind(session_id)
            .bind(current.status.as_str())
            .execute(self.db.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidTransition(format!(
                "session {session_id} changed concurrently"
            )));
        }

        current.status = next;
        Ok(current)
    }
}
