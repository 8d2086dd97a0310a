//! `SQLite` schema bootstrap logic.
//!
//! Uses `CREATE TABLE IF NOT EXISTS`, so it runs on every startup.
//! Column names match the `Session` field names and are stable across
//! versions. Status values are not constrained at the SQL level; rows with
//! unknown values surface as corrupt records on read.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the session table definition to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    session_id          TEXT PRIMARY KEY NOT NULL,
    task_id             TEXT NOT NULL,
    content_fingerprint TEXT NOT NULL,
    status              TEXT NOT NULL,
    started_at          TEXT NOT NULL,
    external_ref        TEXT,
    output_excerpt      TEXT
);

CREATE INDEX IF NOT EXISTS idx_session_task ON session(task_id);
CREATE INDEX IF NOT EXISTS idx_session_status ON session(status);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
