//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Task directory missing or unusable; fatal to a run.
    Catalog(String),
    /// External executor could not be started or failed unexpectedly.
    Launch(String),
    /// External executor exceeded the hard launch timeout.
    LaunchTimeout(String),
    /// A stored session record could not be decoded.
    CorruptRecord(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Operation would violate the single-flight rule for a task.
    Conflict(String),
    /// Session lifecycle transition is not permitted.
    InvalidTransition(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Catalog(msg) => write!(f, "catalog: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::LaunchTimeout(msg) => write!(f, "launch timeout: {msg}"),
            Self::CorruptRecord(msg) => write!(f, "corrupt record: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
