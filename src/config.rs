//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::executor::DispatchMode;
use crate::{AppError, Result};

/// Slack added to the launch timeout before a `starting` session is abandoned.
const STARTING_MARGIN: Duration = Duration::from_secs(60);

/// Task discovery settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CatalogConfig {
    /// Glob pattern matched against file names inside `tasks_dir`.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Treat dependencies on ids missing from the catalog as a load error.
    #[serde(default)]
    pub strict_dependencies: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            strict_dependencies: false,
        }
    }
}

fn default_pattern() -> String {
    "*.md".into()
}

/// External executor invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Executor binary (e.g., `depot`).
    pub host_cli: String,
    /// Arguments placed before the task context.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Whether the launcher waits for completion or only a grace period.
    #[serde(default)]
    pub mode: DispatchMode,
    /// Hard timeout for one executor call.
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_seconds: u64,
    /// Initial window in async mode during which output is read.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    /// Optional binary queried for live status of a running session.
    #[serde(default)]
    pub status_cli: Option<String>,
    /// Arguments for `status_cli`; `{session_id}` and `{external_ref}` are substituted.
    #[serde(default)]
    pub status_cli_args: Vec<String>,
    /// Timeout for one status query.
    #[serde(default = "default_status_timeout")]
    pub status_timeout_seconds: u64,
    /// Maximum characters of executor output kept on the session.
    #[serde(default = "default_output_excerpt_chars")]
    pub output_excerpt_chars: usize,
    /// Directory for async launch logs; defaults to `logs/` beside `db_path`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Arguments for the preflight run of `host_cli`.
    #[serde(default = "default_check_args")]
    pub check_args: Vec<String>,
}

fn default_launch_timeout() -> u64 {
    1800
}

fn default_grace_period() -> u64 {
    5
}

fn default_status_timeout() -> u64 {
    10
}

fn default_output_excerpt_chars() -> usize {
    1000
}

fn default_check_args() -> Vec<String> {
    vec!["--version".into()]
}

impl ExecutorConfig {
    /// Hard launch timeout as a [`Duration`].
    #[must_use]
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_seconds)
    }

    /// Async grace period as a [`Duration`].
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    /// Status query timeout as a [`Duration`].
    #[must_use]
    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_seconds)
    }
}

/// Coordinator loop settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Maximum dispatches in flight per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sleep between readiness checks while sessions are outstanding.
    #[serde(default = "default_backoff")]
    pub backoff_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            backoff_seconds: default_backoff(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}

fn default_backoff() -> u64 {
    30
}

impl SchedulerConfig {
    /// Sleep between readiness checks as a [`Duration`].
    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds)
    }
}

/// Monitor polling settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    /// Interval between status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// How long `watch` runs before reporting the remainder as timed out.
    #[serde(default = "default_monitor_timeout")]
    pub timeout_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            timeout_seconds: default_monitor_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_monitor_timeout() -> u64 {
    3600
}

/// Retention settings for the sweeper.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetentionConfig {
    /// Sessions started longer ago than this are deleted.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

fn default_max_age_days() -> u32 {
    7
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".dispatch/sessions.db")
}

fn default_session_prefix() -> String {
    "dispatch".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding task definition files.
    pub tasks_dir: PathBuf,
    /// `SQLite` file backing the session store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Prefix for generated session identifiers.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Task discovery settings.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Executor invocation settings.
    pub executor: ExecutorConfig,
    /// Coordinator loop settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Monitor polling settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Retention settings.
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// Relative `tasks_dir` and `db_path` values are resolved against the
    /// directory containing the config file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config = Self::from_toml_str(&raw)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        if config.executor.log_dir.is_none() {
            let base = config.db_path.parent().unwrap_or_else(|| Path::new(""));
            config.executor.log_dir = Some(base.join("logs"));
        }
        config.validate()?;
        Ok(config)
    }

    /// Age after which a `starting` session is treated as abandoned.
    ///
    /// A live launcher always resolves its session within the hard launch
    /// timeout, so anything older was left behind by a crashed dispatcher.
    #[must_use]
    pub fn starting_deadline(&self) -> Duration {
        self.executor.launch_timeout() + STARTING_MARGIN
    }

    /// Interval between monitor polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_seconds)
    }

    /// Default monitor watch timeout.
    #[must_use]
    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.timeout_seconds)
    }

    /// Retention window as a `chrono` duration.
    #[must_use]
    pub fn retention_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention.max_age_days))
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.tasks_dir.is_relative() {
            self.tasks_dir = base.join(&self.tasks_dir);
        }
        if self.db_path.is_relative() {
            self.db_path = base.join(&self.db_path);
        }
        if let Some(log_dir) = self.executor.log_dir.as_mut() {
            if log_dir.is_relative() {
                *log_dir = base.join(&*log_dir);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.batch_size == 0 {
            return Err(AppError::Config(
                "scheduler.batch_size must be greater than zero".into(),
            ));
        }

        if self.executor.host_cli.trim().is_empty() {
            return Err(AppError::Config("executor.host_cli must not be empty".into()));
        }

        if self.monitor.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "monitor.poll_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.session_prefix.is_empty() {
            return Err(AppError::Config("session_prefix must not be empty".into()));
        }

        Ok(())
    }
}
