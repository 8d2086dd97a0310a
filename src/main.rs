#![forbid(unsafe_code)]

//! Command-line entry point for `story-dispatch`.
//!
//! Loads configuration and the task catalog, then runs one subcommand.
//! Results are printed to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use story_dispatch::catalog::{self, Catalog};
use story_dispatch::config::GlobalConfig;
use story_dispatch::executor::CommandExecutor;
use story_dispatch::orchestrator::coordinator::{BatchSettings, Coordinator, Outcome};
use story_dispatch::orchestrator::launcher::{LaunchSettings, Launcher};
use story_dispatch::orchestrator::monitor::Monitor;
use story_dispatch::orchestrator::readiness;
use story_dispatch::persistence::session_store::SessionStore;
use story_dispatch::persistence::{db, retention};
use story_dispatch::{AppError, Result};

/// Exit code reported when coordination stalls.
const EXIT_STALLED: u8 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "story-dispatch", about = "Dependency-aware agent session dispatcher", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List tasks, parse warnings and the currently ready set.
    Discover,
    /// Dispatch a single task.
    Dispatch {
        /// Task identifier as reported by `discover`.
        task_id: String,
    },
    /// Dispatch tasks in dependency order until done or stalled.
    Coordinate {
        /// Restrict the run to this task; repeat for several. Defaults to the whole catalog.
        #[arg(long = "task")]
        tasks: Vec<String>,
    },
    /// Report the recorded state of one task.
    Status {
        /// Task identifier as reported by `discover`.
        task_id: String,
    },
    /// Run the executor preflight command and report whether it works.
    Check,
    /// Poll in-flight sessions until they finish or the timeout elapses.
    Monitor {
        /// Session to watch; repeat for several. Defaults to all in-flight sessions.
        #[arg(long = "session")]
        sessions: Vec<String>,
        /// Override `monitor.timeout_seconds`.
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },
    /// Print every stored session plus undecodable records.
    List,
    /// Delete sessions older than the retention window.
    Sweep {
        /// Override `retention.max_age_days`.
        #[arg(long)]
        days: Option<u32>,
    },
}

/// Components shared by every subcommand.
struct Runtime {
    config: GlobalConfig,
    store: SessionStore,
    executor: Arc<CommandExecutor>,
}

impl Runtime {
    async fn open(config: GlobalConfig) -> Result<Self> {
        let db = Arc::new(db::connect(&config.db_path).await?);
        info!(db_path = %config.db_path.display(), "session store opened");
        let executor = Arc::new(CommandExecutor::new(config.executor.clone()));
        Ok(Self {
            store: SessionStore::new(db),
            executor,
            config,
        })
    }

    fn catalog(&self) -> Result<Catalog> {
        catalog::load(&self.config.tasks_dir, &self.config.catalog)
    }

    fn launcher(&self) -> Launcher {
        Launcher::new(
            self.store.clone(),
            self.executor.clone(),
            LaunchSettings::from_config(&self.config),
        )
    }

    fn monitor(&self) -> Monitor {
        Monitor::new(
            self.store.clone(),
            self.executor.clone(),
            self.config.poll_interval(),
        )
        .with_starting_deadline(self.config.starting_deadline())
    }
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<ExitCode> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(config = %args.config.display(), "configuration loaded");
    let rt = Runtime::open(config).await?;

    match args.command {
        Command::Discover => discover(&rt).await,
        Command::Dispatch { task_id } => dispatch(&rt, &task_id).await,
        Command::Coordinate { tasks } => coordinate(&rt, &tasks).await,
        Command::Status { task_id } => {
            let report = readiness::task_progress(&task_id, &rt.store).await?;
            emit(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let report = rt.executor.check().await;
            emit(&report)?;
            Ok(if report.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Monitor {
            sessions,
            timeout_seconds,
        } => {
            let timeout = timeout_seconds.map_or_else(|| rt.config.monitor_timeout(), Duration::from_secs);
            let ids = (!sessions.is_empty()).then_some(sessions.as_slice());

            let cancel = CancellationToken::new();
            let signal = spawn_signal_watcher(cancel.clone());
            let summary = rt.monitor().with_cancellation(cancel).watch(ids, timeout).await?;
            signal.abort();

            emit(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let scan = rt.store.scan().await?;
            emit(&scan)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { days } => {
            let max_age = days.map_or_else(
                || rt.config.retention_max_age(),
                |d| chrono::Duration::days(i64::from(d)),
            );
            let removed = retention::sweep(&rt.store, max_age).await?;
            emit(&json!({ "removed": removed }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn discover(rt: &Runtime) -> Result<ExitCode> {
    let catalog = rt.catalog()?;
    let ready: Vec<String> = readiness::ready(&catalog.tasks, &rt.store)
        .await?
        .into_iter()
        .map(|task| task.id)
        .collect();

    emit(&json!({
        "tasks": catalog.tasks,
        "warnings": catalog.warnings,
        "ready": ready,
    }))?;
    Ok(ExitCode::SUCCESS)
}

async fn dispatch(rt: &Runtime, task_id: &str) -> Result<ExitCode> {
    let catalog = rt.catalog()?;
    let task = catalog
        .get(task_id)
        .ok_or_else(|| AppError::NotFound(format!("task {task_id} not in catalog")))?;

    // Clears abandoned `starting` sessions that would otherwise block the task.
    rt.monitor().refresh().await?;
    let session = rt.launcher().dispatch(task).await?;
    emit(&session)?;
    Ok(ExitCode::SUCCESS)
}

async fn coordinate(rt: &Runtime, selected: &[String]) -> Result<ExitCode> {
    let tasks = rt.catalog()?.select(selected)?;

    let ct = CancellationToken::new();
    let retention_handle = retention::spawn_retention_task(
        rt.store.clone(),
        rt.config.retention_max_age(),
        ct.clone(),
    );
    let signal = spawn_signal_watcher(ct.clone());

    let coordinator = Coordinator::new(
        rt.store.clone(),
        rt.launcher(),
        rt.monitor().with_cancellation(ct.clone()),
        BatchSettings::from(&rt.config.scheduler),
    )
    .with_cancellation(ct.clone());

    let result = coordinator.run(tasks).await;

    ct.cancel();
    signal.abort();
    if let Err(err) = retention_handle.await {
        error!(%err, "retention task ended abnormally");
    }

    let summary = result?;
    emit(&summary)?;
    Ok(match summary.outcome {
        Outcome::Stalled => ExitCode::from(EXIT_STALLED),
        Outcome::Completed | Outcome::Cancelled => ExitCode::SUCCESS,
    })
}

/// Cancel `ct` on Ctrl-C or SIGTERM.
fn spawn_signal_watcher(ct: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        ct.cancel();
    })
}

fn emit<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Io(format!("failed to encode output: {err}")))?;
    println!("{text}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
