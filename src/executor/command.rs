//! Executor that runs a host CLI as a child process.
//!
//! Each launch runs `host_cli host_cli_args... <task context>` with
//! `DISPATCH_SESSION_ID`, `DISPATCH_TASK_ID` and `DISPATCH_MODE` set in the
//! environment.
//!
//! In sync mode the process output is piped back and the process is awaited
//! up to the hard launch timeout, then killed if it overruns.
//!
//! In async mode the process writes to per-session log files under
//! `executor.log_dir` and runs in its own process group, so it keeps running
//! after the dispatcher exits or is interrupted. It is awaited only for the
//! grace period; a process still running afterwards is moved into the
//! tracked-children registry, where [`Executor::probe`] later reaps its exit
//! status.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{output, DispatchMode, ExecFuture, ExecOutput, Executor, LaunchRequest};
use crate::config::ExecutorConfig;
use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

/// Live detached processes keyed by session ID.
pub type ActiveChildren = Arc<Mutex<HashMap<String, Child>>>;

/// Upper bound on bytes kept per output stream.
const STREAM_CAPTURE_LIMIT: usize = 64 * 1024;

/// How long to wait for output readers after the process has exited.
const READER_DRAIN: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

type SharedBuf = Arc<std::sync::Mutex<Vec<u8>>>;

/// Log files receiving a detached launch's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLogs {
    /// Standard output of the executor process.
    pub stdout: PathBuf,
    /// Standard error of the executor process.
    pub stderr: PathBuf,
}

impl SessionLogs {
    /// Log file locations for `session_id` under `dir`.
    #[must_use]
    pub fn new(dir: &Path, session_id: &str) -> Self {
        Self {
            stdout: dir.join(format!("{session_id}.out.log")),
            stderr: dir.join(format!("{session_id}.err.log")),
        }
    }

    async fn open(&self) -> Result<(Stdio, Stdio)> {
        if let Some(dir) = self.stdout.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|err| {
                AppError::Launch(format!("cannot create log dir {}: {err}", dir.display()))
            })?;
        }
        Ok((open_log(&self.stdout).await?, open_log(&self.stderr).await?))
    }
}

/// Result of [`CommandExecutor::check`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckReport {
    /// Executor binary that was run.
    pub host_cli: String,
    /// The binary ran and exited zero.
    pub ok: bool,
    /// Exit code, when the binary ran to completion.
    pub exit_code: Option<i32>,
    /// First line of output, or the failure reason.
    pub detail: String,
}

/// [`Executor`] backed by a host CLI binary.
#[derive(Clone)]
pub struct CommandExecutor {
    config: ExecutorConfig,
    children: ActiveChildren,
}

impl CommandExecutor {
    /// Create an executor with an empty child registry.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shared registry of detached children.
    #[must_use]
    pub fn children(&self) -> ActiveChildren {
        Arc::clone(&self.children)
    }

    /// Directory receiving async launch logs.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.config
            .log_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("story-dispatch").join("logs"))
    }

    /// Run `host_cli check_args...` once to confirm the executor is usable.
    ///
    /// Never fails: spawn errors and timeouts are reported with `ok: false`.
    pub async fn check(&self) -> CheckReport {
        let mut cmd = Command::new(&self.config.host_cli);
        cmd.args(&self.config.check_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let (exit_code, detail) =
            match tokio::time::timeout(self.config.status_timeout(), cmd.output()).await {
                Ok(Ok(out)) => {
                    let text = if out.stdout.is_empty() { out.stderr } else { out.stdout };
                    let text = String::from_utf8_lossy(&text);
                    (
                        out.status.code(),
                        text.lines().next().unwrap_or_default().trim().to_owned(),
                    )
                }
                Ok(Err(err)) => (None, format!("failed to run {}: {err}", self.config.host_cli)),
                Err(_elapsed) => (
                    None,
                    format!(
                        "no response within {}s",
                        self.config.status_timeout_seconds
                    ),
                ),
            };

        let ok = exit_code == Some(0);
        if ok {
            info!(host_cli = self.config.host_cli, detail, "executor check passed");
        } else {
            warn!(host_cli = self.config.host_cli, ?exit_code, detail, "executor check failed");
        }
        CheckReport {
            host_cli: self.config.host_cli.clone(),
            ok,
            exit_code,
            detail,
        }
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.config.host_cli);
        cmd.args(&self.config.host_cli_args)
            .arg(&request.context)
            .env("DISPATCH_SESSION_ID", &request.session_id)
            .env("DISPATCH_TASK_ID", &request.task_id)
            .env("DISPATCH_MODE", request.mode.as_str())
            .stdin(Stdio::null());
        cmd
    }

    fn spawn(&self, cmd: &mut Command, request: &LaunchRequest) -> Result<Child> {
        let child = cmd.spawn().map_err(|err| {
            AppError::Launch(format!("failed to spawn {}: {err}", self.config.host_cli))
        })?;
        info!(
            session_id = request.session_id,
            pid = child.id().unwrap_or(0),
            host_cli = self.config.host_cli,
            mode = request.mode.as_str(),
            "executor process spawned"
        );
        Ok(child)
    }

    async fn run(&self, request: LaunchRequest) -> Result<ExecOutput> {
        match request.mode {
            DispatchMode::Sync => self.run_sync(&request).await,
            DispatchMode::Async => self.run_async(request).await,
        }
    }

    async fn run_sync(&self, request: &LaunchRequest) -> Result<ExecOutput> {
        let mut cmd = self.command(request);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = self.spawn(&mut cmd, request)?;

        let stdout_buf = SharedBuf::default();
        let stderr_buf = SharedBuf::default();
        let readers = [
            child
                .stdout
                .take()
                .map(|s| spawn_reader(s, Arc::clone(&stdout_buf))),
            child
                .stderr
                .take()
                .map(|s| spawn_reader(s, Arc::clone(&stderr_buf))),
        ];

        let limit = self.config.launch_timeout();
        match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => {
                drain(readers).await;
                Ok(ExecOutput {
                    exit_code: status.code(),
                    stdout: snapshot(&stdout_buf),
                    stderr: snapshot(&stderr_buf),
                    detached: false,
                })
            }
            Ok(Err(err)) => Err(AppError::Launch(format!("failed to wait for executor: {err}"))),
            Err(_elapsed) => {
                warn!(session_id = request.session_id, "executor exceeded launch timeout, killing");
                if let Err(err) = child.kill().await {
                    warn!(session_id = request.session_id, %err, "failed to kill executor process");
                }
                Err(AppError::LaunchTimeout(format!(
                    "executor did not finish within {limit:?}"
                )))
            }
        }
    }

    async fn run_async(&self, request: LaunchRequest) -> Result<ExecOutput> {
        let logs = SessionLogs::new(&self.log_dir(), &request.session_id);
        let (stdout, stderr) = logs.open().await?;

        let mut cmd = self.command(&request);
        cmd.stdout(stdout).stderr(stderr).kill_on_drop(false);
        // Keep terminal interrupts aimed at the dispatcher away from the agent.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = self.spawn(&mut cmd, &request)?;

        let waited = tokio::time::timeout(self.config.grace_period(), child.wait()).await;
        let stdout = read_log(&logs.stdout).await;
        let stderr = read_log(&logs.stderr).await;

        match waited {
            Ok(Ok(status)) => Ok(ExecOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                detached: false,
            }),
            Ok(Err(err)) => Err(AppError::Launch(format!("failed to wait for executor: {err}"))),
            Err(_elapsed) => {
                info!(
                    session_id = request.session_id,
                    log = %logs.stdout.display(),
                    "grace period over, detaching executor"
                );
                self.children
                    .lock()
                    .await
                    .insert(request.session_id.clone(), child);
                Ok(ExecOutput::detached(stdout, stderr))
            }
        }
    }

    async fn reap(&self, session_id: &str) -> Option<SessionStatus> {
        let mut guard = self.children.lock().await;
        let child = guard.get_mut(session_id)?;

        let status = match child.try_wait() {
            Ok(Some(exit)) => {
                info!(session_id, ?exit, "detached executor process exited");
                if exit.success() {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                }
            }
            Ok(None) => return None,
            Err(err) => {
                warn!(session_id, %err, "failed to poll executor process status");
                SessionStatus::Error
            }
        };

        guard.remove(session_id);
        Some(status)
    }

    async fn query_status(&self, session: &Session) -> Option<SessionStatus> {
        let status_cli = self.config.status_cli.as_deref()?;
        let external_ref = session.external_ref.as_deref()?;

        let args = self.config.status_cli_args.iter().map(|arg| {
            arg.replace("{session_id}", &session.session_id)
                .replace("{external_ref}", external_ref)
        });

        let mut cmd = Command::new(status_cli);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let result = tokio::time::timeout(self.config.status_timeout(), cmd.output()).await;
        match result {
            Ok(Ok(out)) => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                output::status(&stdout).or_else(|| {
                    out.status.success().then_some(SessionStatus::Completed)
                })
            }
            Ok(Err(err)) => {
                warn!(session_id = session.session_id, %err, "status query failed to run");
                None
            }
            Err(_elapsed) => {
                debug!(session_id = session.session_id, "status query timed out; still running");
                None
            }
        }
    }
}

impl Executor for CommandExecutor {
    fn launch(&self, request: LaunchRequest) -> ExecFuture<'_, ExecOutput> {
        Box::pin(self.run(request))
    }

    fn probe<'a>(&'a self, session: &'a Session) -> ExecFuture<'a, Option<SessionStatus>> {
        Box::pin(async move {
            if let Some(status) = self.reap(&session.session_id).await {
                return Ok(Some(status));
            }
            if self.children.lock().await.contains_key(&session.session_id) {
                return Ok(None);
            }
            Ok(self.query_status(session).await)
        })
    }
}

async fn open_log(path: &Path) -> Result<Stdio> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|err| AppError::Launch(format!("cannot create {}: {err}", path.display())))?;
    Ok(Stdio::from(file.into_std().await))
}

/// First [`STREAM_CAPTURE_LIMIT`] bytes of a log file, lossily decoded.
async fn read_log(path: &Path) -> String {
    let mut bytes = Vec::new();
    let limit = u64::try_from(STREAM_CAPTURE_LIMIT).unwrap_or(u64::MAX);
    match tokio::fs::File::open(path).await {
        Ok(file) => {
            if let Err(err) = file.take(limit).read_to_end(&mut bytes).await {
                debug!(path = %path.display(), %err, "failed to read executor log");
            }
        }
        Err(err) => debug!(path = %path.display(), %err, "executor log unavailable"),
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn spawn_reader<R>(mut stream: R, buf: SharedBuf) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    debug!(%err, "executor output stream closed with error");
                    break;
                }
            };
            // Past the cap the stream is still drained so the child never blocks on a full pipe.
            if let Ok(mut guard) = buf.lock() {
                let room = STREAM_CAPTURE_LIMIT.saturating_sub(guard.len());
                guard.extend_from_slice(&chunk[..read.min(room)]);
            }
        }
    })
}

async fn drain(readers: [Option<JoinHandle<()>>; 2]) {
    for handle in readers.into_iter().flatten() {
        if tokio::time::timeout(READER_DRAIN, handle).await.is_err() {
            debug!("output reader still open after process exit");
        }
    }
}

fn snapshot(buf: &SharedBuf) -> String {
    buf.lock()
        .map(|guard| String::from_utf8_lossy(&guard).into_owned())
        .unwrap_or_default()
}
