//! End-to-end tests of the `story-dispatch` binary.
//!
//! Each test writes a config and task directory into a temp dir and runs
//! the compiled binary with `sh -c` scripts standing in for the executor.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::test_helpers::write_task;

/// Temp workspace with `tasks/`, a config file and `state/` for the store.
struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new(script: &str, mode: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("tasks")).expect("tasks dir");
        let config = format!(
            r#"
tasks_dir = "tasks"
db_path = "state/sessions.db"
session_prefix = "cli"

[executor]
host_cli = "sh"
host_cli_args = ["-c", '{script}', "dispatch"]
mode = "{mode}"
grace_period_seconds = 0
check_args = ["-c", "echo sh ready"]

[scheduler]
backoff_seconds = 1

[monitor]
poll_interval_seconds = 1
"#
        );
        std::fs::write(dir.path().join("dispatch.toml"), config).expect("write config");
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn tasks(&self) -> PathBuf {
        self.path().join("tasks")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_story-dispatch"))
            .arg("--config")
            .arg(self.path().join("dispatch.toml"))
            .args(args)
            .env("RUST_LOG", "warn")
            .output()
            .expect("run story-dispatch")
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("json output")
    }
}

fn wait_for(path: &Path, limit: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    path.exists()
}

/// An async agent keeps running and writing output after the dispatcher
/// process has exited.
#[test]
fn async_agent_outlives_dispatcher() {
    let marker_dir = tempfile::tempdir().expect("tempdir");
    let marker = marker_dir.path().join("written");
    let script = format!(
        "echo started; sleep 1; echo still-working; touch {}",
        marker.display()
    );
    let ws = Workspace::new(&script, "async");
    write_task(&ws.tasks(), "a", 1, &[]);

    let session = ws.json(&["dispatch", "a"]);
    assert_eq!(session["status"], "running");
    let session_id = session["session_id"].as_str().expect("session id");

    assert!(
        wait_for(&marker, Duration::from_secs(10)),
        "agent was stopped when the dispatcher exited"
    );
    let log = ws
        .path()
        .join("state/logs")
        .join(format!("{session_id}.out.log"));
    let written = std::fs::read_to_string(log).expect("session log");
    assert!(written.contains("still-working"), "got {written:?}");
}

/// `coordinate --task` runs only the chosen tasks, and `status` reports
/// per-task progress from the store.
#[test]
fn coordinate_subset_then_status() {
    let ws = Workspace::new("exit 0", "sync");
    write_task(&ws.tasks(), "a", 1, &[]);
    write_task(&ws.tasks(), "b", 2, &["a"]);
    write_task(&ws.tasks(), "c", 3, &[]);

    let summary = ws.json(&["coordinate", "--task", "a", "--task", "b"]);
    assert_eq!(summary["outcome"], "completed");
    assert_eq!(summary["dispatched"], 2);
    assert_eq!(summary["completed"], 2);

    let done = ws.json(&["status", "b"]);
    assert_eq!(done["state"], "completed");
    assert_eq!(done["attempts"], 1);
    assert_eq!(done["latest"]["status"], "completed");

    let untouched = ws.json(&["status", "c"]);
    assert_eq!(untouched["state"], "not_started");
    assert_eq!(untouched["latest"], Value::Null);
}

/// Selecting a task that is not in the catalog is an error.
#[test]
fn coordinate_unknown_task_fails() {
    let ws = Workspace::new("exit 0", "sync");
    write_task(&ws.tasks(), "a", 1, &[]);

    let output = ws.run(&["coordinate", "--task", "ghost"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ghost"));
}

/// `check` reports the preflight result and fails when the executor does.
#[test]
fn check_reports_executor_health() {
    let ws = Workspace::new("exit 0", "sync");
    let report = ws.json(&["check"]);
    assert_eq!(report["ok"], true);
    assert_eq!(report["detail"], "sh ready");

    let broken = Workspace::new("exit 0", "sync");
    let config = broken.path().join("dispatch.toml");
    let raw = std::fs::read_to_string(&config).expect("read config");
    std::fs::write(&config, raw.replace("echo sh ready", "exit 9")).expect("write config");
    let output = broken.run(&["check"]);
    assert!(!output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(report["exit_code"], 9);
}
