use std::path::PathBuf;
use std::time::Duration;

use story_dispatch::executor::DispatchMode;
use story_dispatch::{config::GlobalConfig, AppError};

fn minimal_toml() -> &'static str {
    r#"
tasks_dir = "stories"

[executor]
host_cli = "depot"
"#
}

fn full_toml() -> &'static str {
    r#"
tasks_dir = "/srv/stories"
db_path = "/var/lib/dispatch/sessions.db"
session_prefix = "nightly"

[catalog]
pattern = "story_*.md"
strict_dependencies = true

[executor]
host_cli = "depot"
host_cli_args = ["claude", "--"]
mode = "sync"
launch_timeout_seconds = 600
grace_period_seconds = 2
status_cli = "depot"
status_cli_args = ["status", "{external_ref}"]
status_timeout_seconds = 4
output_excerpt_chars = 250
log_dir = "/var/log/dispatch"
check_args = ["doctor"]

[scheduler]
batch_size = 3
backoff_seconds = 15

[monitor]
poll_interval_seconds = 10
timeout_seconds = 900

[retention]
max_age_days = 14
"#
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str(minimal_toml()).expect("valid config");

    assert_eq!(config.tasks_dir, PathBuf::from("stories"));
    assert_eq!(config.db_path, PathBuf::from(".dispatch/sessions.db"));
    assert_eq!(config.session_prefix, "dispatch");
    assert_eq!(config.catalog.pattern, "*.md");
    assert!(!config.catalog.strict_dependencies);
    assert_eq!(config.executor.mode, DispatchMode::Async);
    assert_eq!(config.executor.launch_timeout(), Duration::from_secs(1800));
    assert_eq!(config.executor.grace_period(), Duration::from_secs(5));
    assert_eq!(config.executor.status_cli, None);
    assert_eq!(config.executor.output_excerpt_chars, 1000);
    assert_eq!(config.scheduler.batch_size, 5);
    assert_eq!(config.scheduler.backoff(), Duration::from_secs(30));
    assert_eq!(config.executor.log_dir, Some(PathBuf::from(".dispatch/logs")));
    assert_eq!(config.executor.check_args, vec!["--version"]);
    assert_eq!(config.starting_deadline(), Duration::from_secs(1860));
    assert_eq!(config.poll_interval(), Duration::from_secs(30));
    assert_eq!(config.monitor_timeout(), Duration::from_secs(3600));
    assert_eq!(config.retention_max_age(), chrono::Duration::days(7));
}

#[test]
fn full_config_parses_every_section() {
    let config = GlobalConfig::from_toml_str(full_toml()).expect("valid config");

    assert_eq!(config.session_prefix, "nightly");
    assert!(config.catalog.strict_dependencies);
    assert_eq!(config.executor.host_cli_args, vec!["claude", "--"]);
    assert_eq!(config.executor.mode, DispatchMode::Sync);
    assert_eq!(config.executor.status_cli.as_deref(), Some("depot"));
    assert_eq!(config.executor.status_timeout(), Duration::from_secs(4));
    assert_eq!(config.executor.log_dir, Some(PathBuf::from("/var/log/dispatch")));
    assert_eq!(config.executor.check_args, vec!["doctor"]);
    assert_eq!(config.starting_deadline(), Duration::from_secs(660));
    assert_eq!(config.scheduler.batch_size, 3);
    assert_eq!(config.monitor.timeout_seconds, 900);
    assert_eq!(config.retention.max_age_days, 14);
}

#[test]
fn zero_batch_size_rejected() {
    let toml = format!("{}\n[scheduler]\nbatch_size = 0\n", minimal_toml());
    let err = GlobalConfig::from_toml_str(&toml).expect_err("invalid batch size");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[test]
fn zero_poll_interval_rejected() {
    let toml = format!("{}\n[monitor]\npoll_interval_seconds = 0\n", minimal_toml());
    let err = GlobalConfig::from_toml_str(&toml).expect_err("invalid poll interval");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[test]
fn blank_host_cli_rejected() {
    let toml = "tasks_dir = \"x\"\n[executor]\nhost_cli = \"  \"\n";
    let err = GlobalConfig::from_toml_str(toml).expect_err("blank host cli");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[test]
fn missing_executor_section_rejected() {
    let err = GlobalConfig::from_toml_str("tasks_dir = \"x\"\n").expect_err("missing executor");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[test]
fn unknown_mode_rejected() {
    let toml = "tasks_dir = \"x\"\n[executor]\nhost_cli = \"depot\"\nmode = \"later\"\n";
    assert!(GlobalConfig::from_toml_str(toml).is_err());
}

#[test]
fn load_from_path_resolves_relative_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dispatch.toml");
    std::fs::write(&path, minimal_toml()).expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load");

    assert_eq!(config.tasks_dir, dir.path().join("stories"));
    assert_eq!(config.db_path, dir.path().join(".dispatch/sessions.db"));
    assert_eq!(config.executor.log_dir, Some(dir.path().join(".dispatch/logs")));
}

#[test]
fn load_from_missing_path_is_config_error() {
    let err = GlobalConfig::load_from_path("/nonexistent/dispatch.toml").expect_err("missing");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}
