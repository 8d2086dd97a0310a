//! Integration tests for the batch coordinator.
//!
//! Validates:
//! - Dependency order across batches and final counts
//! - Cycles and failed dependencies end as a stall
//! - Batch size bounds concurrent executor calls
//! - Async sessions are resolved through monitor passes
//! - A crashed dispatch is recorded as an `exception` session
//! - Cancellation ends the run without dispatching

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use story_dispatch::executor::DispatchMode;
use story_dispatch::models::session::SessionStatus;
use story_dispatch::orchestrator::coordinator::Outcome;

use super::test_helpers::{
    abandoned_starting, coordinator, load_tasks, memory_store, write_task, FakeExecutor, Response,
};

fn ok() -> Response {
    Response::Exit(0, String::new())
}

// ── Dependency order ────────────────────────────────────────────────────────

/// A → {B, C} with batch size 2 dispatches A alone, then B and C together.
#[tokio::test]
async fn dependency_chain_runs_in_two_batches() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &[]);
    write_task(dir.path(), "b", 2, &["a"]);
    write_task(dir.path(), "c", 2, &["a"]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(ok()));
    let summary = coordinator(&store, &executor, DispatchMode::Sync, 2)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(
        summary.batches,
        vec![vec!["a".to_owned()], vec!["b".to_owned(), "c".to_owned()]]
    );
    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.never_ready, 0);
    assert_eq!(executor.calls(), 3);
}

/// B is never dispatched before A has a completed session.
#[tokio::test]
async fn dependent_waits_for_completed_dependency() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 9, &[]);
    write_task(dir.path(), "b", 1, &["a"]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(ok()));
    coordinator(&store, &executor, DispatchMode::Sync, 5)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    let order: Vec<String> = executor.launched().into_iter().map(|r| r.task_id).collect();
    assert_eq!(order, vec!["a", "b"]);
}

// ── Stalls ──────────────────────────────────────────────────────────────────

/// X ↔ Y can never become ready; the run stalls with nothing dispatched.
#[tokio::test]
async fn dependency_cycle_stalls() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "x", 1, &["y"]);
    write_task(dir.path(), "y", 1, &["x"]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(ok()));
    let summary = coordinator(&store, &executor, DispatchMode::Sync, 2)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Stalled);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.never_ready, 2);
    assert_eq!(summary.never_ready_ids, vec!["x", "y"]);
    assert_eq!(executor.calls(), 0);
}

/// A `starting` record left by a dead dispatcher does not hold off the
/// stall report forever.
#[tokio::test]
async fn abandoned_starting_session_does_not_block_stall() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "x", 1, &["y"]);
    write_task(dir.path(), "y", 1, &["x"]);

    let store = memory_store().await;
    let orphan = abandoned_starting(&store, "z").await;
    let executor = Arc::new(FakeExecutor::new(ok()));
    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator(&store, &executor, DispatchMode::Sync, 2).run(load_tasks(dir.path())),
    )
    .await
    .expect("run finishes")
    .expect("run");

    assert_eq!(summary.outcome, Outcome::Stalled);
    let stored = store.get(&orphan.session_id).await.expect("get").expect("orphan");
    assert_eq!(stored.status, SessionStatus::Exception);
}

/// A failed dependency leaves its dependents unready.
#[tokio::test]
async fn failed_dependency_stalls_dependents() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &[]);
    write_task(dir.path(), "b", 1, &["a"]);

    let store = memory_store().await;
    let executor =
        Arc::new(FakeExecutor::new(ok()).script("a", Response::Exit(1, "boom".to_owned())));
    let summary = coordinator(&store, &executor, DispatchMode::Sync, 2)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Stalled);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.never_ready_ids, vec!["b"]);
}

/// A dependency on an id that is not in the catalog never resolves.
#[tokio::test]
async fn unknown_dependency_never_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &["ghost"]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(ok()));
    let summary = coordinator(&store, &executor, DispatchMode::Sync, 2)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Stalled);
    assert_eq!(summary.never_ready, 1);
}

// ── Concurrency ─────────────────────────────────────────────────────────────

/// Five independent tasks with batch size 2 never exceed two executor calls
/// in flight.
#[tokio::test]
async fn batch_size_bounds_concurrency() {
    let dir = tempfile::tempdir().expect("tempdir");
    for id in ["t1", "t2", "t3", "t4", "t5"] {
        write_task(dir.path(), id, 5, &[]);
    }

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(ok()).with_delay(Duration::from_millis(50)));
    let summary = coordinator(&store, &executor, DispatchMode::Sync, 2)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Completed);
    assert!(executor.max_in_flight() <= 2, "max in flight {}", executor.max_in_flight());
    let sizes: Vec<usize> = summary.batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(summary.completed, 5);
}

// ── Async sessions ──────────────────────────────────────────────────────────

/// Detached sessions are resolved by the monitor pass at the start of each
/// iteration, which then releases dependents.
#[tokio::test]
async fn async_sessions_resolved_by_monitor() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &[]);
    write_task(dir.path(), "b", 1, &["a"]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(Response::Detached(String::new())));
    executor.set_probe("a", SessionStatus::Completed);
    executor.set_probe("b", SessionStatus::Completed);

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator(&store, &executor, DispatchMode::Async, 2).run(load_tasks(dir.path())),
    )
    .await
    .expect("coordinator finished")
    .expect("run");

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.batches.len(), 2);
}

// ── Failures ────────────────────────────────────────────────────────────────

/// A panicking dispatch is recorded as `exception` and counted as an error;
/// the rest of the batch still completes.
#[tokio::test]
async fn crashed_dispatch_recorded_as_exception() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &[]);
    write_task(dir.path(), "b", 1, &[]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(ok()).script("a", Response::Panic));
    let summary = coordinator(&store, &executor, DispatchMode::Sync, 2)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.error, 1);
    assert_eq!(summary.completed, 1);

    let sessions = store.sessions_for("a").await.expect("sessions").sessions;
    assert_eq!(sessions.len(), 1, "orphaned claim is reused, not duplicated");
    assert_eq!(sessions[0].status, SessionStatus::Exception);
}

/// Launch errors are recorded and counted without aborting the run.
#[tokio::test]
async fn launch_error_counted_and_run_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &[]);
    write_task(dir.path(), "b", 2, &[]);

    let store = memory_store().await;
    let executor =
        Arc::new(FakeExecutor::new(ok()).script("a", Response::Fail("no such binary".to_owned())));
    let summary = coordinator(&store, &executor, DispatchMode::Sync, 1)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.error, 1);
    assert_eq!(summary.completed, 1);
}

// ── Cancellation ────────────────────────────────────────────────────────────

/// A cancelled token ends the run before anything is dispatched.
#[tokio::test]
async fn cancelled_run_dispatches_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &[]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(ok()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = coordinator(&store, &executor, DispatchMode::Sync, 2)
        .with_cancellation(cancel)
        .run(load_tasks(dir.path()))
        .await
        .expect("run");

    assert_eq!(summary.outcome, Outcome::Cancelled);
    assert_eq!(summary.never_ready, 1);
    assert_eq!(executor.calls(), 0);
}

/// Cancelling while sessions are in flight ends the wait promptly and
/// reports the sessions as still in flight.
#[tokio::test]
async fn cancel_during_backoff_reports_in_flight() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_task(dir.path(), "a", 1, &[]);

    let store = memory_store().await;
    let executor = Arc::new(FakeExecutor::new(Response::Detached(String::new())));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator(&store, &executor, DispatchMode::Async, 2)
            .with_cancellation(cancel)
            .run(load_tasks(dir.path())),
    )
    .await
    .expect("coordinator finished")
    .expect("run");

    assert_eq!(summary.outcome, Outcome::Cancelled);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.in_flight, 1);
}
