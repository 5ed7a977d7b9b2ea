//! Integration tests for the single-task queue worker.

use serde_json::json;
use stack_runner::config::Config;
use stack_runner::db::control::{KILL_SWITCH, PAUSE_NEW_TASKS};
use stack_runner::db::Database;
use stack_runner::types::{NodeStatus, TaskKind};
use stack_runner::worker::{run_once, RunOutcome};

fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

/// Config pointed at a throwaway runs directory.
fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.db_path = dir.path().join("tasks.db");
    config.graph_db_path = dir.path().join("graph.db");
    config.runs_dir = dir.path().join("runs");
    config
}

fn seed_cli_task(db: &Database, task_id: &str, code: &str) {
    db.upsert_task(
        task_id,
        TaskKind::Cli,
        code,
        serde_json::Map::new(),
        None,
        std::collections::HashMap::new(),
        30,
    )
    .expect("Failed to seed task");
}

#[test]
fn run_once_completes_a_queued_task() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    let config = test_config(&dir);

    seed_cli_task(&db, "hello", "echo hello");
    db.enqueue_task("hello", &json!({}), Some("r1".into())).unwrap();

    let outcome = run_once(&db, &config).unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let entry = db.queue_entry("r1").unwrap().unwrap();
    assert_eq!(entry.status, NodeStatus::Done);

    // A run artifact was written.
    let artifacts: Vec<_> = std::fs::read_dir(&config.runs_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0]
        .file_name()
        .to_string_lossy()
        .starts_with("run_hello_"));
}

#[test]
fn run_once_with_empty_queue_reports_no_task() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    let outcome = run_once(&db, &test_config(&dir)).unwrap();
    assert_eq!(outcome, RunOutcome::NoTask);
}

#[test]
fn failing_task_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    seed_cli_task(&db, "bad", "exit 3");
    db.enqueue_task("bad", &json!({}), Some("r1".into())).unwrap();

    let outcome = run_once(&db, &test_config(&dir)).unwrap();
    assert_eq!(outcome, RunOutcome::Failed);
    assert_eq!(
        db.queue_entry("r1").unwrap().unwrap().status,
        NodeStatus::Failed
    );
}

#[test]
fn kill_switch_preempts_claiming() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    seed_cli_task(&db, "hello", "echo hello");
    db.enqueue_task("hello", &json!({}), Some("r1".into())).unwrap();
    db.set_control_flag(KILL_SWITCH, "1").unwrap();

    let outcome = run_once(&db, &test_config(&dir)).unwrap();
    assert_eq!(outcome, RunOutcome::KillSwitch);
    // The task was not claimed.
    assert_eq!(
        db.queue_entry("r1").unwrap().unwrap().status,
        NodeStatus::Queued
    );
}

#[test]
fn pause_flag_defers_work() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    seed_cli_task(&db, "hello", "echo hello");
    db.enqueue_task("hello", &json!({}), Some("r1".into())).unwrap();
    db.set_control_flag(PAUSE_NEW_TASKS, "1").unwrap();

    assert_eq!(run_once(&db, &test_config(&dir)).unwrap(), RunOutcome::NoTask);

    db.clear_control_flag(PAUSE_NEW_TASKS).unwrap();
    assert_eq!(
        run_once(&db, &test_config(&dir)).unwrap(),
        RunOutcome::Completed
    );
}

#[test]
fn disabled_task_is_cancelled_not_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    seed_cli_task(&db, "hello", "echo hello");
    db.enqueue_task("hello", &json!({}), Some("r1".into())).unwrap();
    db.set_task_enabled("hello", false).unwrap();

    let outcome = run_once(&db, &test_config(&dir)).unwrap();
    assert_eq!(outcome, RunOutcome::Failed);
    assert_eq!(
        db.queue_entry("r1").unwrap().unwrap().status,
        NodeStatus::Cancelled
    );
}

#[test]
fn fanout_children_are_enqueued_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    seed_cli_task(&db, "parent", "echo parent done");
    seed_cli_task(&db, "child", "echo child done");

    let parent = db
        .enqueue_task("parent", &json!({}), Some("r1".into()))
        .unwrap();
    db.add_fanout(parent.queue_id, "child", &json!({"from": "parent"}))
        .unwrap();

    assert_eq!(
        run_once(&db, &test_config(&dir)).unwrap(),
        RunOutcome::Completed
    );

    // The child is now queued and a second pass runs it.
    assert_eq!(
        run_once(&db, &test_config(&dir)).unwrap(),
        RunOutcome::Completed
    );
    // Third pass finds nothing.
    assert_eq!(run_once(&db, &test_config(&dir)).unwrap(), RunOutcome::NoTask);
}

#[test]
fn fanout_is_skipped_when_parent_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    seed_cli_task(&db, "parent", "exit 1");
    seed_cli_task(&db, "child", "echo child");

    let parent = db
        .enqueue_task("parent", &json!({}), Some("r1".into()))
        .unwrap();
    db.add_fanout(parent.queue_id, "child", &json!({})).unwrap();

    assert_eq!(run_once(&db, &test_config(&dir)).unwrap(), RunOutcome::Failed);
    assert_eq!(run_once(&db, &test_config(&dir)).unwrap(), RunOutcome::NoTask);
}

#[test]
fn inline_fanout_runs_an_ephemeral_task() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_db();
    seed_cli_task(&db, "parent", "echo parent");

    let parent = db
        .enqueue_task("parent", &json!({}), Some("r1".into()))
        .unwrap();
    db.add_inline_fanout(
        parent.queue_id,
        TaskKind::Cli,
        "echo from inline",
        Some(30),
        &json!({}),
    )
    .unwrap();

    assert_eq!(
        run_once(&db, &test_config(&dir)).unwrap(),
        RunOutcome::Completed
    );
    assert_eq!(
        run_once(&db, &test_config(&dir)).unwrap(),
        RunOutcome::Completed
    );
}
