//! Integration tests for cascade rules: committed sources materialize
//! requests that the daemon then processes like any other submission.

use serde_json::json;
use stack_runner::config::Config;
use stack_runner::daemon::ProcessorDaemon;
use stack_runner::db::Database;
use stack_runner::graph::GraphStore;
use stack_runner::types::{RequestStatus, TaskKind};

fn setup() -> (Database, GraphStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().expect("in-memory database");
    let graph = GraphStore::open_in_memory().expect("in-memory graph store");
    (db, graph, dir)
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
fn committed_source_creates_a_pending_request() {
    let (_db, graph, _dir) = setup();
    graph
        .upsert_rule(
            "validate_json",
            "validate",
            None,
            Some("json"),
            Some(r#"{"id": "$source.id"}"#),
            50,
            true,
        )
        .unwrap();

    let mut attrs = serde_json::Map::new();
    attrs.insert("id".into(), json!("s1"));
    let created = graph.commit_source("s1", "json", attrs).unwrap();

    assert_eq!(created.len(), 1);
    let request = &created[0];
    assert_eq!(request.task_id, "validate");
    assert_eq!(request.parameters, json!({"id": "s1"}));
    assert_eq!(request.requester, "trigger:validate_json");
    assert_eq!(request.status, RequestStatus::Pending);

    // Visible through the pending listing.
    let pending = graph.list(RequestStatus::Pending, 20).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, request.request_id);
}

#[test]
fn non_matching_kind_does_not_fire() {
    let (_db, graph, _dir) = setup();
    graph
        .upsert_rule("csv_rule", "convert", None, Some("csv"), None, 50, true)
        .unwrap();

    let created = graph
        .commit_source("s1", "json", serde_json::Map::new())
        .unwrap();
    assert!(created.is_empty());
    assert_eq!(graph.count(RequestStatus::Pending).unwrap(), 0);
}

#[test]
fn multiple_matching_rules_create_multiple_requests() {
    let (_db, graph, _dir) = setup();
    graph
        .upsert_rule("first", "validate", None, Some("json"), None, 60, true)
        .unwrap();
    graph
        .upsert_rule("second", "index", None, None, None, 40, true)
        .unwrap();

    let mut attrs = serde_json::Map::new();
    attrs.insert("source_id".into(), json!("s1"));
    let created = graph.commit_source("s1", "json", attrs).unwrap();
    assert_eq!(created.len(), 2);

    let tasks: Vec<&str> = created.iter().map(|r| r.task_id.as_str()).collect();
    assert!(tasks.contains(&"validate"));
    assert!(tasks.contains(&"index"));
}

#[test]
fn daemon_executes_a_cascaded_request() {
    let (db, graph, dir) = setup();
    seed_cli_task(
        &db,
        "validate",
        r#"echo "{\"__task_result__\": true, \"output\": \"validated {id}\"}""#,
    );
    graph
        .upsert_rule(
            "validate_json",
            "validate",
            None,
            Some("json"),
            Some(r#"{"id": "$source.id"}"#),
            50,
            true,
        )
        .unwrap();

    let mut attrs = serde_json::Map::new();
    attrs.insert("id".into(), json!("s1"));
    let created = graph.commit_source("s1", "json", attrs).unwrap();
    let request_id = created[0].request_id.clone();

    let mut config = Config::default();
    config.db_path = dir.path().join("tasks.db");
    config.graph_db_path = dir.path().join("graph.db");
    config.runs_dir = dir.path().join("runs");
    let mut daemon = ProcessorDaemon::new(db, graph.clone(), config);

    assert!(daemon.process_one().unwrap());

    let settled = graph.get(&request_id).unwrap().unwrap();
    assert_eq!(settled.status, RequestStatus::Done);
    assert!(settled.result_ref.is_some());
}

#[test]
fn rule_priority_flows_into_the_request() {
    let (_db, graph, _dir) = setup();
    graph
        .upsert_rule("urgent", "validate", None, None, None, 900, true)
        .unwrap();
    let created = graph
        .commit_source("s1", "json", serde_json::Map::new())
        .unwrap();
    assert_eq!(created[0].priority, 900);
}

#[test]
fn recommit_of_a_source_is_a_no_op() {
    let (_db, graph, _dir) = setup();
    graph
        .upsert_rule("r1", "validate", None, None, None, 50, true)
        .unwrap();

    let first = graph
        .commit_source("s1", "json", serde_json::Map::new())
        .unwrap();
    let second = graph
        .commit_source("s1", "json", serde_json::Map::new())
        .unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(graph.count(RequestStatus::Pending).unwrap(), 1);
}

#[test]
fn produced_edges_surface_through_has_outputs() {
    let (db, graph, _dir) = setup();
    seed_cli_task(&db, "hello", "echo hi");
    let surface = stack_runner::submit::SubmissionSurface::new(db, graph.clone());
    surface
        .submit("hello", None, None, Some("r1".into()), vec![], "tester")
        .unwrap();

    assert!(!surface.status("r1").unwrap().has_outputs);
    graph.link_produced("r1", "artifact-1").unwrap();
    assert!(surface.status("r1").unwrap().has_outputs);
}
