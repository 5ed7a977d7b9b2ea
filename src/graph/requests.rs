//! CRUD plus atomic claim over `TaskRequest` nodes.

use super::{GraphStore, EDGE_DEPENDS_ON, EDGE_PRODUCED};
use crate::db::now_ms;
use crate::error::RunnerError;
use crate::types::{NewRequest, RequestStatus, TaskRequest, PRIORITY_MAX, PRIORITY_MIN};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Result of a submit: the row, plus whether this call created it.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Created(TaskRequest),
    Existing(TaskRequest),
}

impl SubmitOutcome {
    pub fn request(&self) -> &TaskRequest {
        match self {
            SubmitOutcome::Created(r) | SubmitOutcome::Existing(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, SubmitOutcome::Created(_))
    }
}

pub(super) fn parse_request_row(row: &Row) -> rusqlite::Result<TaskRequest> {
    let status: String = row.get("status")?;
    let parameters_json: String = row.get("parameters")?;
    Ok(TaskRequest {
        request_id: row.get("request_id")?,
        task_id: row.get("task_id")?,
        parameters: serde_json::from_str(&parameters_json)
            .unwrap_or(Value::Object(serde_json::Map::new())),
        status: RequestStatus::from_str(&status).unwrap_or(RequestStatus::Pending),
        priority: row.get("priority")?,
        requester: row.get("requester")?,
        created_at: row.get("created_at")?,
        claimed_by: row.get("claimed_by")?,
        claimed_at: row.get("claimed_at")?,
        finished_at: row.get("finished_at")?,
        result_ref: row.get("result_ref")?,
        error: row.get("error")?,
    })
}

fn get_request_in_conn(conn: &Connection, request_id: &str) -> Result<Option<TaskRequest>> {
    let mut stmt = conn.prepare("SELECT * FROM task_requests WHERE request_id = ?1")?;
    let req = stmt
        .query_row(params![request_id], parse_request_row)
        .optional()?;
    Ok(req)
}

/// Whether adding `request_id -> dep_id` would close a dependency cycle:
/// BFS from the dependency back to the new request.
fn would_create_cycle(conn: &Connection, request_id: &str, dep_id: &str) -> Result<bool> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(dep_id.to_string());

    while let Some(current) = queue.pop_front() {
        if current == request_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }

        let mut stmt = conn.prepare(
            "SELECT to_id FROM request_edges WHERE from_id = ?1 AND edge_type = ?2",
        )?;
        let deps: Vec<String> = stmt
            .query_map(params![&current, EDGE_DEPENDS_ON], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        for dep in deps {
            if !visited.contains(&dep) {
                queue.push_back(dep);
            }
        }
    }

    Ok(false)
}

impl GraphStore {
    /// Insert a request. Validates priority range, parameter shape, and
    /// dependency targets; rejects cycles. Idempotent on `request_id`.
    /// The row starts `pending` iff every dependency is already `done`.
    pub fn submit(&self, input: NewRequest) -> Result<SubmitOutcome> {
        let request_id = input
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let priority = input.priority.unwrap_or(crate::types::PRIORITY_DEFAULT);
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
            return Err(anyhow!(RunnerError::invalid_value(
                "priority",
                &format!("priority must be in [{}, {}]", PRIORITY_MIN, PRIORITY_MAX),
            )));
        }
        if input.task_id.is_empty() {
            return Err(anyhow!(RunnerError::missing_field("task_id")));
        }

        let parameters_json = serde_json::to_string(&input.parameters)
            .map_err(|e| anyhow!(RunnerError::invalid_value("parameters", &e.to_string())))?;

        let now = now_ms();

        self.with_conn_mut(|conn| {
            if let Some(existing) = get_request_in_conn(conn, &request_id)? {
                return Ok(SubmitOutcome::Existing(existing));
            }

            let tx = conn.transaction()?;

            // Every declared dependency must exist; compute gating status.
            let mut all_done = true;
            for dep_id in &input.depends_on {
                let dep_status: Option<String> = tx
                    .query_row(
                        "SELECT status FROM task_requests WHERE request_id = ?1",
                        params![dep_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match dep_status {
                    None => {
                        return Err(anyhow!(RunnerError::dependency_missing(dep_id)));
                    }
                    Some(s) if s != RequestStatus::Done.as_str() => all_done = false,
                    Some(_) => {}
                }
                if would_create_cycle(&tx, &request_id, dep_id)? {
                    return Err(anyhow!(RunnerError::dependency_cycle(&request_id, dep_id)));
                }
            }

            let status = if all_done {
                RequestStatus::Pending
            } else {
                RequestStatus::Blocked
            };

            tx.execute(
                "INSERT INTO task_requests
                 (request_id, task_id, parameters, status, priority, requester, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &request_id,
                    input.task_id,
                    parameters_json,
                    status.as_str(),
                    priority,
                    input.requester,
                    now,
                ],
            )?;

            for dep_id in &input.depends_on {
                tx.execute(
                    "INSERT OR IGNORE INTO request_edges (from_id, to_id, edge_type) VALUES (?1, ?2, ?3)",
                    params![&request_id, dep_id, EDGE_DEPENDS_ON],
                )?;
            }

            tx.commit()?;

            let created = get_request_in_conn(conn, &request_id)?
                .ok_or_else(|| anyhow!("Request vanished after insert"))?;
            Ok(SubmitOutcome::Created(created))
        })
    }

    /// Atomically claim the highest-priority, earliest-created pending
    /// request whose dependencies are all done. Compare-and-set on the
    /// status column prevents double-claim under concurrent callers.
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<TaskRequest>> {
        let now = now_ms();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE task_requests
                 SET status = 'claimed', claimed_by = ?1, claimed_at = ?2
                 WHERE request_id = (
                     SELECT r.request_id FROM task_requests r
                     WHERE r.status = 'pending'
                       AND NOT EXISTS (
                           SELECT 1 FROM request_edges e
                           JOIN task_requests dep ON dep.request_id = e.to_id
                           WHERE e.from_id = r.request_id
                             AND e.edge_type = ?3
                             AND dep.status <> 'done'
                       )
                     ORDER BY r.priority DESC, r.created_at ASC
                     LIMIT 1
                 )
                 AND status = 'pending'
                 RETURNING *",
            )?;

            let claimed = stmt
                .query_row(params![worker_id, now, EDGE_DEPENDS_ON], parse_request_row)
                .optional()?;
            Ok(claimed)
        })
    }

    /// Transition a claimed request to executing.
    pub fn mark_executing(&self, request_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE task_requests SET status = 'executing'
                 WHERE request_id = ?1 AND status = 'claimed'",
                params![request_id],
            )?;
            if rows == 0 {
                return Err(anyhow!(RunnerError::invalid_state(format!(
                    "Request {} is not claimed",
                    request_id
                ))));
            }
            Ok(())
        })
    }

    /// Settle a request as done and unblock dependents whose every
    /// dependency is now done. Idempotent under replay.
    pub fn mark_done(&self, request_id: &str, result_ref: &str) -> Result<Vec<String>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE task_requests
                 SET status = 'done', finished_at = ?1, result_ref = ?2
                 WHERE request_id = ?3",
                params![now, result_ref, request_id],
            )?;
            let unblocked = super::cascade::resolve_blocked_in_tx(&tx, request_id)?;
            tx.commit()?;
            Ok(unblocked)
        })
    }

    /// Settle a request as failed. Long errors are truncated.
    pub fn mark_failed(&self, request_id: &str, error: &str) -> Result<()> {
        let now = now_ms();
        let error: String = error.chars().take(2000).collect();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_requests SET status = 'failed', finished_at = ?1, error = ?2
                 WHERE request_id = ?3",
                params![now, error, request_id],
            )?;
            Ok(())
        })
    }

    /// Cancel a request; only allowed from pending or blocked.
    pub fn cancel(&self, request_id: &str) -> Result<TaskRequest> {
        let now = now_ms();
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE task_requests
                 SET status = 'cancelled', finished_at = ?1, error = 'Cancelled by user'
                 WHERE request_id = ?2 AND status IN ('pending', 'blocked')",
                params![now, request_id],
            )?;

            let request = get_request_in_conn(conn, request_id)?
                .ok_or_else(|| anyhow!(RunnerError::request_not_found(request_id)))?;

            if rows == 0 {
                return Err(anyhow!(RunnerError::invalid_state(format!(
                    "Cannot cancel request in '{}' status",
                    request.status.as_str()
                ))));
            }
            Ok(request)
        })
    }

    /// Fetch a request by id.
    pub fn get(&self, request_id: &str) -> Result<Option<TaskRequest>> {
        self.with_conn(|conn| get_request_in_conn(conn, request_id))
    }

    /// List requests by status, ordered by (priority, created_at).
    pub fn list(&self, status: RequestStatus, limit: i64) -> Result<Vec<TaskRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_requests WHERE status = ?1
                 ORDER BY priority DESC, created_at ASC
                 LIMIT ?2",
            )?;
            let requests = stmt
                .query_map(params![status.as_str(), limit], parse_request_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(requests)
        })
    }

    /// Count requests in a status.
    pub fn count(&self, status: RequestStatus) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM task_requests WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// The declared dependencies of a request with their statuses.
    pub fn dependencies(&self, request_id: &str) -> Result<Vec<(String, RequestStatus)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT dep.request_id, dep.status
                 FROM request_edges e
                 JOIN task_requests dep ON dep.request_id = e.to_id
                 WHERE e.from_id = ?1 AND e.edge_type = ?2",
            )?;
            let deps = stmt
                .query_map(params![request_id, EDGE_DEPENDS_ON], |row| {
                    let id: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    Ok((id, status))
                })?
                .filter_map(|r| r.ok())
                .map(|(id, s)| {
                    (
                        id,
                        RequestStatus::from_str(&s).unwrap_or(RequestStatus::Pending),
                    )
                })
                .collect();
            Ok(deps)
        })
    }

    /// Record that a request produced an artifact node.
    pub fn link_produced(&self, request_id: &str, artifact_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO request_edges (from_id, to_id, edge_type) VALUES (?1, ?2, ?3)",
                params![request_id, artifact_id, EDGE_PRODUCED],
            )?;
            Ok(())
        })
    }

    /// Number of artifacts a request produced.
    pub fn produced_count(&self, request_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM request_edges WHERE from_id = ?1 AND edge_type = ?2",
                params![request_id, EDGE_PRODUCED],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> GraphStore {
        GraphStore::open_in_memory().expect("in-memory graph store")
    }

    fn request(task_id: &str, request_id: &str) -> NewRequest {
        NewRequest::new(task_id, "test").with_request_id(request_id)
    }

    #[test]
    fn submit_is_idempotent() {
        let store = setup();
        let a = store.submit(request("t1", "r1")).unwrap();
        assert!(a.is_new());
        let b = store.submit(request("t1", "r1")).unwrap();
        assert!(!b.is_new());
        assert_eq!(a.request().request_id, b.request().request_id);
        assert_eq!(store.count(RequestStatus::Pending).unwrap(), 1);
    }

    #[test]
    fn submit_rejects_out_of_range_priority() {
        let store = setup();
        for bad in [0, 1001, -5] {
            let err = store
                .submit(request("t1", "r1").with_priority(bad))
                .unwrap_err();
            let runner_err = RunnerError::from(err);
            assert_eq!(runner_err.code, crate::error::ErrorCode::InvalidFieldValue);
        }
        // Extremes are accepted
        assert!(store.submit(request("t1", "lo").with_priority(1)).is_ok());
        assert!(store.submit(request("t1", "hi").with_priority(1000)).is_ok());
    }

    #[test]
    fn submit_rejects_missing_dependency() {
        let store = setup();
        let err = store
            .submit(request("t1", "r1").with_depends_on(vec!["ghost".into()]))
            .unwrap_err();
        assert_eq!(
            RunnerError::from(err).code,
            crate::error::ErrorCode::DependencyMissing
        );
    }

    #[test]
    fn dependencies_gate_initial_status() {
        let store = setup();
        store.submit(request("t1", "r1")).unwrap();
        let r2 = store
            .submit(request("t1", "r2").with_depends_on(vec!["r1".into()]))
            .unwrap();
        assert_eq!(r2.request().status, RequestStatus::Blocked);

        // A dependency that is already done admits the request directly.
        store.claim_next("w1").unwrap().unwrap();
        store.mark_done("r1", "stack-1").unwrap();
        let r3 = store
            .submit(request("t1", "r3").with_depends_on(vec!["r1".into()]))
            .unwrap();
        assert_eq!(r3.request().status, RequestStatus::Pending);
    }

    #[test]
    fn claim_orders_by_priority_then_created_at() {
        let store = setup();
        store
            .submit(request("t1", "low").with_priority(10))
            .unwrap();
        store
            .submit(request("t1", "high").with_priority(900))
            .unwrap();
        store
            .submit(request("t1", "high2").with_priority(900))
            .unwrap();

        let first = store.claim_next("w1").unwrap().unwrap();
        assert_eq!(first.request_id, "high");
        assert_eq!(first.status, RequestStatus::Claimed);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));

        let second = store.claim_next("w1").unwrap().unwrap();
        assert_eq!(second.request_id, "high2");

        let third = store.claim_next("w1").unwrap().unwrap();
        assert_eq!(third.request_id, "low");

        assert!(store.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn blocked_requests_are_never_claimed() {
        let store = setup();
        store.submit(request("t1", "r1")).unwrap();
        store
            .submit(
                request("t1", "r2")
                    .with_priority(1000)
                    .with_depends_on(vec!["r1".into()]),
            )
            .unwrap();

        // r2 has the higher priority but is blocked on r1.
        let claimed = store.claim_next("w1").unwrap().unwrap();
        assert_eq!(claimed.request_id, "r1");
        assert!(store.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn mark_done_unblocks_dependents() {
        let store = setup();
        store.submit(request("t1", "r1")).unwrap();
        store
            .submit(request("t1", "r2").with_depends_on(vec!["r1".into()]))
            .unwrap();

        store.claim_next("w1").unwrap();
        store.mark_executing("r1").unwrap();
        let unblocked = store.mark_done("r1", "stack-1").unwrap();
        assert_eq!(unblocked, vec!["r2".to_string()]);

        let r2 = store.get("r2").unwrap().unwrap();
        assert_eq!(r2.status, RequestStatus::Pending);
    }

    #[test]
    fn unblock_waits_for_all_dependencies() {
        let store = setup();
        store.submit(request("t1", "a")).unwrap();
        store.submit(request("t1", "b")).unwrap();
        store
            .submit(request("t1", "c").with_depends_on(vec!["a".into(), "b".into()]))
            .unwrap();

        store.claim_next("w1").unwrap();
        let unblocked = store.mark_done("a", "s1").unwrap();
        assert!(unblocked.is_empty());
        assert_eq!(store.get("c").unwrap().unwrap().status, RequestStatus::Blocked);

        store.claim_next("w1").unwrap();
        let unblocked = store.mark_done("b", "s2").unwrap();
        assert_eq!(unblocked, vec!["c".to_string()]);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let store = setup();
        let err = store
            .submit(request("t1", "c").with_depends_on(vec!["c".into()]))
            .unwrap_err();
        assert_eq!(
            RunnerError::from(err).code,
            crate::error::ErrorCode::DependencyMissing
        );
    }

    #[test]
    fn cycle_detection_walks_the_dependency_graph() {
        let store = setup();
        store.submit(request("t1", "a")).unwrap();
        store
            .submit(request("t1", "b").with_depends_on(vec!["a".into()]))
            .unwrap();
        store
            .submit(request("t1", "c").with_depends_on(vec!["b".into()]))
            .unwrap();

        // c -> b -> a, so an edge a -> c would close a cycle while
        // a -> (fresh id) would not.
        store
            .with_conn(|conn| {
                assert!(would_create_cycle(conn, "a", "c").unwrap());
                assert!(would_create_cycle(conn, "b", "c").unwrap());
                assert!(!would_create_cycle(conn, "c", "a").unwrap());
                assert!(!would_create_cycle(conn, "fresh", "a").unwrap());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cancel_only_from_pending_or_blocked() {
        let store = setup();
        store.submit(request("t1", "r1")).unwrap();
        let cancelled = store.cancel("r1").unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);

        store.submit(request("t1", "r2")).unwrap();
        store.claim_next("w1").unwrap();
        let err = store.cancel("r2").unwrap_err();
        assert_eq!(
            RunnerError::from(err).code,
            crate::error::ErrorCode::InvalidState
        );

        let err = store.cancel("ghost").unwrap_err();
        assert_eq!(
            RunnerError::from(err).code,
            crate::error::ErrorCode::RequestNotFound
        );
    }

    #[test]
    fn produced_edges_are_counted() {
        let store = setup();
        store.submit(request("t1", "r1")).unwrap();
        assert_eq!(store.produced_count("r1").unwrap(), 0);
        store.link_produced("r1", "artifact-1").unwrap();
        store.link_produced("r1", "artifact-1").unwrap();
        store.link_produced("r1", "artifact-2").unwrap();
        assert_eq!(store.produced_count("r1").unwrap(), 2);
    }
}
