//! Durable state for execution stacks and their LIFO node queue.
//!
//! The engine owns all writes to a stack; rows carry lease columns so an
//! interrupted run can be resumed (an expired `running` node is
//! re-acquirable). Terminal order is recorded in `finish_seq`, a
//! per-stack monotonic counter, so the trace does not depend on
//! millisecond timestamps.

use super::{now_ms, Database};
use crate::types::{NodeStatus, PushedChild, StackInfo, StackNode, StackStatus, TraceEntry};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

/// Handle returned by stack creation.
#[derive(Debug, Clone)]
pub struct CreatedStack {
    pub stack_id: String,
    pub root_queue_id: i64,
    pub request_id: String,
    /// False when the request id already had a stack (idempotent create).
    pub is_new: bool,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn parse_node_row(row: &Row) -> rusqlite::Result<StackNode> {
    let status: String = row.get("status")?;
    let parameters_json: String = row.get("parameters")?;
    let input_context_json: String = row.get("input_context")?;
    let output_json: Option<String> = row.get("output")?;
    let output_context_json: Option<String> = row.get("output_context")?;
    let pushed_children_json: String = row.get("pushed_children")?;

    Ok(StackNode {
        queue_id: row.get("queue_id")?,
        request_id: row.get("request_id")?,
        stack_id: row.get("stack_id")?,
        task_id: row.get("task_id")?,
        depth: row.get("depth")?,
        parent_queue_id: row.get("parent_queue_id")?,
        sequence: row.get("sequence")?,
        status: NodeStatus::from_str(&status).unwrap_or(NodeStatus::Queued),
        enqueued_at: row.get("enqueued_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        worker_id: row.get("worker_id")?,
        lease_expires_at: row.get("lease_expires_at")?,
        parameters: serde_json::from_str(&parameters_json).unwrap_or_else(|_| empty_object()),
        input_context: serde_json::from_str(&input_context_json).unwrap_or_else(|_| empty_object()),
        output: output_json.and_then(|s| serde_json::from_str(&s).ok()),
        output_context: output_context_json.and_then(|s| serde_json::from_str(&s).ok()),
        pushed_children: serde_json::from_str(&pushed_children_json).unwrap_or_default(),
        error_message: row.get("error_message")?,
    })
}

fn parse_stack_row(row: &Row) -> rusqlite::Result<StackInfo> {
    let status: String = row.get("status")?;
    let initial_params_json: String = row.get("initial_params")?;
    let context_json: String = row.get("context")?;
    let trace_json: Option<String> = row.get("trace")?;
    let final_output_json: Option<String> = row.get("final_output")?;

    Ok(StackInfo {
        stack_id: row.get("stack_id")?,
        created_at: row.get("created_at")?,
        finished_at: row.get("finished_at")?,
        status: StackStatus::from_str(&status).unwrap_or(StackStatus::Running),
        initial_request_id: row.get("initial_request_id")?,
        initial_task_id: row.get("initial_task_id")?,
        initial_params: serde_json::from_str(&initial_params_json)
            .unwrap_or_else(|_| empty_object()),
        context: serde_json::from_str(&context_json).unwrap_or_else(|_| empty_object()),
        trace: trace_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        final_output: final_output_json.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get("error_message")?,
    })
}

/// Assign the next per-stack terminal sequence number inside a transaction.
fn next_finish_seq(conn: &Connection, stack_id: &str) -> Result<i64> {
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(finish_seq), 0) + 1 FROM stack_queue WHERE stack_id = ?1",
        params![stack_id],
        |row| row.get(0),
    )?;
    Ok(seq)
}

impl Database {
    /// Create a stack and queue its root node. Idempotent on the initial
    /// request id: a second create with the same id returns the existing
    /// stack untouched.
    pub fn create_stack(
        &self,
        request_id: &str,
        task_id: &str,
        parameters: &Value,
    ) -> Result<CreatedStack> {
        let now = now_ms();
        let parameters_json = serde_json::to_string(parameters)?;

        self.with_conn_mut(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT stack_id FROM execution_stacks WHERE initial_request_id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(stack_id) = existing {
                let root_queue_id: i64 = conn.query_row(
                    "SELECT queue_id FROM stack_queue WHERE stack_id = ?1 AND depth = 0",
                    params![&stack_id],
                    |row| row.get(0),
                )?;
                return Ok(CreatedStack {
                    stack_id,
                    root_queue_id,
                    request_id: request_id.to_string(),
                    is_new: false,
                });
            }

            let stack_id = Uuid::now_v7().to_string();
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO execution_stacks
                 (stack_id, created_at, status, initial_request_id, initial_task_id, initial_params, context)
                 VALUES (?1, ?2, 'running', ?3, ?4, ?5, '{}')",
                params![&stack_id, now, request_id, task_id, parameters_json],
            )?;

            tx.execute(
                "INSERT INTO stack_queue
                 (request_id, stack_id, task_id, depth, sequence, status, enqueued_at, parameters, input_context)
                 VALUES (?1, ?2, ?3, 0, 0, 'queued', ?4, ?5, '{}')",
                params![request_id, &stack_id, task_id, now, parameters_json],
            )?;
            let root_queue_id = tx.last_insert_rowid();

            tx.commit()?;

            Ok(CreatedStack {
                stack_id,
                root_queue_id,
                request_id: request_id.to_string(),
                is_new: true,
            })
        })
    }

    /// Get stack metadata and (once finalized) its trace.
    pub fn stack_info(&self, stack_id: &str) -> Result<Option<StackInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM execution_stacks WHERE stack_id = ?1")?;
            let info = stmt
                .query_row(params![stack_id], parse_stack_row)
                .optional()?;
            Ok(info)
        })
    }

    /// Look up a stack by the request that started it.
    pub fn stack_for_request(&self, request_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT stack_id FROM execution_stacks WHERE initial_request_id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    /// LIFO acquisition: claim the queued node with the greatest
    /// (depth, sequence, queue_id), or steal an expired lease. The node's
    /// `input_context` is set to the stack's accumulated context at this
    /// moment, not the snapshot taken when it was pushed.
    pub fn acquire_stack_node(
        &self,
        stack_id: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<StackNode>> {
        let now = now_ms();
        let lease_expires = now + lease_seconds * 1000;

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE stack_queue
                 SET status = 'running',
                     worker_id = ?1,
                     lease_expires_at = ?2,
                     started_at = ?3
                 WHERE queue_id = (
                     SELECT queue_id FROM stack_queue
                     WHERE stack_id = ?4
                       AND (status = 'queued' OR (status = 'running' AND lease_expires_at < ?3))
                     ORDER BY depth DESC, sequence DESC, queue_id DESC
                     LIMIT 1
                 )
                 RETURNING *",
            )?;

            let node = stmt
                .query_row(
                    params![worker_id, lease_expires, now, stack_id],
                    parse_node_row,
                )
                .optional()?;

            let Some(mut node) = node else {
                return Ok(None);
            };

            let context_json: String = conn.query_row(
                "SELECT context FROM execution_stacks WHERE stack_id = ?1",
                params![stack_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "UPDATE stack_queue SET input_context = ?1 WHERE queue_id = ?2",
                params![&context_json, node.queue_id],
            )?;
            node.input_context =
                serde_json::from_str(&context_json).unwrap_or_else(|_| empty_object());

            Ok(Some(node))
        })
    }

    /// The stack's accumulated context.
    pub fn stack_context(&self, stack_id: &str) -> Result<Value> {
        self.with_conn(|conn| {
            let context_json: String = conn.query_row(
                "SELECT context FROM execution_stacks WHERE stack_id = ?1",
                params![stack_id],
                |row| row.get(0),
            )?;
            Ok(serde_json::from_str(&context_json).unwrap_or_else(|_| empty_object()))
        })
    }

    /// Replace the stack's accumulated context. Only called while running.
    pub fn update_stack_context(&self, stack_id: &str, context: &Value) -> Result<()> {
        let context_json = serde_json::to_string(context)?;
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE execution_stacks SET context = ?1 WHERE stack_id = ?2 AND status = 'running'",
                params![context_json, stack_id],
            )?;
            if rows == 0 {
                return Err(anyhow!("Stack {} is not running", stack_id));
            }
            Ok(())
        })
    }

    /// Enqueue children atomically, `sequence` assigned 0..n-1 in declared
    /// order. Because acquisition favors the greatest sequence, the
    /// last-declared child runs first.
    pub fn push_children(
        &self,
        stack_id: &str,
        parent_queue_id: i64,
        parent_depth: i64,
        children: &[PushedChild],
        input_context: &Value,
    ) -> Result<Vec<StackNode>> {
        if children.is_empty() {
            return Ok(Vec::new());
        }
        let now = now_ms();
        let context_json = serde_json::to_string(input_context)?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut pushed = Vec::with_capacity(children.len());

            for (seq, child) in children.iter().enumerate() {
                let request_id = Uuid::now_v7().to_string();
                let parameters_json = serde_json::to_string(&child.parameters)?;
                tx.execute(
                    "INSERT INTO stack_queue
                     (request_id, stack_id, task_id, depth, parent_queue_id, sequence,
                      status, enqueued_at, parameters, input_context)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8, ?9)",
                    params![
                        request_id,
                        stack_id,
                        child.task_id,
                        parent_depth + 1,
                        parent_queue_id,
                        seq as i64,
                        now,
                        parameters_json,
                        context_json,
                    ],
                )?;
                let queue_id = tx.last_insert_rowid();
                let mut stmt = tx.prepare("SELECT * FROM stack_queue WHERE queue_id = ?1")?;
                pushed.push(stmt.query_row(params![queue_id], parse_node_row)?);
            }

            tx.commit()?;
            Ok(pushed)
        })
    }

    /// Mark a node terminal, record its outputs, and release the lease.
    pub fn finalize_node(
        &self,
        queue_id: i64,
        status: NodeStatus,
        output: Option<&Value>,
        output_context: Option<&Value>,
        pushed_children: &[PushedChild],
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = now_ms();
        let output_json = output.map(serde_json::to_string).transpose()?;
        let output_context_json = output_context.map(serde_json::to_string).transpose()?;
        let pushed_json = serde_json::to_string(pushed_children)?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let stack_id: String = tx.query_row(
                "SELECT stack_id FROM stack_queue WHERE queue_id = ?1",
                params![queue_id],
                |row| row.get(0),
            )?;
            let finish_seq = next_finish_seq(&tx, &stack_id)?;

            tx.execute(
                "UPDATE stack_queue
                 SET status = ?1,
                     finished_at = ?2,
                     finish_seq = ?3,
                     output = ?4,
                     output_context = ?5,
                     pushed_children = ?6,
                     error_message = ?7,
                     worker_id = NULL,
                     lease_expires_at = NULL
                 WHERE queue_id = ?8",
                params![
                    status.as_str(),
                    now,
                    finish_seq,
                    output_json,
                    output_context_json,
                    pushed_json,
                    error_message,
                    queue_id,
                ],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    /// Cancel every still-queued node of a stack (failure cascade or
    /// abort). Returns the number of nodes cancelled.
    pub fn cancel_queued_nodes(&self, stack_id: &str, error_message: &str) -> Result<usize> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let queued: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT queue_id FROM stack_queue
                     WHERE stack_id = ?1 AND status = 'queued'
                     ORDER BY queue_id",
                )?;
                let x = stmt.query_map(params![stack_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                x
            };

            for queue_id in &queued {
                let finish_seq = next_finish_seq(&tx, stack_id)?;
                tx.execute(
                    "UPDATE stack_queue
                     SET status = 'cancelled', finished_at = ?1, finish_seq = ?2, error_message = ?3
                     WHERE queue_id = ?4",
                    params![now, finish_seq, error_message, queue_id],
                )?;
            }

            tx.commit()?;
            Ok(queued.len())
        })
    }

    /// True while the stack still has queued or running nodes.
    pub fn stack_has_open_nodes(&self, stack_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM stack_queue
                 WHERE stack_id = ?1 AND status IN ('queued', 'running')",
                params![stack_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Reach a terminal status exactly once: assemble the trace in
    /// terminal-state order and freeze the stack. A second call for an
    /// already-terminal stack is a no-op returning the existing info.
    pub fn finalize_stack(
        &self,
        stack_id: &str,
        status: StackStatus,
        final_output: Option<&Value>,
        error_message: Option<&str>,
    ) -> Result<StackInfo> {
        if !status.is_terminal() {
            return Err(anyhow!("finalize_stack requires a terminal status"));
        }
        let now = now_ms();
        let trace = self.build_trace(stack_id)?;
        let trace_json = serde_json::to_string(&trace)?;
        let final_output_json = final_output.map(serde_json::to_string).transpose()?;

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE execution_stacks
                 SET status = ?1, finished_at = ?2, trace = ?3, final_output = ?4, error_message = ?5
                 WHERE stack_id = ?6 AND status = 'running'",
                params![
                    status.as_str(),
                    now,
                    trace_json,
                    final_output_json,
                    error_message,
                    stack_id,
                ],
            )?;
            Ok(())
        })?;

        self.stack_info(stack_id)?
            .ok_or_else(|| anyhow!("Stack not found: {}", stack_id))
    }

    /// Assemble trace entries for every node, ordered by terminal order.
    fn build_trace(&self, stack_id: &str) -> Result<Vec<TraceEntry>> {
        let nodes = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM stack_queue WHERE stack_id = ?1
                 ORDER BY finish_seq IS NULL, finish_seq, queue_id",
            )?;
            let nodes: Vec<StackNode> = stmt
                .query_map(params![stack_id], parse_node_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(nodes)
        })?;

        Ok(nodes
            .into_iter()
            .map(|n| {
                let execution_ms = match (n.started_at, n.finished_at) {
                    (Some(s), Some(f)) if f >= s => f - s,
                    _ => 0,
                };
                TraceEntry {
                    queue_id: n.queue_id,
                    request_id: n.request_id,
                    task_id: n.task_id,
                    depth: n.depth,
                    status: n.status,
                    started_at: n.started_at,
                    finished_at: n.finished_at,
                    execution_ms,
                    input_context: n.input_context,
                    output: n.output,
                    pushed_children: n.pushed_children,
                    error: n.error_message,
                }
            })
            .collect())
    }

    /// All nodes of a stack in queue order (inspection and tests).
    pub fn stack_nodes(&self, stack_id: &str) -> Result<Vec<StackNode>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM stack_queue WHERE stack_id = ?1 ORDER BY queue_id")?;
            let nodes = stmt
                .query_map(params![stack_id], parse_node_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(nodes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        Database::open_in_memory().expect("in-memory db")
    }

    fn child(task_id: &str) -> PushedChild {
        PushedChild {
            task_id: task_id.to_string(),
            parameters: empty_object(),
            reason: String::new(),
        }
    }

    #[test]
    fn create_is_idempotent_on_request_id() {
        let db = setup_db();
        let a = db
            .create_stack("req-1", "root", &empty_object())
            .unwrap();
        assert!(a.is_new);
        let b = db
            .create_stack("req-1", "root", &empty_object())
            .unwrap();
        assert!(!b.is_new);
        assert_eq!(a.stack_id, b.stack_id);
        assert_eq!(a.root_queue_id, b.root_queue_id);
    }

    #[test]
    fn acquisition_is_lifo_by_depth_then_sequence() {
        let db = setup_db();
        let created = db.create_stack("req-1", "root", &empty_object()).unwrap();

        // Take the root and push three children in declared order.
        let root = db
            .acquire_stack_node(&created.stack_id, "w1", 300)
            .unwrap()
            .unwrap();
        assert_eq!(root.task_id, "root");

        db.push_children(
            &created.stack_id,
            root.queue_id,
            root.depth,
            &[child("a"), child("b"), child("c")],
            &empty_object(),
        )
        .unwrap();
        db.finalize_node(root.queue_id, NodeStatus::Done, None, None, &[], None)
            .unwrap();

        // Last-declared child first.
        let next = db
            .acquire_stack_node(&created.stack_id, "w1", 300)
            .unwrap()
            .unwrap();
        assert_eq!(next.task_id, "c");
        assert_eq!(next.depth, 1);

        // A grandchild outranks the remaining depth-1 siblings.
        db.push_children(
            &created.stack_id,
            next.queue_id,
            next.depth,
            &[child("c1")],
            &empty_object(),
        )
        .unwrap();
        db.finalize_node(next.queue_id, NodeStatus::Done, None, None, &[], None)
            .unwrap();

        let next = db
            .acquire_stack_node(&created.stack_id, "w1", 300)
            .unwrap()
            .unwrap();
        assert_eq!(next.task_id, "c1");
        assert_eq!(next.depth, 2);
    }

    #[test]
    fn acquisition_records_dynamic_input_context() {
        let db = setup_db();
        let created = db.create_stack("req-1", "root", &empty_object()).unwrap();

        let context = serde_json::json!({"variables": {"x": 1}});
        db.update_stack_context(&created.stack_id, &context).unwrap();

        let node = db
            .acquire_stack_node(&created.stack_id, "w1", 300)
            .unwrap()
            .unwrap();
        assert_eq!(node.input_context, context);
    }

    #[test]
    fn cancel_queued_marks_all_with_message() {
        let db = setup_db();
        let created = db.create_stack("req-1", "root", &empty_object()).unwrap();
        let root = db
            .acquire_stack_node(&created.stack_id, "w1", 300)
            .unwrap()
            .unwrap();
        db.push_children(
            &created.stack_id,
            root.queue_id,
            root.depth,
            &[child("x"), child("y")],
            &empty_object(),
        )
        .unwrap();
        db.finalize_node(root.queue_id, NodeStatus::Done, None, None, &[], None)
            .unwrap();

        let cancelled = db
            .cancel_queued_nodes(&created.stack_id, "parent stack failed")
            .unwrap();
        assert_eq!(cancelled, 2);
        assert!(!db.stack_has_open_nodes(&created.stack_id).unwrap());

        let nodes = db.stack_nodes(&created.stack_id).unwrap();
        for n in nodes.iter().filter(|n| n.task_id != "root") {
            assert_eq!(n.status, NodeStatus::Cancelled);
            assert_eq!(n.error_message.as_deref(), Some("parent stack failed"));
        }
    }

    #[test]
    fn finalize_stack_is_monotonically_final() {
        let db = setup_db();
        let created = db.create_stack("req-1", "root", &empty_object()).unwrap();
        let root = db
            .acquire_stack_node(&created.stack_id, "w1", 300)
            .unwrap()
            .unwrap();
        db.finalize_node(root.queue_id, NodeStatus::Done, None, None, &[], None)
            .unwrap();

        let info = db
            .finalize_stack(&created.stack_id, StackStatus::Done, None, None)
            .unwrap();
        assert_eq!(info.status, StackStatus::Done);
        assert_eq!(info.trace.len(), 1);

        // A later finalize with a different status does not overwrite.
        let info = db
            .finalize_stack(&created.stack_id, StackStatus::Failed, None, Some("late"))
            .unwrap();
        assert_eq!(info.status, StackStatus::Done);
        assert!(info.error_message.is_none());
    }

    #[test]
    fn trace_is_ordered_by_terminal_order() {
        let db = setup_db();
        let created = db.create_stack("req-1", "root", &empty_object()).unwrap();
        let root = db
            .acquire_stack_node(&created.stack_id, "w1", 300)
            .unwrap()
            .unwrap();
        db.push_children(
            &created.stack_id,
            root.queue_id,
            root.depth,
            &[child("a"), child("b")],
            &empty_object(),
        )
        .unwrap();
        db.finalize_node(root.queue_id, NodeStatus::Done, None, None, &[], None)
            .unwrap();

        // b runs (and finishes) before a even though a has a lower queue_id.
        for expected in ["b", "a"] {
            let node = db
                .acquire_stack_node(&created.stack_id, "w1", 300)
                .unwrap()
                .unwrap();
            assert_eq!(node.task_id, expected);
            db.finalize_node(node.queue_id, NodeStatus::Done, None, None, &[], None)
                .unwrap();
        }

        let info = db
            .finalize_stack(&created.stack_id, StackStatus::Done, None, None)
            .unwrap();
        let order: Vec<&str> = info.trace.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(order, vec!["root", "b", "a"]);
    }
}
