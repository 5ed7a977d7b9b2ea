//! Task fan-out: follow-up work registered against a queue entry.
//!
//! A fan-out row either references an existing task (mode 1) or carries
//! an inline body that becomes an ephemeral task definition (mode 2).
//! Rows are processed exactly once, after the parent completes cleanly.

use super::{now_ms, Database};
use crate::types::TaskKind;
use anyhow::Result;
use rusqlite::params;
use serde_json::Value;
use uuid::Uuid;

/// A queue entry created by fan-out processing.
#[derive(Debug, Clone)]
pub struct FanoutRecord {
    pub fanout_id: i64,
    pub mode: FanoutMode,
    pub child_task_id: String,
    pub child_queue_id: i64,
    pub child_request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    ExistingTask,
    InlineTask,
}

impl Database {
    /// Register a fan-out row referencing an existing task.
    pub fn add_fanout(
        &self,
        parent_queue_id: i64,
        child_task_id: &str,
        child_parameters: &Value,
    ) -> Result<i64> {
        let parameters_json = serde_json::to_string(child_parameters)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_fanout (parent_queue_id, child_task_id, child_parameters)
                 VALUES (?1, ?2, ?3)",
                params![parent_queue_id, child_task_id, parameters_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Register an inline fan-out row; an ephemeral task definition is
    /// materialized when the row is processed.
    pub fn add_inline_fanout(
        &self,
        parent_queue_id: i64,
        kind: TaskKind,
        code: &str,
        timeout_seconds: Option<i64>,
        child_parameters: &Value,
    ) -> Result<i64> {
        let parameters_json = serde_json::to_string(child_parameters)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_fanout
                 (parent_queue_id, child_parameters, inline_kind, inline_code, inline_timeout)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    parent_queue_id,
                    parameters_json,
                    kind.as_str(),
                    code,
                    timeout_seconds,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Process unhandled fan-out rows for a completed queue entry:
    /// enqueue referenced tasks, materialize and enqueue inline ones,
    /// and mark every row processed.
    pub fn process_fanout(&self, parent_queue_id: i64) -> Result<Vec<FanoutRecord>> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut records = Vec::new();

            let rows: Vec<(i64, Option<String>, String, Option<String>, Option<String>, Option<i64>)> = {
                let mut stmt = tx.prepare(
                    "SELECT fanout_id, child_task_id, child_parameters,
                            inline_kind, inline_code, inline_timeout
                     FROM task_fanout
                     WHERE parent_queue_id = ?1 AND processed = 0",
                )?;
                let x = stmt.query_map(params![parent_queue_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
                x
            };

            for (fanout_id, child_task_id, parameters_json, inline_kind, inline_code, inline_timeout) in rows {
                let record = if let Some(child_task_id) = child_task_id {
                    let request_id = Uuid::now_v7().to_string();
                    tx.execute(
                        "INSERT INTO task_queue (request_id, task_id, status, parameters, enqueued_at)
                         VALUES (?1, ?2, 'queued', ?3, ?4)",
                        params![&request_id, &child_task_id, &parameters_json, now],
                    )?;
                    Some(FanoutRecord {
                        fanout_id,
                        mode: FanoutMode::ExistingTask,
                        child_task_id,
                        child_queue_id: tx.last_insert_rowid(),
                        child_request_id: request_id,
                    })
                } else if let Some(code) = inline_code {
                    let ephemeral_task_id = format!(
                        "inline_{}_{}_{}",
                        parent_queue_id,
                        fanout_id,
                        &Uuid::new_v4().simple().to_string()[..8]
                    );
                    let kind = inline_kind.as_deref().unwrap_or("cli");
                    tx.execute(
                        "INSERT INTO tasks
                         (task_id, kind, code, default_params, env, timeout_seconds, enabled, created_at, updated_at)
                         VALUES (?1, ?2, ?3, '{}', '{}', ?4, 1, ?5, ?5)",
                        params![&ephemeral_task_id, kind, code, inline_timeout.unwrap_or(300), now],
                    )?;

                    let request_id = Uuid::now_v7().to_string();
                    tx.execute(
                        "INSERT INTO task_queue (request_id, task_id, status, parameters, enqueued_at)
                         VALUES (?1, ?2, 'queued', ?3, ?4)",
                        params![&request_id, &ephemeral_task_id, &parameters_json, now],
                    )?;
                    Some(FanoutRecord {
                        fanout_id,
                        mode: FanoutMode::InlineTask,
                        child_task_id: ephemeral_task_id,
                        child_queue_id: tx.last_insert_rowid(),
                        child_request_id: request_id,
                    })
                } else {
                    None
                };

                tx.execute(
                    "UPDATE task_fanout SET processed = 1 WHERE fanout_id = ?1",
                    params![fanout_id],
                )?;

                if let Some(record) = record {
                    records.push(record);
                }
            }

            tx.commit()?;
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeStatus;

    fn setup_db() -> Database {
        Database::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn fanout_enqueues_existing_task_once() {
        let db = setup_db();
        let parent = db
            .enqueue_task("parent", &serde_json::json!({}), Some("r1".into()))
            .unwrap();
        db.add_fanout(parent.queue_id, "child", &serde_json::json!({"n": 1}))
            .unwrap();

        let records = db.process_fanout(parent.queue_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mode, FanoutMode::ExistingTask);
        assert_eq!(records[0].child_task_id, "child");

        let entry = db.queue_entry(&records[0].child_request_id).unwrap().unwrap();
        assert_eq!(entry.status, NodeStatus::Queued);
        assert_eq!(entry.parameters, serde_json::json!({"n": 1}));

        // Second pass finds nothing unprocessed
        assert!(db.process_fanout(parent.queue_id).unwrap().is_empty());
    }

    #[test]
    fn inline_fanout_materializes_ephemeral_task() {
        let db = setup_db();
        let parent = db
            .enqueue_task("parent", &serde_json::json!({}), Some("r1".into()))
            .unwrap();
        db.add_inline_fanout(
            parent.queue_id,
            TaskKind::Cli,
            "echo inline",
            Some(60),
            &serde_json::json!({}),
        )
        .unwrap();

        let records = db.process_fanout(parent.queue_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mode, FanoutMode::InlineTask);

        let def = db.task(&records[0].child_task_id).unwrap().unwrap();
        assert_eq!(def.code, "echo inline");
        assert_eq!(def.timeout_seconds, 60);
        assert!(def.task_id.starts_with("inline_"));
    }
}
