//! Single-task lease queue for non-stack executions.
//!
//! Multi-worker safe: `claim` uses a compare-and-swap UPDATE so a row is
//! only ever owned by one live lease. A lease-expired `running` row is
//! reclaimable by any worker.

use super::{now_ms, Database};
use crate::types::NodeStatus;
use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

/// One row of the `task_queue` table.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub queue_id: i64,
    pub request_id: String,
    pub task_id: String,
    pub status: NodeStatus,
    pub parameters: Value,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<i64>,
}

fn parse_queue_row(row: &Row) -> rusqlite::Result<QueueEntry> {
    let status: String = row.get("status")?;
    let parameters_json: String = row.get("parameters")?;
    Ok(QueueEntry {
        queue_id: row.get("queue_id")?,
        request_id: row.get("request_id")?,
        task_id: row.get("task_id")?,
        status: NodeStatus::from_str(&status).unwrap_or(NodeStatus::Queued),
        parameters: serde_json::from_str(&parameters_json)
            .unwrap_or(Value::Object(serde_json::Map::new())),
        enqueued_at: row.get("enqueued_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        worker_id: row.get("worker_id")?,
        lease_expires_at: row.get("lease_expires_at")?,
    })
}

impl Database {
    /// Enqueue a task for single execution. Idempotent: a duplicate
    /// `request_id` is a no-op that returns the existing row.
    pub fn enqueue_task(
        &self,
        task_id: &str,
        parameters: &Value,
        request_id: Option<String>,
    ) -> Result<QueueEntry> {
        let request_id = request_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let now = now_ms();
        let parameters_json = serde_json::to_string(parameters)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_queue (request_id, task_id, status, parameters, enqueued_at)
                 VALUES (?1, ?2, 'queued', ?3, ?4)
                 ON CONFLICT(request_id) DO NOTHING",
                params![request_id, task_id, parameters_json, now],
            )?;

            let mut stmt = conn.prepare("SELECT * FROM task_queue WHERE request_id = ?1")?;
            let entry = stmt.query_row(params![&request_id], parse_queue_row)?;
            Ok(entry)
        })
    }

    /// Atomically claim the oldest queued row, or steal an expired lease.
    /// Returns None when no work is available.
    pub fn claim_task(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<QueueEntry>> {
        let now = now_ms();
        let lease_expires = now + lease_seconds * 1000;

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE task_queue
                 SET status = 'running',
                     worker_id = ?1,
                     lease_expires_at = ?2,
                     started_at = ?3
                 WHERE queue_id = (
                     SELECT queue_id FROM task_queue
                     WHERE status = 'queued'
                        OR (status = 'running' AND lease_expires_at < ?3)
                     ORDER BY queue_id
                     LIMIT 1
                 )
                 RETURNING *",
            )?;

            let entry = stmt
                .query_row(params![worker_id, lease_expires, now], parse_queue_row)
                .optional()?;
            Ok(entry)
        })
    }

    /// Extend the lease on a running row. Leases are renewable mid-run;
    /// a worker expecting to outlive its lease calls this between phases.
    pub fn renew_lease(&self, queue_id: i64, worker_id: &str, lease_seconds: i64) -> Result<()> {
        let now = now_ms();
        let lease_expires = now + lease_seconds * 1000;
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE task_queue SET lease_expires_at = ?1
                 WHERE queue_id = ?2 AND worker_id = ?3 AND status = 'running'",
                params![lease_expires, queue_id, worker_id],
            )?;
            if rows == 0 {
                return Err(anyhow!("Lease not held by {} for queue_id {}", worker_id, queue_id));
            }
            Ok(())
        })
    }

    /// Finalize a queue entry with a terminal status and release the lease.
    pub fn complete_task(&self, queue_id: i64, status: NodeStatus) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_queue
                 SET status = ?1, finished_at = ?2, worker_id = NULL, lease_expires_at = NULL
                 WHERE queue_id = ?3",
                params![status.as_str(), now, queue_id],
            )?;
            Ok(())
        })
    }

    /// Cancel a queued (not yet running) entry. Returns false if the row
    /// was not in `queued` state.
    pub fn cancel_queued_task(&self, queue_id: i64) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE task_queue SET status = 'cancelled', finished_at = ?1
                 WHERE queue_id = ?2 AND status = 'queued'",
                params![now, queue_id],
            )?;
            Ok(rows > 0)
        })
    }

    /// Check whether a row was cancelled out from under a worker.
    pub fn task_queue_cancelled(&self, queue_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM task_queue WHERE queue_id = ?1",
                    params![queue_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(status.as_deref() == Some("cancelled"))
        })
    }

    /// Fetch a queue entry by its idempotency key.
    pub fn queue_entry(&self, request_id: &str) -> Result<Option<QueueEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM task_queue WHERE request_id = ?1")?;
            let entry = stmt
                .query_row(params![request_id], parse_queue_row)
                .optional()?;
            Ok(entry)
        })
    }
}
