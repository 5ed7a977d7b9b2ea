//! Single-task queue worker for non-stack executions.
//!
//! Claims one entry from the lease queue, executes it, processes any
//! registered fan-out, and writes a run artifact. Meant to be invoked
//! repeatedly (cron or a wrapper loop); one call handles one task.

use crate::config::Config;
use crate::db::Database;
use crate::engine::result::parse_task_result;
use crate::exec::SubprocessRunner;
use crate::types::NodeStatus;
use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one worker pass, mapped onto the CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Task completed successfully (exit 0).
    Completed,
    /// No task available or processing is paused (exit 1).
    NoTask,
    /// Task failed or was cancelled (exit 2).
    Failed,
    /// The kill switch is active (exit 3).
    KillSwitch,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::NoTask => 1,
            RunOutcome::Failed => 2,
            RunOutcome::KillSwitch => 3,
        }
    }
}

/// Run artifact for one queue execution.
#[derive(Debug, Serialize)]
struct RunRecord {
    run_id: String,
    queue_id: i64,
    request_id: String,
    task_id: String,
    worker_id: String,
    status: String,
    exit_code: i32,
    timed_out: bool,
    wall_ms: i64,
    merged_parameters: Map<String, Value>,
    output: Option<Value>,
    stderr: String,
    fanout_count: usize,
}

/// Execute a single task from the queue.
pub fn run_once(db: &Database, config: &Config) -> Result<RunOutcome> {
    let worker_id = Config::worker_id();

    if db.kill_switch_active()? {
        warn!("Kill switch is active; exiting");
        return Ok(RunOutcome::KillSwitch);
    }
    if db.paused()? {
        info!("Task processing is paused");
        return Ok(RunOutcome::NoTask);
    }

    let Some(entry) = db.claim_task(&worker_id, config.lease_seconds)? else {
        return Ok(RunOutcome::NoTask);
    };

    info!(
        queue_id = entry.queue_id,
        task_id = %entry.task_id,
        "Acquired task"
    );

    let Some(def) = db.task(&entry.task_id)? else {
        warn!(task_id = %entry.task_id, "Task definition not found");
        db.complete_task(entry.queue_id, NodeStatus::Failed)?;
        return Ok(RunOutcome::Failed);
    };

    if !def.enabled {
        warn!(task_id = %entry.task_id, "Task is disabled");
        db.complete_task(entry.queue_id, NodeStatus::Cancelled)?;
        return Ok(RunOutcome::Failed);
    }

    // Queue parameters override the task's defaults.
    let mut merged = def.default_params.clone();
    if let Value::Object(map) = &entry.parameters {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }

    let runner = SubprocessRunner::new(config.db_path.clone());
    let exec = runner.run(
        &def,
        &merged,
        &Value::Object(Map::new()),
        entry.queue_id,
        "",
    )?;

    // The row may have been cancelled while the child was running.
    let status = if db.task_queue_cancelled(entry.queue_id)? {
        info!(queue_id = entry.queue_id, "Task was cancelled during execution");
        NodeStatus::Cancelled
    } else if exec.succeeded() {
        NodeStatus::Done
    } else {
        NodeStatus::Failed
    };

    let fanout = if status == NodeStatus::Done {
        db.process_fanout(entry.queue_id)?
    } else {
        Vec::new()
    };
    if !fanout.is_empty() {
        info!(count = fanout.len(), "Created fan-out tasks");
    }

    db.complete_task(entry.queue_id, status)?;

    let task_result = parse_task_result(&exec.stdout);
    let record = RunRecord {
        run_id: Uuid::now_v7().to_string(),
        queue_id: entry.queue_id,
        request_id: entry.request_id.clone(),
        task_id: entry.task_id.clone(),
        worker_id,
        status: status.as_str().to_string(),
        exit_code: exec.exit_code,
        timed_out: exec.timed_out,
        wall_ms: exec.wall_ms,
        merged_parameters: merged,
        output: task_result.output,
        stderr: exec.stderr,
        fanout_count: fanout.len(),
    };
    if let Err(e) = save_run_output(&config.runs_dir, &record) {
        warn!("Failed to save run artifact: {}", e);
    }

    Ok(if status == NodeStatus::Done {
        RunOutcome::Completed
    } else {
        RunOutcome::Failed
    })
}

fn save_run_output(runs_dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    std::fs::create_dir_all(runs_dir)?;
    let safe_task_id: String = record
        .task_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let short_run: String = record.run_id.chars().take(8).collect();
    let path = runs_dir.join(format!("run_{}_{}.json", safe_task_id, short_run));
    std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::NoTask.exit_code(), 1);
        assert_eq!(RunOutcome::Failed.exit_code(), 2);
        assert_eq!(RunOutcome::KillSwitch.exit_code(), 3);
    }
}
