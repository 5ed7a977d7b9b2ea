//! Processor daemon: bridges the request queue to the stack engine.
//!
//! Each tick claims at most one request, drives its stack to a terminal
//! status, settles the request, and lets dependency resolution fire.
//! One request at a time per worker; concurrency comes from running
//! several workers against the same graph store.

use crate::config::Config;
use crate::db::Database;
use crate::engine::{StackEngine, StepOutcome};
use crate::exec::SubprocessRunner;
use crate::graph::GraphStore;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::types::{RequestStatus, StackInfo, StackStatus, TaskRequest};
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Idle backoff cap as a multiple of the poll interval.
const MAX_IDLE_BACKOFF_MULTIPLIER: u32 = 8;
/// Error recorded when a stack overruns its aggregate budget.
const WORKER_TIMEOUT_ERROR: &str = "worker timeout";

/// Queue statistics for the `--stats` path.
#[derive(Debug, Serialize)]
pub struct DaemonStats {
    pub worker_id: String,
    pub processed: u64,
    pub failed: u64,
    pub queue: std::collections::BTreeMap<String, i64>,
}

pub struct ProcessorDaemon {
    db: Database,
    graph: GraphStore,
    engine: StackEngine,
    config: Config,
    worker_id: String,
    shutdown: Arc<AtomicBool>,
    requests_processed: u64,
    requests_failed: u64,
}

impl ProcessorDaemon {
    pub fn new(db: Database, graph: GraphStore, config: Config) -> Self {
        let worker_id = Config::worker_id();
        let runner = SubprocessRunner::new(config.db_path.clone());
        let engine = StackEngine::new(db.clone(), runner, worker_id.clone(), config.lease_seconds);
        Self {
            db,
            graph,
            engine,
            config,
            worker_id,
            shutdown: Arc::new(AtomicBool::new(false)),
            requests_processed: 0,
            requests_failed: 0,
        }
    }

    /// Flag checked between ticks and settlement retries; set it from a
    /// signal handler to stop accepting new claims.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Settlement must not be dropped: retry forever, bounded only by
    /// the shutdown flag polled between attempts.
    fn retry_policy(&self) -> RetryPolicy {
        let mut config = RetryConfig::from(&self.config.retry);
        config.max_retries = None;
        RetryPolicy::new(config)
    }

    /// Process a single request if one is claimable.
    /// Returns true when a request was processed.
    pub fn process_one(&mut self) -> Result<bool> {
        if self.db.kill_switch_active()? {
            warn!("Kill switch is active; not claiming");
            return Ok(false);
        }

        let Some(request) = self.graph.claim_next(&self.worker_id)? else {
            return Ok(false);
        };

        info!(
            request_id = %request.request_id,
            task_id = %request.task_id,
            priority = request.priority,
            "Claimed request"
        );

        self.graph.mark_executing(&request.request_id)?;

        match self.execute_request(&request) {
            Ok(info) => {
                self.settle(&request, &info)?;
                if let Err(e) = save_stack_output(&self.config.runs_dir, &info) {
                    warn!(stack_id = %info.stack_id, "Failed to save run artifact: {}", e);
                }
            }
            Err(e) => {
                // Stack could not be built or driven (catalog missing,
                // store unavailable). Settle failed; not retried.
                warn!(request_id = %request.request_id, "Request failed: {}", e);
                self.settle_failed(&request.request_id, &e.to_string())?;
            }
        }

        Ok(true)
    }

    /// Build the stack for a request and drive it within the aggregate
    /// timeout budget.
    fn execute_request(&self, request: &TaskRequest) -> Result<StackInfo> {
        let stack_id =
            self.engine
                .create(&request.request_id, &request.task_id, &request.parameters)?;

        let deadline = Instant::now()
            + Duration::from_secs(self.config.stack_timeout_seconds.max(1) as u64);

        loop {
            if Instant::now() >= deadline {
                warn!(stack_id = %stack_id, "Stack exceeded its timeout budget");
                return self.engine.fail_stack(&stack_id, WORKER_TIMEOUT_ERROR);
            }
            match self.engine.run_one_step(&stack_id)? {
                StepOutcome::More => continue,
                StepOutcome::Terminal(_) => break,
            }
        }

        self.engine.run_to_completion(&stack_id)
    }

    /// Settle the request from the stack's terminal status, retrying
    /// settlement until it sticks or shutdown wins.
    fn settle(&mut self, request: &TaskRequest, info: &StackInfo) -> Result<()> {
        if info.status == StackStatus::Done {
            let policy = self.retry_policy();
            let graph = self.graph.clone();
            let request_id = request.request_id.clone();
            let result_ref = info.stack_id.clone();
            let shutdown = Arc::clone(&self.shutdown);
            policy.execute(
                move || graph.mark_done(&request_id, &result_ref).map(|_| ()),
                move || !shutdown.load(Ordering::Relaxed),
            )?;
            self.requests_processed += 1;
            info!(request_id = %request.request_id, stack_id = %info.stack_id, "Request done");
        } else {
            let message = info
                .error_message
                .clone()
                .unwrap_or_else(|| format!("Stack ended with status: {}", info.status.as_str()));
            self.settle_failed(&request.request_id, &message)?;
        }
        Ok(())
    }

    fn settle_failed(&mut self, request_id: &str, error: &str) -> Result<()> {
        let policy = self.retry_policy();
        let graph = self.graph.clone();
        let request_id_owned = request_id.to_string();
        let error_owned = error.to_string();
        let shutdown = Arc::clone(&self.shutdown);
        policy.execute(
            move || graph.mark_failed(&request_id_owned, &error_owned),
            move || !shutdown.load(Ordering::Relaxed),
        )?;
        self.requests_failed += 1;
        info!(request_id, "Request failed: {}", error);
        Ok(())
    }

    /// Poll loop: claim, execute, settle, repeat until shutdown.
    pub fn run_loop(&mut self) {
        info!(worker_id = %self.worker_id, "Request processor starting");

        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut idle_count: u32 = 0;

        while !self.shutting_down() {
            match self.process_one() {
                Ok(true) => {
                    idle_count = 0;
                }
                Ok(false) => {
                    // Bounded backoff while the queue is empty.
                    idle_count = idle_count.saturating_add(1);
                    let multiplier = idle_count.min(MAX_IDLE_BACKOFF_MULTIPLIER);
                    std::thread::sleep(poll * multiplier);
                }
                Err(e) => {
                    error!("Error in processing loop: {}", e);
                    std::thread::sleep(poll);
                }
            }
        }

        info!(
            processed = self.requests_processed,
            failed = self.requests_failed,
            "Processor stopped"
        );
    }

    /// Current processor and queue statistics.
    pub fn stats(&self) -> Result<DaemonStats> {
        let mut queue = std::collections::BTreeMap::new();
        for status in [
            RequestStatus::Pending,
            RequestStatus::Blocked,
            RequestStatus::Claimed,
            RequestStatus::Executing,
            RequestStatus::Done,
            RequestStatus::Failed,
            RequestStatus::Cancelled,
        ] {
            let count = self.graph.count(status)?;
            if count > 0 {
                queue.insert(status.as_str().to_string(), count);
            }
        }
        Ok(DaemonStats {
            worker_id: self.worker_id.clone(),
            processed: self.requests_processed,
            failed: self.requests_failed,
            queue,
        })
    }
}

/// Save a finished stack's snapshot under the runs directory.
pub fn save_stack_output(runs_dir: &Path, info: &StackInfo) -> Result<PathBuf> {
    std::fs::create_dir_all(runs_dir)?;
    let short_id: String = info.stack_id.chars().take(8).collect();
    let path = runs_dir.join(format!("stack_{}.json", short_id));
    let json = serde_json::to_string_pretty(info)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_stack_output_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let info = StackInfo {
            stack_id: "0123456789abcdef".into(),
            created_at: 1,
            finished_at: Some(2),
            status: StackStatus::Done,
            initial_request_id: "r1".into(),
            initial_task_id: "t1".into(),
            initial_params: serde_json::json!({}),
            context: serde_json::json!({}),
            trace: vec![],
            final_output: Some(serde_json::json!("out")),
            error_message: None,
        };

        let path = save_stack_output(dir.path(), &info).unwrap();
        assert!(path.ends_with("stack_01234567.json"));
        let content = std::fs::read_to_string(path).unwrap();
        let parsed: StackInfo = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.stack_id, info.stack_id);
        assert_eq!(parsed.final_output, info.final_output);
    }
}
