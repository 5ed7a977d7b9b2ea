//! The stack engine: drains an execution stack in LIFO order while
//! accumulating context across executions.
//!
//! Exactly three operations: [`StackEngine::create`],
//! [`StackEngine::run_one_step`], and [`StackEngine::run_to_completion`].
//! One node runs at a time within a stack; parallelism comes from
//! multiple workers each owning a different stack.

pub mod context;
pub mod result;

use crate::db::Database;
use crate::error::RunnerError;
use crate::exec::SubprocessRunner;
use crate::types::{NodeStatus, StackInfo, StackNode, StackStatus, TaskDefinition};
use anyhow::{anyhow, Result};
use context::StackContext;
use result::{parse_task_result, TaskResult};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Result of driving one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A node was executed and the stack may have more work.
    More,
    /// The stack reached a terminal status.
    Terminal(StackStatus),
}

/// Error message recorded on nodes cancelled by a failure cascade.
const CASCADE_CANCEL_MESSAGE: &str = "parent stack failed";
/// Error message recorded on nodes cancelled by an abort.
const ABORT_CANCEL_MESSAGE: &str = "stack aborted by task";

/// Drives execution stacks against the durable store.
pub struct StackEngine {
    db: Database,
    runner: SubprocessRunner,
    worker_id: String,
    lease_seconds: i64,
}

impl StackEngine {
    pub fn new(
        db: Database,
        runner: SubprocessRunner,
        worker_id: impl Into<String>,
        lease_seconds: i64,
    ) -> Self {
        Self {
            db,
            runner,
            worker_id: worker_id.into(),
            lease_seconds,
        }
    }

    /// Create a stack for a request and queue its root node. Idempotent
    /// on `request_id`. Refuses when the kill switch is set or the task
    /// is unknown/disabled.
    pub fn create(&self, request_id: &str, task_id: &str, parameters: &Value) -> Result<String> {
        if self.db.kill_switch_active()? {
            return Err(RunnerError::kill_switch().into());
        }
        let def = self
            .db
            .task(task_id)?
            .ok_or_else(|| anyhow!(RunnerError::task_not_found(task_id)))?;
        if !def.enabled {
            return Err(
                RunnerError::invalid_state(format!("Task is disabled: {}", task_id)).into(),
            );
        }

        let created = self.db.create_stack(request_id, task_id, parameters)?;
        if created.is_new {
            info!(stack_id = %created.stack_id, task_id, "Created stack");
        } else {
            debug!(stack_id = %created.stack_id, "Stack already exists for request");
        }
        Ok(created.stack_id)
    }

    /// Execute the next node of the stack, if any.
    pub fn run_one_step(&self, stack_id: &str) -> Result<StepOutcome> {
        let info = self
            .db
            .stack_info(stack_id)?
            .ok_or_else(|| anyhow!(RunnerError::stack_not_found(stack_id)))?;
        if info.status.is_terminal() {
            return Ok(StepOutcome::Terminal(info.status));
        }

        let Some(node) = self
            .db
            .acquire_stack_node(stack_id, &self.worker_id, self.lease_seconds)?
        else {
            // Nothing acquirable. A node under a live lease (another
            // worker resuming, or a crashed run whose lease has not yet
            // expired) means the stack is not finished.
            if self.db.stack_has_open_nodes(stack_id)? {
                return Err(RunnerError::invalid_state(format!(
                    "Stack {} has a leased node still running",
                    stack_id
                ))
                .into());
            }
            // No queued nodes remain: clean termination.
            let context = StackContext::from_value(&self.db.stack_context(stack_id)?);
            let final_output = context.last_output().cloned();
            self.db.finalize_stack(
                stack_id,
                StackStatus::Done,
                final_output.as_ref(),
                None,
            )?;
            info!(stack_id, "Stack complete");
            return Ok(StepOutcome::Terminal(StackStatus::Done));
        };

        debug!(
            stack_id,
            queue_id = node.queue_id,
            task_id = %node.task_id,
            depth = node.depth,
            "Executing node"
        );

        let Some(def) = self.db.task(&node.task_id)? else {
            let message = format!("Task not found: {}", node.task_id);
            warn!(stack_id, queue_id = node.queue_id, "{}", message);
            self.db.finalize_node(
                node.queue_id,
                NodeStatus::Failed,
                None,
                Some(&node.input_context),
                &[],
                Some(&message),
            )?;
            return self.fail(stack_id, &message);
        };
        // The enabled flag gates submissions only; in-flight stacks run
        // a definition even if it was disabled after create.

        self.execute_node(stack_id, &node, &def)
    }

    /// Drain the stack to a terminal status.
    pub fn run_to_completion(&self, stack_id: &str) -> Result<StackInfo> {
        loop {
            match self.run_one_step(stack_id)? {
                StepOutcome::More => continue,
                StepOutcome::Terminal(_) => break,
            }
        }
        self.db
            .stack_info(stack_id)?
            .ok_or_else(|| anyhow!(RunnerError::stack_not_found(stack_id)))
    }

    /// Force a running stack to `failed` (worker timeout path): cancels
    /// queued nodes and freezes the stack.
    pub fn fail_stack(&self, stack_id: &str, error: &str) -> Result<StackInfo> {
        self.fail(stack_id, error)?;
        self.db
            .stack_info(stack_id)?
            .ok_or_else(|| anyhow!(RunnerError::stack_not_found(stack_id)))
    }

    fn fail(&self, stack_id: &str, error: &str) -> Result<StepOutcome> {
        self.db
            .cancel_queued_nodes(stack_id, CASCADE_CANCEL_MESSAGE)?;
        self.db
            .finalize_stack(stack_id, StackStatus::Failed, None, Some(error))?;
        Ok(StepOutcome::Terminal(StackStatus::Failed))
    }

    fn execute_node(
        &self,
        stack_id: &str,
        node: &StackNode,
        def: &TaskDefinition,
    ) -> Result<StepOutcome> {
        let merged_params = merge_params(&def.default_params, &node.parameters);

        let exec = self.runner.run(
            def,
            &merged_params,
            &node.input_context,
            node.queue_id,
            stack_id,
        )?;

        let mut task_result = if exec.succeeded() {
            parse_task_result(&exec.stdout)
        } else {
            let mut raw = TaskResult::raw(&exec.stdout);
            raw.errors.push(exec.failure_message());
            raw
        };

        let input_context = StackContext::from_value(&node.input_context);
        let output_context = input_context.fold(&task_result);
        let output_context_value = output_context.to_value();

        if !exec.succeeded() {
            let message = exec.failure_message();
            warn!(
                stack_id,
                queue_id = node.queue_id,
                task_id = %node.task_id,
                "Node failed: {}",
                message
            );
            self.db.update_stack_context(stack_id, &output_context_value)?;
            self.db.finalize_node(
                node.queue_id,
                NodeStatus::Failed,
                task_result.output.as_ref(),
                Some(&output_context_value),
                &[],
                Some(&message),
            )?;
            return self.fail(stack_id, &message);
        }

        // Enqueue children before finalizing so the trace records them
        // on the node that contributed them.
        let pushed = std::mem::take(&mut task_result.pushed_children);
        if !pushed.is_empty() {
            self.db.push_children(
                stack_id,
                node.queue_id,
                node.depth,
                &pushed,
                &output_context_value,
            )?;
            debug!(
                stack_id,
                queue_id = node.queue_id,
                count = pushed.len(),
                "Pushed children"
            );
        }

        self.db.update_stack_context(stack_id, &output_context_value)?;
        self.db.finalize_node(
            node.queue_id,
            NodeStatus::Done,
            task_result.output.as_ref(),
            Some(&output_context_value),
            &pushed,
            None,
        )?;

        if task_result.abort {
            info!(stack_id, queue_id = node.queue_id, "Abort requested; cancelling stack");
            self.db
                .cancel_queued_nodes(stack_id, ABORT_CANCEL_MESSAGE)?;
            self.db.finalize_stack(
                stack_id,
                StackStatus::Cancelled,
                output_context.last_output(),
                Some(ABORT_CANCEL_MESSAGE),
            )?;
            return Ok(StepOutcome::Terminal(StackStatus::Cancelled));
        }

        Ok(StepOutcome::More)
    }
}

/// Overlay submission parameters on the task's defaults, key by key.
fn merge_params(defaults: &Map<String, Value>, overrides: &Value) -> Map<String, Value> {
    let mut merged = defaults.clone();
    if let Value::Object(map) = overrides {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}
