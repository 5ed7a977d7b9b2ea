//! Submission surface: the external, write-limited interface.
//!
//! Validates inputs, forwards writes to the graph store, and composes
//! read responses from the graph store and the stack store. No
//! execution power lives here.

use crate::db::Database;
use crate::error::{RunnerError, RunnerResult};
use crate::graph::GraphStore;
use crate::types::{
    NewRequest, Priority, RequestStatus, TaskKind, TraceEntry, PRIORITY_DEFAULT,
};
use serde::Serialize;
use serde_json::Value;

/// Response to a submit call.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub request_id: String,
    pub task_id: String,
    pub status: RequestStatus,
    pub priority: Priority,
    pub is_new: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// One dependency with its current status.
#[derive(Debug, Serialize)]
pub struct DependencyStatus {
    pub request_id: String,
    pub status: RequestStatus,
}

/// Response to a status call.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub request_id: String,
    pub task_id: String,
    pub status: RequestStatus,
    pub priority: Priority,
    pub requester: String,
    pub created_at: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub has_outputs: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyStatus>,
    /// Dependencies still holding this request back.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<DependencyStatus>,
}

/// Response to a result call.
#[derive(Debug, Serialize)]
pub struct ResultResponse {
    pub request_id: String,
    pub task_id: String,
    pub status: RequestStatus,
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<TraceEntry>>,
    /// Set when the request has not reached a terminal result yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Catalog entry as exposed to submitters.
#[derive(Debug, Serialize)]
pub struct TaskListing {
    pub task_id: String,
    pub kind: TaskKind,
    pub default_parameters: Value,
    pub timeout_seconds: i64,
    pub enabled: bool,
}

/// Response to a cancel call.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub request_id: String,
    pub status: RequestStatus,
    pub message: String,
}

/// One row of a pending listing.
#[derive(Debug, Serialize)]
pub struct RequestSummary {
    pub request_id: String,
    pub task_id: String,
    pub status: RequestStatus,
    pub priority: Priority,
    pub requester: String,
    pub created_at: i64,
}

/// Response to a list_pending call.
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub requests: Vec<RequestSummary>,
    pub returned: usize,
    pub total: i64,
    pub status_filter: RequestStatus,
}

/// The submission surface over the two stores.
#[derive(Clone)]
pub struct SubmissionSurface {
    db: Database,
    graph: GraphStore,
}

impl SubmissionSurface {
    pub fn new(db: Database, graph: GraphStore) -> Self {
        Self { db, graph }
    }

    /// Validate and insert a request. Idempotent on `request_id`.
    pub fn submit(
        &self,
        task_id: &str,
        parameters: Option<Value>,
        priority: Option<Priority>,
        request_id: Option<String>,
        depends_on: Vec<String>,
        requester: &str,
    ) -> RunnerResult<SubmitResponse> {
        let def = self
            .db
            .task(task_id)?
            .ok_or_else(|| RunnerError::task_not_found(task_id))?;
        if !def.enabled {
            return Err(RunnerError::invalid_state(format!(
                "Task is disabled: {}",
                task_id
            )));
        }

        let input = NewRequest {
            task_id: task_id.to_string(),
            parameters: parameters.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            priority: Some(priority.unwrap_or(PRIORITY_DEFAULT)),
            request_id,
            requester: requester.to_string(),
            depends_on: depends_on.clone(),
        };

        let outcome = self.graph.submit(input)?;
        let request = outcome.request();
        Ok(SubmitResponse {
            request_id: request.request_id.clone(),
            task_id: request.task_id.clone(),
            status: request.status,
            priority: request.priority,
            is_new: outcome.is_new(),
            depends_on,
        })
    }

    /// Status, timestamps, and dependency state of a request.
    pub fn status(&self, request_id: &str) -> RunnerResult<StatusResponse> {
        let request = self
            .graph
            .get(request_id)?
            .ok_or_else(|| RunnerError::request_not_found(request_id))?;

        let dependencies: Vec<DependencyStatus> = self
            .graph
            .dependencies(request_id)?
            .into_iter()
            .map(|(id, status)| DependencyStatus {
                request_id: id,
                status,
            })
            .collect();
        let blocked_by = dependencies
            .iter()
            .filter(|d| d.status != RequestStatus::Done)
            .map(|d| DependencyStatus {
                request_id: d.request_id.clone(),
                status: d.status,
            })
            .collect();

        let has_outputs = self.graph.produced_count(request_id)? > 0;

        Ok(StatusResponse {
            request_id: request.request_id,
            task_id: request.task_id,
            status: request.status,
            priority: request.priority,
            requester: request.requester,
            created_at: request.created_at,
            claimed_by: request.claimed_by,
            claimed_at: request.claimed_at,
            finished_at: request.finished_at,
            result_ref: request.result_ref,
            error: request.error,
            has_outputs,
            dependencies,
            blocked_by,
        })
    }

    /// Compose the request's `result_ref` with the stack snapshot.
    pub fn result(&self, request_id: &str, include_trace: bool) -> RunnerResult<ResultResponse> {
        let request = self
            .graph
            .get(request_id)?
            .ok_or_else(|| RunnerError::request_not_found(request_id))?;

        let mut response = ResultResponse {
            request_id: request.request_id.clone(),
            task_id: request.task_id.clone(),
            status: request.status,
            finished_at: request.finished_at,
            error: request.error.clone(),
            result_ref: request.result_ref.clone(),
            output: None,
            context: None,
            trace: None,
            message: None,
        };

        if !matches!(request.status, RequestStatus::Done | RequestStatus::Failed) {
            response.message = Some(format!(
                "Request is {}, not yet complete",
                request.status.as_str()
            ));
            return Ok(response);
        }

        if let Some(stack_id) = &request.result_ref {
            if let Some(info) = self.db.stack_info(stack_id)? {
                response.output = info.final_output.clone();
                response.context = Some(info.context.clone());
                if include_trace {
                    response.trace = Some(info.trace);
                }
            }
        }

        Ok(response)
    }

    /// List submittable tasks.
    pub fn list_tasks(
        &self,
        filter: Option<&str>,
        enabled_only: bool,
    ) -> RunnerResult<Vec<TaskListing>> {
        let defs = self.db.list_task_defs(filter, enabled_only)?;
        Ok(defs
            .into_iter()
            .map(|d| TaskListing {
                task_id: d.task_id,
                kind: d.kind,
                default_parameters: Value::Object(d.default_params),
                timeout_seconds: d.timeout_seconds,
                enabled: d.enabled,
            })
            .collect())
    }

    /// Cancel a pending or blocked request.
    pub fn cancel(&self, request_id: &str) -> RunnerResult<CancelResponse> {
        let request = self.graph.cancel(request_id)?;
        Ok(CancelResponse {
            request_id: request.request_id,
            status: request.status,
            message: "Request cancelled successfully".to_string(),
        })
    }

    /// List queued requests by status.
    pub fn list_pending(
        &self,
        limit: Option<i64>,
        status: Option<RequestStatus>,
    ) -> RunnerResult<PendingResponse> {
        let status = status.unwrap_or(RequestStatus::Pending);
        let limit = limit.unwrap_or(20).clamp(1, 100);

        let requests: Vec<RequestSummary> = self
            .graph
            .list(status, limit)?
            .into_iter()
            .map(|r| RequestSummary {
                request_id: r.request_id,
                task_id: r.task_id,
                status: r.status,
                priority: r.priority,
                requester: r.requester,
                created_at: r.created_at,
            })
            .collect();
        let total = self.graph.count(status)?;

        Ok(PendingResponse {
            returned: requests.len(),
            requests,
            total,
            status_filter: status,
        })
    }
}
