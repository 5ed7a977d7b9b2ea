//! Core types for the stack runner.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request priority as an integer (higher = claimed sooner).
/// Valid range is 1..=1000; the default for submissions is 100.
pub type Priority = i32;

/// Lowest accepted priority.
pub const PRIORITY_MIN: Priority = 1;
/// Highest accepted priority.
pub const PRIORITY_MAX: Priority = 1000;
/// Default priority for submissions that do not specify one.
pub const PRIORITY_DEFAULT: Priority = 100;

/// How a task's code is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Shell command template; `{name}` placeholders are substituted
    /// from the parameter map before invocation.
    Cli,
    /// Inline Python source, written to a temp file and run with python3.
    Python,
    /// Path to a Python file, resolved against the working directory.
    PythonFile,
    /// Inline TypeScript source, run with `npx ts-node`.
    Typescript,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Cli => "cli",
            TaskKind::Python => "python",
            TaskKind::PythonFile => "python_file",
            TaskKind::Typescript => "typescript",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cli" => Some(TaskKind::Cli),
            "python" => Some(TaskKind::Python),
            "python_file" => Some(TaskKind::PythonFile),
            "typescript" => Some(TaskKind::Typescript),
            _ => None,
        }
    }
}

/// A task definition from the catalog. Immutable during a stack run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub kind: TaskKind,
    pub code: String,
    /// Default parameters; submission parameters overlay these key-by-key.
    pub default_params: serde_json::Map<String, Value>,
    pub working_dir: Option<String>,
    pub env: std::collections::HashMap<String, String>,
    pub timeout_seconds: i64,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Terminal and non-terminal states of an execution stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::Running => "running",
            StackStatus::Done => "done",
            StackStatus::Failed => "failed",
            StackStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(StackStatus::Running),
            "done" => Some(StackStatus::Done),
            "failed" => Some(StackStatus::Failed),
            "cancelled" => Some(StackStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StackStatus::Running)
    }
}

/// Per-node state machine: queued → running → (done | failed | cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::Done => "done",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(NodeStatus::Queued),
            "running" => Some(NodeStatus::Running),
            "done" => Some(NodeStatus::Done),
            "failed" => Some(NodeStatus::Failed),
            "cancelled" => Some(NodeStatus::Cancelled),
            _ => None,
        }
    }
}

/// Lifecycle of a request in the graph store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Blocked,
    Claimed,
    Executing,
    Done,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Blocked => "blocked",
            RequestStatus::Claimed => "claimed",
            RequestStatus::Executing => "executing",
            RequestStatus::Done => "done",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "blocked" => Some(RequestStatus::Blocked),
            "claimed" => Some(RequestStatus::Claimed),
            "executing" => Some(RequestStatus::Executing),
            "done" => Some(RequestStatus::Done),
            "failed" => Some(RequestStatus::Failed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }
}

/// A work item in the graph-backed request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub request_id: String,
    pub task_id: String,
    pub parameters: Value,
    pub status: RequestStatus,
    pub priority: Priority,
    pub requester: String,
    pub created_at: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
}

/// Input for submitting a request.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub task_id: String,
    pub parameters: Value,
    pub priority: Option<Priority>,
    /// Idempotency key; generated when absent.
    pub request_id: Option<String>,
    pub requester: String,
    pub depends_on: Vec<String>,
}

impl NewRequest {
    pub fn new(task_id: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            parameters: Value::Object(serde_json::Map::new()),
            priority: None,
            request_id: None,
            requester: requester.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// A declarative trigger: when a matching source artifact is committed,
/// materialize a new request for `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeRule {
    pub rule_id: String,
    pub description: Option<String>,
    /// Match sources with this kind; None matches every kind.
    pub source_kind: Option<String>,
    pub task_id: String,
    /// JSON text with `$source.<field>` placeholders.
    pub parameter_template: String,
    pub priority: Priority,
    pub enabled: bool,
    pub created_at: i64,
}

/// A source artifact committed to the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceNode {
    pub source_id: String,
    pub kind: String,
    pub attrs: serde_json::Map<String, Value>,
    pub created_at: i64,
}

/// A child specification contributed by a task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushedChild {
    pub task_id: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub reason: String,
}

/// One task invocation inside a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackNode {
    pub queue_id: i64,
    pub request_id: String,
    pub stack_id: String,
    pub task_id: String,
    pub depth: i64,
    pub parent_queue_id: Option<i64>,
    pub sequence: i64,
    pub status: NodeStatus,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub parameters: Value,
    pub input_context: Value,
    pub output: Option<Value>,
    pub output_context: Option<Value>,
    pub pushed_children: Vec<PushedChild>,
    pub error_message: Option<String>,
}

/// Snapshot of a node at termination, sufficient to reconstruct what
/// happened without re-reading the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub queue_id: i64,
    pub request_id: String,
    pub task_id: String,
    pub depth: i64,
    pub status: NodeStatus,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub execution_ms: i64,
    pub input_context: Value,
    pub output: Option<Value>,
    pub pushed_children: Vec<PushedChild>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A durable container for one LIFO run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackInfo {
    pub stack_id: String,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub status: StackStatus,
    pub initial_request_id: String,
    pub initial_task_id: String,
    pub initial_params: Value,
    pub context: Value,
    pub trace: Vec<TraceEntry>,
    pub final_output: Option<Value>,
    pub error_message: Option<String>,
}
