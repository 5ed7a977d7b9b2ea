//! Structured error types surfaced by the submission surface and the CLI.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,
    InvalidState,
    DependencyCycle,
    DependencyMissing,

    // Not found errors
    TaskNotFound,
    RequestNotFound,
    StackNotFound,
    RuleNotFound,

    // Conflict errors
    AlreadyExists,
    ClaimContention,

    // Execution errors
    SubprocessFailure,
    ResultParseError,
    WorkerTimeout,
    KillSwitchActive,

    // Internal errors
    BackendUnavailable,
    DatabaseError,
    InternalError,
}

impl ErrorCode {
    /// True for errors the caller can fix by changing the input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorCode::MissingRequiredField
                | ErrorCode::InvalidFieldValue
                | ErrorCode::InvalidState
                | ErrorCode::DependencyCycle
                | ErrorCode::DependencyMissing
                | ErrorCode::TaskNotFound
                | ErrorCode::RequestNotFound
                | ErrorCode::StackNotFound
                | ErrorCode::RuleNotFound
        )
    }

    /// True for transient errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::BackendUnavailable | ErrorCode::DatabaseError | ErrorCode::ClaimContention
        )
    }
}

/// Structured error carried across the library boundary.
#[derive(Debug, Serialize)]
pub struct RunnerError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl RunnerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn request_not_found(request_id: &str) -> Self {
        Self::new(
            ErrorCode::RequestNotFound,
            format!("Request not found: {}", request_id),
        )
    }

    pub fn stack_not_found(stack_id: &str) -> Self {
        Self::new(
            ErrorCode::StackNotFound,
            format!("Stack not found: {}", stack_id),
        )
    }

    pub fn rule_not_found(rule_id: &str) -> Self {
        Self::new(ErrorCode::RuleNotFound, format!("Rule not found: {}", rule_id))
    }

    pub fn dependency_cycle(request_id: &str, dep_id: &str) -> Self {
        Self::new(
            ErrorCode::DependencyCycle,
            format!(
                "Dependency {} -> {} would create a cycle",
                request_id, dep_id
            ),
        )
    }

    pub fn dependency_missing(dep_id: &str) -> Self {
        Self::new(
            ErrorCode::DependencyMissing,
            format!("Declared dependency does not exist: {}", dep_id),
        )
        .with_field("depends_on")
    }

    pub fn kill_switch() -> Self {
        Self::new(
            ErrorCode::KillSwitchActive,
            "Kill switch is active; refusing new work",
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }

    /// CLI exit code: 0 reserved for success, 2 for input errors,
    /// 3 for transient backend errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.code.is_validation() {
            2
        } else if self.code.is_transient() {
            3
        } else {
            1
        }
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RunnerError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for RunnerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RunnerError>() {
            Ok(runner_err) => runner_err,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(db_err) => RunnerError::database(db_err),
                Err(err) => RunnerError::internal(err),
            },
        }
    }
}

impl From<rusqlite::Error> for RunnerError {
    fn from(err: rusqlite::Error) -> Self {
        RunnerError::database(err)
    }
}

/// Result type for surface operations.
pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_input_from_backend() {
        assert_eq!(RunnerError::task_not_found("x").exit_code(), 2);
        assert_eq!(RunnerError::invalid_value("priority", "out of range").exit_code(), 2);
        assert_eq!(RunnerError::database("locked").exit_code(), 3);
        assert_eq!(RunnerError::internal("boom").exit_code(), 1);
    }

    #[test]
    fn anyhow_downcast_preserves_code() {
        let err: anyhow::Error = RunnerError::dependency_missing("r1").into();
        let back = RunnerError::from(err);
        assert_eq!(back.code, ErrorCode::DependencyMissing);
    }
}
