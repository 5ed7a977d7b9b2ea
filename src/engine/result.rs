//! The child-process result protocol.
//!
//! A task communicates a structured result by printing, as its last
//! non-empty stdout line, a JSON object whose `__task_result__` field is
//! truthy. Anything else is treated as a raw string output with an empty
//! context delta, which accommodates noisy tasks that print progress
//! logs before their result line.

use crate::types::PushedChild;
use serde_json::{Map, Value};

/// Marker field identifying a structured task result.
pub const RESULT_MARKER: &str = "__task_result__";

/// The contribution one execution makes to the stack.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    /// Value appended to the context's `outputs`.
    pub output: Option<Value>,
    pub variables: Map<String, Value>,
    pub decisions: Vec<String>,
    pub errors: Vec<String>,
    pub metadata: Map<String, Value>,
    /// Children to enqueue, in declared order.
    pub pushed_children: Vec<PushedChild>,
    /// Terminate the stack as cancelled after folding this result.
    pub abort: bool,
}

impl TaskResult {
    /// A raw (unstructured) result carrying stdout as the output.
    pub fn raw(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        TaskResult {
            output: if trimmed.is_empty() {
                None
            } else {
                Some(Value::String(trimmed.to_string()))
            },
            ..Default::default()
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn string_vec(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn object_map(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Parse a structured result out of captured stdout.
///
/// Scans lines bottom-up for a JSON object with a truthy marker (last
/// result wins when a task prints several). Missing fields default to
/// empty/false. Returns a raw result when no marker line is found.
pub fn parse_task_result(stdout: &str) -> TaskResult {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if !(line.starts_with('{') && line.ends_with('}')) {
            continue;
        }
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if !data.get(RESULT_MARKER).map(is_truthy).unwrap_or(false) {
            continue;
        }

        let pushed_children = data
            .get("pushed_children")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| serde_json::from_value::<PushedChild>(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        return TaskResult {
            output: data.get("output").cloned(),
            variables: object_map(data.get("variables")),
            decisions: string_vec(data.get("decisions")),
            errors: string_vec(data.get("errors")),
            metadata: object_map(data.get("metadata")),
            pushed_children,
            abort: data.get("abort").map(is_truthy).unwrap_or(false),
        };
    }

    TaskResult::raw(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_marked_last_line() {
        let stdout = "progress 1/3\nprogress 2/3\n{\"__task_result__\": true, \"output\": \"Hello World\"}\n";
        let result = parse_task_result(stdout);
        assert_eq!(result.output, Some(json!("Hello World")));
        assert!(!result.abort);
        assert!(result.pushed_children.is_empty());
    }

    #[test]
    fn last_marked_line_wins() {
        let stdout = "{\"__task_result__\": true, \"output\": 1}\n{\"__task_result__\": true, \"output\": 2}\n";
        let result = parse_task_result(stdout);
        assert_eq!(result.output, Some(json!(2)));
    }

    #[test]
    fn unmarked_json_falls_back_to_raw() {
        let stdout = "{\"output\": \"not a result\"}";
        let result = parse_task_result(stdout);
        assert_eq!(result.output, Some(json!("{\"output\": \"not a result\"}")));
        assert!(result.variables.is_empty());
    }

    #[test]
    fn empty_stdout_has_no_output() {
        let result = parse_task_result("");
        assert!(result.output.is_none());
        let result = parse_task_result("  \n  \n");
        assert!(result.output.is_none());
    }

    #[test]
    fn parses_pushed_children_in_declared_order() {
        let stdout = r#"{"__task_result__": 1, "pushed_children": [{"task_id": "a"}, {"task_id": "b", "parameters": {"n": 2}, "reason": "follow-up"}]}"#;
        let result = parse_task_result(stdout);
        assert_eq!(result.pushed_children.len(), 2);
        assert_eq!(result.pushed_children[0].task_id, "a");
        assert_eq!(result.pushed_children[1].task_id, "b");
        assert_eq!(result.pushed_children[1].parameters, json!({"n": 2}));
        assert_eq!(result.pushed_children[1].reason, "follow-up");
    }

    #[test]
    fn abort_and_delta_fields_parse() {
        let stdout = r#"{"__task_result__": true, "abort": true, "variables": {"k": "v"}, "decisions": ["stop"], "errors": ["bad input"], "metadata": {"m": 1}}"#;
        let result = parse_task_result(stdout);
        assert!(result.abort);
        assert_eq!(result.variables["k"], json!("v"));
        assert_eq!(result.decisions, vec!["stop"]);
        assert_eq!(result.errors, vec!["bad input"]);
        assert_eq!(result.metadata["m"], json!(1));
    }

    #[test]
    fn falsy_marker_is_not_a_result() {
        let stdout = "{\"__task_result__\": false, \"output\": \"x\"}";
        let result = parse_task_result(stdout);
        // Raw fallback keeps the whole line as a string
        assert!(matches!(result.output, Some(Value::String(_))));
        assert!(result.variables.is_empty());
    }
}
