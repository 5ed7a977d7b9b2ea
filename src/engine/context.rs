//! The accumulated context that flows through a stack run.
//!
//! Semantically a left fold over task results: `fold` merges one
//! result's contribution into the context and every later-running node
//! observes everything earlier nodes contributed.

use super::result::TaskResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Monadic state carried across a stack's executions. All five
/// collections grow monotonically for the lifetime of the stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackContext {
    /// Named values; later writes overwrite earlier same-key writes.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// One entry per completed task (null when a task produced none).
    #[serde(default)]
    pub outputs: Vec<Value>,
    /// Audit trail of decision strings.
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Errors encountered so far.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Arbitrary metadata; same overwrite rule as `variables`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StackContext {
    /// Incorporate a task result: variables and metadata shallow-merge
    /// (result wins), the output is appended, decisions and errors are
    /// concatenated.
    pub fn fold(&self, result: &TaskResult) -> StackContext {
        let mut variables = self.variables.clone();
        for (k, v) in &result.variables {
            variables.insert(k.clone(), v.clone());
        }

        let mut outputs = self.outputs.clone();
        outputs.push(result.output.clone().unwrap_or(Value::Null));

        let mut decisions = self.decisions.clone();
        decisions.extend(result.decisions.iter().cloned());

        let mut errors = self.errors.clone();
        errors.extend(result.errors.iter().cloned());

        let mut metadata = self.metadata.clone();
        for (k, v) in &result.metadata {
            metadata.insert(k.clone(), v.clone());
        }

        StackContext {
            variables,
            outputs,
            decisions,
            errors,
            metadata,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Object(Map::new()))
    }

    pub fn from_value(value: &Value) -> StackContext {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// The last appended output, if any.
    pub fn last_output(&self) -> Option<&Value> {
        self.outputs.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result_with(f: impl FnOnce(&mut TaskResult)) -> TaskResult {
        let mut r = TaskResult::default();
        f(&mut r);
        r
    }

    #[test]
    fn fold_overwrites_variables_and_appends_outputs() {
        let ctx = StackContext::default();
        let ctx = ctx.fold(&result_with(|r| {
            r.output = Some(json!("first"));
            r.variables.insert("x".into(), json!(1));
            r.variables.insert("y".into(), json!("keep"));
        }));
        let ctx = ctx.fold(&result_with(|r| {
            r.output = Some(json!("second"));
            r.variables.insert("x".into(), json!(2));
        }));

        assert_eq!(ctx.variables["x"], json!(2));
        assert_eq!(ctx.variables["y"], json!("keep"));
        assert_eq!(ctx.outputs, vec![json!("first"), json!("second")]);
        assert_eq!(ctx.last_output(), Some(&json!("second")));
    }

    #[test]
    fn fold_appends_null_for_missing_output() {
        let ctx = StackContext::default().fold(&TaskResult::default());
        assert_eq!(ctx.outputs, vec![Value::Null]);
    }

    #[test]
    fn fold_concatenates_decisions_and_errors() {
        let ctx = StackContext::default();
        let ctx = ctx.fold(&result_with(|r| {
            r.decisions.push("chose a".into());
            r.errors.push("warning 1".into());
        }));
        let ctx = ctx.fold(&result_with(|r| {
            r.decisions.push("chose b".into());
        }));

        assert_eq!(ctx.decisions, vec!["chose a", "chose b"]);
        assert_eq!(ctx.errors, vec!["warning 1"]);
    }

    #[test]
    fn value_round_trip_tolerates_missing_fields() {
        let ctx = StackContext::from_value(&json!({"variables": {"a": 1}}));
        assert_eq!(ctx.variables["a"], json!(1));
        assert!(ctx.outputs.is_empty());

        let v = ctx.to_value();
        assert_eq!(StackContext::from_value(&v), ctx);
    }
}
