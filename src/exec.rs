//! Subprocess runner: launches a task's code in a child process and
//! captures its result.
//!
//! The child receives the execution contract through environment
//! variables (`TASK_PARAMS`, `TASK_CONTEXT`, `TASK_QUEUE_ID`,
//! `TASK_STACK_ID`, `TASK_DB`) plus the definition's own `env` map.
//! Standard input is closed; stdout and stderr are buffered in full.

use crate::types::{TaskDefinition, TaskKind};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Outcome of one child process execution. Process-level failures
/// (non-zero exit, timeout, spawn error) are data, not `Err`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub wall_ms: i64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Human-readable failure description for node error messages.
    pub fn failure_message(&self) -> String {
        if self.timed_out {
            format!("Timed out: {}", self.stderr.trim())
        } else if self.stderr.trim().is_empty() {
            format!("Exit code: {}", self.exit_code)
        } else {
            format!("Exit code: {}; stderr: {}", self.exit_code, self.stderr.trim())
        }
    }
}

/// Launches task code per its kind with the standard environment.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    db_path: PathBuf,
}

impl SubprocessRunner {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Run a task definition with merged parameters and the current
    /// context. Blocks until the child exits or the timeout fires.
    pub fn run(
        &self,
        def: &TaskDefinition,
        params: &Map<String, Value>,
        context: &Value,
        queue_id: i64,
        stack_id: &str,
    ) -> Result<ExecutionResult> {
        let started = std::time::Instant::now();
        let timeout = Duration::from_secs(def.timeout_seconds.max(1) as u64);

        // A temp file must outlive the child for inline kinds.
        let mut script_file = None;

        let mut command = match def.kind {
            TaskKind::Cli => {
                let rendered = render_template(&def.code, params);
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(rendered);
                cmd
            }
            TaskKind::Python => {
                let file = write_script(&def.code, ".py")?;
                let mut cmd = Command::new("python3");
                cmd.arg(file.path());
                script_file = Some(file);
                cmd
            }
            TaskKind::Typescript => {
                let file = write_script(&def.code, ".ts")?;
                let mut cmd = Command::new("npx");
                cmd.arg("ts-node").arg(file.path());
                script_file = Some(file);
                cmd
            }
            TaskKind::PythonFile => {
                let script = resolve_script_path(&def.code, def.working_dir.as_deref());
                if !script.exists() {
                    return Ok(ExecutionResult {
                        exit_code: -2,
                        stdout: String::new(),
                        stderr: format!("Python file not found: {}", script.display()),
                        timed_out: false,
                        wall_ms: started.elapsed().as_millis() as i64,
                    });
                }
                let mut cmd = Command::new("python3");
                cmd.arg(script);
                cmd
            }
        };

        if let Some(dir) = &def.working_dir {
            command.current_dir(dir);
        }

        command
            .envs(&def.env)
            .env("TASK_PARAMS", serde_json::to_string(params)?)
            .env("TASK_CONTEXT", serde_json::to_string(context)?)
            .env("TASK_QUEUE_ID", queue_id.to_string())
            .env("TASK_STACK_ID", stack_id)
            .env("TASK_DB", &self.db_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ExecutionResult {
                    exit_code: -2,
                    stdout: String::new(),
                    stderr: format!("Execution error: {}", e),
                    timed_out: false,
                    wall_ms: started.elapsed().as_millis() as i64,
                });
            }
        };

        let result = match child
            .wait_timeout(timeout)
            .context("Failed waiting on child process")?
        {
            Some(status) => {
                let stdout = read_pipe(child.stdout.take());
                let stderr = read_pipe(child.stderr.take());
                ExecutionResult {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    timed_out: false,
                    wall_ms: started.elapsed().as_millis() as i64,
                }
            }
            None => {
                // Timeout: kill the process and reap the zombie.
                let _ = child.kill();
                let _ = child.wait();
                let stdout = read_pipe(child.stdout.take());
                let mut stderr = read_pipe(child.stderr.take());
                stderr.push_str(&format!("\n[TIMEOUT after {}s]", def.timeout_seconds));
                ExecutionResult {
                    exit_code: -1,
                    stdout,
                    stderr,
                    timed_out: true,
                    wall_ms: started.elapsed().as_millis() as i64,
                }
            }
        };

        drop(script_file);
        Ok(result)
    }
}

/// Substitute `{name}` placeholders from the parameter map. String
/// values are inserted bare; everything else in its JSON form.
fn render_template(code: &str, params: &Map<String, Value>) -> String {
    let mut rendered = code.to_string();
    for (key, value) in params {
        let placeholder = format!("{{{}}}", key);
        if !rendered.contains(&placeholder) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}

fn write_script(code: &str, suffix: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .prefix("task_")
        .suffix(suffix)
        .tempfile()
        .context("Failed to create temp script file")?;
    file.write_all(code.as_bytes())
        .context("Failed to write script body")?;
    file.flush()?;
    Ok(file)
}

fn resolve_script_path(code: &str, working_dir: Option<&str>) -> PathBuf {
    let path = Path::new(code);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match working_dir {
        Some(dir) => Path::new(dir).join(path),
        None => path.to_path_buf(),
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    pipe.map(|mut p| {
        let mut buf = String::new();
        let _ = p.read_to_string(&mut buf);
        buf
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn cli_task(code: &str, timeout_seconds: i64) -> TaskDefinition {
        TaskDefinition {
            task_id: "test".into(),
            kind: TaskKind::Cli,
            code: code.into(),
            default_params: Map::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout_seconds,
            enabled: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn run_simple(def: &TaskDefinition, params: Map<String, Value>) -> ExecutionResult {
        SubprocessRunner::new("/tmp/test.db")
            .run(def, &params, &json!({}), 1, "stack-1")
            .unwrap()
    }

    #[test]
    fn render_template_substitutes_params() {
        let mut params = Map::new();
        params.insert("name".into(), json!("world"));
        params.insert("count".into(), json!(3));
        assert_eq!(
            render_template("echo {name} {count}", &params),
            "echo world 3"
        );
        // Unknown placeholders are left alone
        assert_eq!(render_template("echo {other}", &params), "echo {other}");
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let result = run_simple(&cli_task("echo hello", 10), Map::new());
        assert!(result.succeeded());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_a_failure() {
        let result = run_simple(&cli_task("exit 7", 10), Map::new());
        assert!(!result.succeeded());
        assert_eq!(result.exit_code, 7);
        assert!(result.failure_message().contains("7"));
    }

    #[test]
    fn timeout_kills_the_child() {
        let result = run_simple(&cli_task("sleep 30", 1), Map::new());
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("TIMEOUT"));
    }

    #[test]
    fn child_sees_contract_environment() {
        let mut params = Map::new();
        params.insert("greeting".into(), json!("hi"));
        let def = cli_task("echo \"$TASK_PARAMS|$TASK_QUEUE_ID|$TASK_STACK_ID\"", 10);
        let result = SubprocessRunner::new("/tmp/test.db")
            .run(&def, &params, &json!({"variables": {}}), 42, "stack-9")
            .unwrap();
        assert!(result.succeeded());
        assert!(result.stdout.contains("greeting"));
        assert!(result.stdout.contains("|42|stack-9"));
    }

    #[test]
    fn stdin_is_closed() {
        // cat exits immediately when stdin is null rather than hanging.
        let result = run_simple(&cli_task("cat", 5), Map::new());
        assert!(!result.timed_out);
    }

    #[test]
    fn missing_python_file_reports_failure() {
        let def = TaskDefinition {
            kind: TaskKind::PythonFile,
            code: "does_not_exist_xyz.py".into(),
            ..cli_task("", 10)
        };
        let result = run_simple(&def, Map::new());
        assert_eq!(result.exit_code, -2);
        assert!(result.stderr.contains("not found"));
    }
}
