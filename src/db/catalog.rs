//! Task catalog: read path for the engine, seed/admin write path.

use super::{now_ms, Database};
use crate::types::{TaskDefinition, TaskKind};
use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashMap;

fn parse_task_def_row(row: &Row) -> rusqlite::Result<TaskDefinition> {
    let task_id: String = row.get("task_id")?;
    let kind: String = row.get("kind")?;
    let code: String = row.get("code")?;
    let default_params_json: String = row.get("default_params")?;
    let working_dir: Option<String> = row.get("working_dir")?;
    let env_json: String = row.get("env")?;
    let timeout_seconds: i64 = row.get("timeout_seconds")?;
    let enabled: i64 = row.get("enabled")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;

    let default_params: serde_json::Map<String, Value> =
        serde_json::from_str(&default_params_json).unwrap_or_default();
    let env: HashMap<String, String> = serde_json::from_str(&env_json).unwrap_or_default();

    Ok(TaskDefinition {
        task_id,
        kind: TaskKind::from_str(&kind).unwrap_or(TaskKind::Cli),
        code,
        default_params,
        working_dir,
        env,
        timeout_seconds,
        enabled: enabled != 0,
        created_at,
        updated_at,
    })
}

impl Database {
    /// Look up a task definition by id.
    pub fn task(&self, task_id: &str) -> Result<Option<TaskDefinition>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks WHERE task_id = ?1")?;
            let def = stmt
                .query_row(params![task_id], parse_task_def_row)
                .optional()?;
            Ok(def)
        })
    }

    /// Insert or replace a task definition. Seed/admin path only.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_task(
        &self,
        task_id: &str,
        kind: TaskKind,
        code: &str,
        default_params: serde_json::Map<String, Value>,
        working_dir: Option<String>,
        env: HashMap<String, String>,
        timeout_seconds: i64,
    ) -> Result<TaskDefinition> {
        if timeout_seconds <= 0 {
            return Err(anyhow!("timeout_seconds must be positive"));
        }
        let now = now_ms();
        let default_params_json = serde_json::to_string(&default_params)?;
        let env_json = serde_json::to_string(&env)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (task_id, kind, code, default_params, working_dir, env,
                                    timeout_seconds, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)
                 ON CONFLICT(task_id) DO UPDATE SET
                    kind = excluded.kind,
                    code = excluded.code,
                    default_params = excluded.default_params,
                    working_dir = excluded.working_dir,
                    env = excluded.env,
                    timeout_seconds = excluded.timeout_seconds,
                    updated_at = excluded.updated_at",
                params![
                    task_id,
                    kind.as_str(),
                    code,
                    default_params_json,
                    working_dir,
                    env_json,
                    timeout_seconds,
                    now,
                ],
            )?;
            Ok(())
        })?;

        self.task(task_id)?
            .ok_or_else(|| anyhow!("Task vanished after upsert: {}", task_id))
    }

    /// Enable or disable a task. Disabling removes it from new submissions
    /// but does not affect in-flight stacks.
    pub fn set_task_enabled(&self, task_id: &str, enabled: bool) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE tasks SET enabled = ?1, updated_at = ?2 WHERE task_id = ?3",
                params![enabled as i64, now, task_id],
            )?;
            Ok(rows > 0)
        })
    }

    /// List task definitions, optionally filtered by an id substring.
    pub fn list_task_defs(
        &self,
        filter: Option<&str>,
        enabled_only: bool,
    ) -> Result<Vec<TaskDefinition>> {
        self.with_conn(|conn| {
            let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if enabled_only {
                sql.push_str(" AND enabled = 1");
            }
            if let Some(f) = filter {
                sql.push_str(" AND task_id LIKE ?");
                params_vec.push(Box::new(format!("%{}%", f)));
            }
            sql.push_str(" ORDER BY task_id");

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let defs = stmt
                .query_map(params_refs.as_slice(), parse_task_def_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(defs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        Database::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn upsert_and_lookup() {
        let db = setup_db();
        let def = db
            .upsert_task(
                "hello",
                TaskKind::Cli,
                "echo hello",
                serde_json::Map::new(),
                None,
                HashMap::new(),
                60,
            )
            .unwrap();
        assert_eq!(def.task_id, "hello");
        assert!(def.enabled);

        let fetched = db.task("hello").unwrap().unwrap();
        assert_eq!(fetched.kind, TaskKind::Cli);
        assert_eq!(fetched.timeout_seconds, 60);
        assert!(db.task("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_rejects_non_positive_timeout() {
        let db = setup_db();
        let result = db.upsert_task(
            "bad",
            TaskKind::Cli,
            "true",
            serde_json::Map::new(),
            None,
            HashMap::new(),
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn disable_hides_from_enabled_listing() {
        let db = setup_db();
        db.upsert_task(
            "t1",
            TaskKind::Cli,
            "true",
            serde_json::Map::new(),
            None,
            HashMap::new(),
            30,
        )
        .unwrap();

        assert!(db.set_task_enabled("t1", false).unwrap());
        assert!(db.list_task_defs(None, true).unwrap().is_empty());
        assert_eq!(db.list_task_defs(None, false).unwrap().len(), 1);
        // The definition itself is still readable
        assert!(!db.task("t1").unwrap().unwrap().enabled);
    }

    #[test]
    fn list_filters_by_substring() {
        let db = setup_db();
        for id in ["convert_csv", "convert_xml", "upload_dual"] {
            db.upsert_task(
                id,
                TaskKind::Cli,
                "true",
                serde_json::Map::new(),
                None,
                HashMap::new(),
                30,
            )
            .unwrap();
        }
        let defs = db.list_task_defs(Some("convert"), true).unwrap();
        assert_eq!(defs.len(), 2);
    }
}
