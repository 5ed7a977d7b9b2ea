//! Cascade rules and dependency resolution.
//!
//! Two policies fire on graph commits:
//! 1. Unblock on completion - when a request reaches `done`, blocked
//!    dependents whose every dependency is now done move to `pending`.
//! 2. Cascade on source - when a source artifact is committed, every
//!    enabled matching rule materializes a new pending request linked to
//!    the rule by a `triggered_by` edge.
//!
//! Both run synchronously inside the adapter (the external-watcher
//! flavor of the design); the `sources.cascaded` flag guarantees each
//! committed source is evaluated against the rule set exactly once.

use super::{GraphStore, EDGE_DEPENDS_ON, EDGE_TRIGGERED_BY};
use crate::db::now_ms;
use crate::error::RunnerError;
use crate::types::{CascadeRule, Priority, SourceNode, TaskRequest};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

fn parse_rule_row(row: &Row) -> rusqlite::Result<CascadeRule> {
    let enabled: i64 = row.get("enabled")?;
    Ok(CascadeRule {
        rule_id: row.get("rule_id")?,
        description: row.get("description")?,
        source_kind: row.get("source_kind")?,
        task_id: row.get("task_id")?,
        parameter_template: row.get("parameter_template")?,
        priority: row.get("priority")?,
        enabled: enabled != 0,
        created_at: row.get("created_at")?,
    })
}

/// Move blocked dependents of a completed request to pending when all
/// their dependencies are done. Transaction-scoped so `mark_done` is
/// atomic; idempotent under replay (a pending row is left alone).
pub(super) fn resolve_blocked_in_tx(conn: &Connection, completed_id: &str) -> Result<Vec<String>> {
    let dependents: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT e.from_id FROM request_edges e
             JOIN task_requests waiting ON waiting.request_id = e.from_id
             WHERE e.to_id = ?1 AND e.edge_type = ?2 AND waiting.status = 'blocked'",
        )?;
        let x = stmt.query_map(params![completed_id, EDGE_DEPENDS_ON], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        x
    };

    let mut unblocked = Vec::new();
    for waiting_id in dependents {
        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM request_edges e
             JOIN task_requests dep ON dep.request_id = e.to_id
             WHERE e.from_id = ?1 AND e.edge_type = ?2 AND dep.status <> 'done'",
            params![&waiting_id, EDGE_DEPENDS_ON],
            |row| row.get(0),
        )?;
        if remaining > 0 {
            continue;
        }
        conn.execute(
            "UPDATE task_requests SET status = 'pending'
             WHERE request_id = ?1 AND status = 'blocked'",
            params![&waiting_id],
        )?;
        unblocked.push(waiting_id);
    }

    Ok(unblocked)
}

/// Render a parameter template against a source node.
///
/// `$source.<field>` placeholders resolve from the source's id, kind,
/// and attribute map. Quoted placeholders (`"$source.f"`) take the full
/// JSON encoding of the value; bare occurrences inside strings take the
/// JSON-escaped content. The rendered text must parse as JSON.
pub fn render_template(template: &str, source: &SourceNode) -> Result<Value> {
    let mut fields: Vec<(String, Value)> = vec![
        ("source_id".to_string(), Value::String(source.source_id.clone())),
        ("kind".to_string(), Value::String(source.kind.clone())),
    ];
    for (k, v) in &source.attrs {
        fields.push((k.clone(), v.clone()));
    }
    // Longest names first so `$source.id` never clobbers `$source.id_full`.
    fields.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut rendered = template.to_string();
    for (name, value) in &fields {
        let placeholder = format!("$source.{}", name);
        if !rendered.contains(&placeholder) {
            continue;
        }

        let quoted = format!("\"{}\"", placeholder);
        let encoded = serde_json::to_string(value)?;
        rendered = rendered.replace(&quoted, &encoded);

        let escaped_content = match value {
            Value::String(s) => {
                let quoted = serde_json::to_string(s)?;
                quoted[1..quoted.len() - 1].to_string()
            }
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &escaped_content);
    }

    serde_json::from_str(&rendered)
        .map_err(|e| anyhow!("Rendered template is not valid JSON: {} ({})", rendered, e))
}

impl GraphStore {
    /// Create or update a cascade rule. The template must be valid JSON
    /// before substitution.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_rule(
        &self,
        rule_id: &str,
        task_id: &str,
        description: Option<&str>,
        source_kind: Option<&str>,
        parameter_template: Option<&str>,
        priority: Priority,
        enabled: bool,
    ) -> Result<CascadeRule> {
        let template = parameter_template.unwrap_or(r#"{"source_id": "$source.source_id"}"#);
        // Placeholders are string-shaped, so the raw template parses too.
        serde_json::from_str::<Value>(template).map_err(|e| {
            anyhow!(RunnerError::invalid_value(
                "parameter_template",
                &format!("not valid JSON: {}", e),
            ))
        })?;

        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cascade_rules
                 (rule_id, description, source_kind, task_id, parameter_template, priority, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(rule_id) DO UPDATE SET
                    description = excluded.description,
                    source_kind = excluded.source_kind,
                    task_id = excluded.task_id,
                    parameter_template = excluded.parameter_template,
                    priority = excluded.priority,
                    enabled = excluded.enabled",
                params![
                    rule_id,
                    description,
                    source_kind,
                    task_id,
                    template,
                    priority,
                    enabled as i64,
                    now,
                ],
            )?;

            let mut stmt = conn.prepare("SELECT * FROM cascade_rules WHERE rule_id = ?1")?;
            let rule = stmt.query_row(params![rule_id], parse_rule_row)?;
            Ok(rule)
        })
    }

    pub fn rule(&self, rule_id: &str) -> Result<Option<CascadeRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM cascade_rules WHERE rule_id = ?1")?;
            let rule = stmt.query_row(params![rule_id], parse_rule_row).optional()?;
            Ok(rule)
        })
    }

    pub fn list_rules(&self, enabled_only: bool) -> Result<Vec<CascadeRule>> {
        self.with_conn(|conn| {
            let sql = if enabled_only {
                "SELECT * FROM cascade_rules WHERE enabled = 1 ORDER BY rule_id"
            } else {
                "SELECT * FROM cascade_rules ORDER BY rule_id"
            };
            let mut stmt = conn.prepare(sql)?;
            let rules = stmt
                .query_map([], parse_rule_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rules)
        })
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE cascade_rules SET enabled = ?1 WHERE rule_id = ?2",
                params![enabled as i64, rule_id],
            )?;
            Ok(rows > 0)
        })
    }

    /// Delete a rule. Requests it triggered are kept.
    pub fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM cascade_rules WHERE rule_id = ?1",
                params![rule_id],
            )?;
            Ok(rows > 0)
        })
    }

    /// Requests created by a rule, newest first.
    pub fn triggered_requests(&self, rule_id: &str, limit: i64) -> Result<Vec<TaskRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.* FROM task_requests r
                 JOIN request_edges e ON e.from_id = r.request_id
                 WHERE e.to_id = ?1 AND e.edge_type = ?2
                 ORDER BY r.created_at DESC
                 LIMIT ?3",
            )?;
            let requests = stmt
                .query_map(
                    params![rule_id, EDGE_TRIGGERED_BY, limit],
                    super::requests::parse_request_row,
                )?
                .filter_map(|r| r.ok())
                .collect();
            Ok(requests)
        })
    }

    /// Commit a source artifact and evaluate cascade rules against it.
    /// Returns the requests the commit materialized. Committing the same
    /// source id again is a no-op (exactly-once evaluation).
    pub fn commit_source(
        &self,
        source_id: &str,
        kind: &str,
        attrs: serde_json::Map<String, Value>,
    ) -> Result<Vec<TaskRequest>> {
        let now = now_ms();
        let attrs_json = serde_json::to_string(&attrs)?;

        let inserted = self.with_conn(|conn| {
            let rows = conn.execute(
                "INSERT INTO sources (source_id, kind, attrs, cascaded, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(source_id) DO NOTHING",
                params![source_id, kind, attrs_json, now],
            )?;
            Ok(rows > 0)
        })?;

        if !inserted {
            debug!(source_id, "Source already committed; skipping cascade");
            return Ok(Vec::new());
        }

        let source = SourceNode {
            source_id: source_id.to_string(),
            kind: kind.to_string(),
            attrs,
            created_at: now,
        };

        self.evaluate_cascades(&source)
    }

    /// Run every enabled matching rule against a freshly committed
    /// source. Rule failures are logged and skipped; they never roll
    /// back the committed source.
    fn evaluate_cascades(&self, source: &SourceNode) -> Result<Vec<TaskRequest>> {
        let rules: Vec<CascadeRule> = self
            .list_rules(true)?
            .into_iter()
            .filter(|r| {
                r.source_kind.is_none() || r.source_kind.as_deref() == Some(source.kind.as_str())
            })
            .collect();

        let mut created = Vec::new();
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for rule in &rules {
                let parameters = match render_template(&rule.parameter_template, source) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(rule_id = %rule.rule_id, "Cascade template failed: {}", e);
                        continue;
                    }
                };

                let request_id = Uuid::now_v7().to_string();
                tx.execute(
                    "INSERT INTO task_requests
                     (request_id, task_id, parameters, status, priority, requester, created_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
                    params![
                        &request_id,
                        rule.task_id,
                        serde_json::to_string(&parameters)?,
                        rule.priority,
                        format!("trigger:{}", rule.rule_id),
                        now,
                    ],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO request_edges (from_id, to_id, edge_type) VALUES (?1, ?2, ?3)",
                    params![&request_id, rule.rule_id, EDGE_TRIGGERED_BY],
                )?;

                created.push(request_id);
            }

            tx.execute(
                "UPDATE sources SET cascaded = 1 WHERE source_id = ?1",
                params![source.source_id],
            )?;

            tx.commit()?;
            Ok(())
        })?;

        debug!(
            source_id = %source.source_id,
            created = created.len(),
            "Cascade evaluation complete"
        );

        created
            .iter()
            .map(|id| {
                self.get(id)?
                    .ok_or_else(|| anyhow!("Cascaded request vanished: {}", id))
            })
            .collect()
    }
}
