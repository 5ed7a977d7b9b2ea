//! Global control flags.
//!
//! A single `control_flags` row keyed `kill_switch` with value "1" stops
//! the daemon from claiming and the engine from creating stacks. The
//! `pause_new_tasks` flag pauses the single-task queue worker only.

use super::{now_ms, Database};
use anyhow::Result;
use rusqlite::{params, OptionalExtension};

/// Flag key that halts claiming and stack creation.
pub const KILL_SWITCH: &str = "kill_switch";
/// Flag key that pauses the non-stack queue worker.
pub const PAUSE_NEW_TASKS: &str = "pause_new_tasks";

impl Database {
    /// Read a control flag value.
    pub fn control_flag(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM control_flags WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    /// Set a control flag.
    pub fn set_control_flag(&self, key: &str, value: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO control_flags (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        })
    }

    /// Clear a control flag.
    pub fn clear_control_flag(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM control_flags WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    /// True when the kill switch is set.
    pub fn kill_switch_active(&self) -> Result<bool> {
        Ok(self.control_flag(KILL_SWITCH)?.as_deref() == Some("1"))
    }

    /// True when new single-task processing is paused.
    pub fn paused(&self) -> Result<bool> {
        Ok(self.control_flag(PAUSE_NEW_TASKS)?.as_deref() == Some("1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_toggles() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.kill_switch_active().unwrap());

        db.set_control_flag(KILL_SWITCH, "1").unwrap();
        assert!(db.kill_switch_active().unwrap());

        // Only the designated truthy string activates it
        db.set_control_flag(KILL_SWITCH, "0").unwrap();
        assert!(!db.kill_switch_active().unwrap());

        db.set_control_flag(KILL_SWITCH, "1").unwrap();
        db.clear_control_flag(KILL_SWITCH).unwrap();
        assert!(!db.kill_switch_active().unwrap());
    }

    #[test]
    fn pause_flag_is_independent() {
        let db = Database::open_in_memory().unwrap();
        db.set_control_flag(PAUSE_NEW_TASKS, "1").unwrap();
        assert!(db.paused().unwrap());
        assert!(!db.kill_switch_active().unwrap());
    }
}
