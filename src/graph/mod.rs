//! Request graph store: `TaskRequest` and `CascadeRule` nodes plus
//! typed edges (`depends_on`, `triggered_by`, `produced`).
//!
//! Lives in its own SQLite database so the request queue can be shared
//! by several runner hosts independently of each host's task store.

pub mod cascade;
pub mod requests;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations_graph");
}

/// Edge type gating request admission.
pub const EDGE_DEPENDS_ON: &str = "depends_on";
/// Edge type linking a cascaded request to the rule that created it.
pub const EDGE_TRIGGERED_BY: &str = "triggered_by";
/// Edge type linking a request to an artifact node it produced.
pub const EDGE_PRODUCED: &str = "produced";

/// Handle over the graph database.
#[derive(Clone)]
pub struct GraphStore {
    conn: Arc<Mutex<Connection>>,
}

impl GraphStore {
    /// Open or create the graph store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations()?;

        Ok(store)
    }

    /// Open an in-memory graph store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.run_migrations()?;

        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        embedded::migrations::runner().run(&mut *conn)?;
        Ok(())
    }

    /// Execute a function with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Execute a function with mutable access (for transactions).
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }
}
