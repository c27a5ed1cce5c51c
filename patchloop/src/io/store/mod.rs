//! Durable SQLite storage for projects, tasks and the event log.
//!
//! One connection behind a mutex; every public operation is a single-row
//! write or a read. State changes that must not race (claiming a queued task,
//! cancelling a queued task, updating a non-terminal task) are conditional
//! `UPDATE`s so two processes sharing the file cannot both win.

mod error;
mod events;
mod projects;
mod schema;
mod tasks;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument};

pub use error::StoreError;
pub use projects::NewProject;
pub use schema::{CURRENT_SCHEMA_VERSION, SchemaReport, prepare_schema};
pub use tasks::NewTask;

/// Handle to the executor database.
#[derive(Debug)]
pub struct TaskStore {
    conn: Mutex<Connection>,
    schema: SchemaReport,
}

impl TaskStore {
    /// Open (or create) the database at `path` and run the schema boot guard.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let schema = prepare_schema(&conn)?;
        debug!(version = schema.version, repaired = schema.repaired.len(), "store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            schema,
        })
    }

    /// Outcome of the boot guard run when this store was opened.
    pub fn schema_report(&self) -> &SchemaReport {
        &self.schema
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn corrupt(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(StoreError::Corrupt(message)),
    )
}
