//! Versioned schema plus a boot guard that repairs column drift.
//!
//! `schema_migrations` records which versions ran. A database can still end
//! up with fewer physical columns than its recorded version implies (a
//! restored backup, a hand-edited file, a crash between DDL statements on an
//! older build). [`prepare_schema`] therefore checks every column the recorded
//! version implies and adds the missing ones with a default-compatible
//! definition instead of refusing to start. Running it any number of times on
//! any schema converges to the same shape.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use super::StoreError;
use super::now_timestamp;

/// One migration step.
struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection) -> Result<(), StoreError>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        apply: create_base_tables,
    },
    Migration {
        version: 2,
        name: "task_apply_failures",
        apply: add_version_columns::<2>,
    },
    Migration {
        version: 3,
        name: "task_cancellation_and_publication",
        apply: add_version_columns::<3>,
    },
    Migration {
        version: 4,
        name: "project_sync",
        apply: add_version_columns::<4>,
    },
];

/// A column and the version that introduced it.
///
/// `decl` must be valid for `ALTER TABLE ADD COLUMN`: `NOT NULL` only with a
/// default.
struct ColumnSpec {
    version: i64,
    table: &'static str,
    column: &'static str,
    decl: &'static str,
}

const COLUMNS: &[ColumnSpec] = &[
    col(1, "projects", "name", "TEXT NOT NULL DEFAULT ''"),
    col(1, "projects", "path", "TEXT NOT NULL DEFAULT ''"),
    col(1, "projects", "remote_url", "TEXT"),
    col(1, "projects", "created_at", "TEXT NOT NULL DEFAULT ''"),
    col(1, "tasks", "project_id", "TEXT NOT NULL DEFAULT ''"),
    col(1, "tasks", "prompt", "TEXT NOT NULL DEFAULT ''"),
    col(1, "tasks", "source_branch", "TEXT NOT NULL DEFAULT ''"),
    col(1, "tasks", "target_branch", "TEXT NOT NULL DEFAULT ''"),
    col(1, "tasks", "iteration", "INTEGER NOT NULL DEFAULT 0"),
    col(1, "tasks", "consecutive_failures", "INTEGER NOT NULL DEFAULT 0"),
    col(1, "tasks", "state", "TEXT NOT NULL DEFAULT 'queued'"),
    col(1, "tasks", "reason", "TEXT"),
    col(1, "tasks", "created_at", "TEXT NOT NULL DEFAULT ''"),
    col(1, "tasks", "updated_at", "TEXT NOT NULL DEFAULT ''"),
    col(1, "events", "task_id", "TEXT NOT NULL DEFAULT ''"),
    col(1, "events", "timestamp", "TEXT NOT NULL DEFAULT ''"),
    col(1, "events", "severity", "TEXT NOT NULL DEFAULT 'info'"),
    col(1, "events", "phase", "TEXT NOT NULL DEFAULT 'queued'"),
    col(1, "events", "message", "TEXT NOT NULL DEFAULT ''"),
    col(2, "tasks", "apply_failures", "INTEGER NOT NULL DEFAULT 0"),
    col(3, "tasks", "cancel_requested", "INTEGER NOT NULL DEFAULT 0"),
    col(3, "tasks", "pr_url", "TEXT"),
    col(3, "tasks", "pr_remote_id", "TEXT"),
    col(4, "projects", "last_synced_at", "TEXT"),
];

const fn col(version: i64, table: &'static str, column: &'static str, decl: &'static str) -> ColumnSpec {
    ColumnSpec {
        version,
        table,
        column,
        decl,
    }
}

/// Latest schema version this build knows about.
pub const CURRENT_SCHEMA_VERSION: i64 = 4;

/// What [`prepare_schema`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    /// Highest recorded version after preparation.
    pub version: i64,
    /// Names of migrations applied during this run.
    pub applied: Vec<String>,
    /// `table.column` entries the boot guard had to add.
    pub repaired: Vec<String>,
}

/// Apply pending migrations, then reconcile physical columns with the
/// recorded version.
pub fn prepare_schema(conn: &Connection) -> Result<SchemaReport, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;

    let mut report = SchemaReport {
        version: recorded_version(conn)?,
        ..SchemaReport::default()
    };
    if report.version > CURRENT_SCHEMA_VERSION {
        warn!(
            recorded = report.version,
            known = CURRENT_SCHEMA_VERSION,
            "database was written by a newer build"
        );
    }

    let recorded = report.version;
    for migration in MIGRATIONS.iter().filter(|m| m.version > recorded) {
        let tx = conn.unchecked_transaction()?;
        (migration.apply)(&tx)?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now_timestamp()],
        )?;
        tx.commit()?;
        info!(version = migration.version, name = migration.name, "applied migration");
        report.applied.push(migration.name.to_string());
        report.version = migration.version;
    }

    report.repaired = repair_drift(conn, report.version)?;
    if !report.repaired.is_empty() {
        warn!(repaired = ?report.repaired, "repaired schema drift");
    }
    Ok(report)
}

fn recorded_version(conn: &Connection) -> Result<i64, StoreError> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn repair_drift(conn: &Connection, version: i64) -> Result<Vec<String>, StoreError> {
    if version < 1 {
        return Ok(Vec::new());
    }
    // Missing tables are recreated in their base shape; the column pass below
    // brings them up to the recorded version.
    create_base_tables(conn)?;

    let mut repaired = Vec::new();
    for spec in COLUMNS.iter().filter(|c| c.version <= version) {
        if !column_exists(conn, spec.table, spec.column)? {
            debug!(table = spec.table, column = spec.column, "adding missing column");
            add_column_if_missing(conn, spec.table, spec.column, spec.decl)?;
            repaired.push(format!("{}.{}", spec.table, spec.column));
        }
    }
    Ok(repaired)
}

fn create_base_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            path TEXT NOT NULL DEFAULT '',
            remote_url TEXT,
            created_at TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL DEFAULT '',
            prompt TEXT NOT NULL DEFAULT '',
            source_branch TEXT NOT NULL DEFAULT '',
            target_branch TEXT NOT NULL DEFAULT '',
            iteration INTEGER NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'queued',
            reason TEXT,
            created_at TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL DEFAULT '',
            timestamp TEXT NOT NULL DEFAULT '',
            severity TEXT NOT NULL DEFAULT 'info',
            phase TEXT NOT NULL DEFAULT 'queued',
            message TEXT NOT NULL DEFAULT ''
        );
        CREATE UNIQUE INDEX IF NOT EXISTS projects_name ON projects(name);
        CREATE INDEX IF NOT EXISTS tasks_state ON tasks(state, created_at);
        CREATE INDEX IF NOT EXISTS events_task_seq ON events(task_id, seq);",
    )?;
    Ok(())
}

fn add_version_columns<const V: i64>(conn: &Connection) -> Result<(), StoreError> {
    for spec in COLUMNS.iter().filter(|c| c.version == V) {
        add_column_if_missing(conn, spec.table, spec.column, spec.decl)?;
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), StoreError> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(err) if is_duplicate_column(&err) => Ok(()),
        Err(err) => Err(StoreError::Sql(err)),
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            message.contains("duplicate column name")
        }
        _ => false,
    }
}
