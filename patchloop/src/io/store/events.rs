use rusqlite::{Row, params};

use super::tasks::load_task;
use super::{StoreError, TaskStore, corrupt, now_timestamp};
use crate::core::types::{Event, Severity, TaskState};

impl TaskStore {
    /// Append an event to a task's log. The phase is the task's state at the
    /// moment of the append. Events are never updated or deleted.
    pub fn append_event(
        &self,
        task_id: &str,
        severity: Severity,
        message: &str,
    ) -> Result<Event, StoreError> {
        let conn = self.conn()?;
        let phase = load_task(&conn, task_id)?.state;
        let timestamp = now_timestamp();
        conn.execute(
            "INSERT INTO events(task_id, timestamp, severity, phase, message) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, timestamp, severity.as_str(), phase.as_str(), message],
        )?;
        Ok(Event {
            seq: conn.last_insert_rowid(),
            task_id: task_id.to_string(),
            timestamp,
            severity,
            phase,
            message: message.to_string(),
        })
    }

    /// Events of `task_id` with `seq > after`, in append order.
    pub fn events_after(&self, task_id: &str, after: i64) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, task_id, timestamp, severity, phase, message FROM events
             WHERE task_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![task_id, after], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Full event log of a task.
    pub fn list_events(&self, task_id: &str) -> Result<Vec<Event>, StoreError> {
        self.events_after(task_id, 0)
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let raw_severity: String = row.get(3)?;
    let severity = Severity::parse(&raw_severity)
        .ok_or_else(|| corrupt(3, format!("unknown severity `{raw_severity}`")))?;
    let raw_phase: String = row.get(4)?;
    let phase = TaskState::parse(&raw_phase)
        .ok_or_else(|| corrupt(4, format!("unknown phase `{raw_phase}`")))?;
    Ok(Event {
        seq: row.get(0)?,
        task_id: row.get(1)?,
        timestamp: row.get(2)?,
        severity,
        phase,
        message: row.get(5)?,
    })
}
