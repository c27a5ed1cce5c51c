use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::{StoreError, TaskStore, corrupt, new_id, now_timestamp};
use crate::core::types::{Task, TaskState};

const TASK_COLUMNS: &str = "id, project_id, prompt, source_branch, target_branch, iteration, \
consecutive_failures, apply_failures, state, reason, cancel_requested, pr_url, pr_remote_id, \
created_at, updated_at";

/// Input for [`TaskStore::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: String,
    pub prompt: String,
    pub source_branch: String,
    pub target_branch: String,
}

impl TaskStore {
    /// Insert a `queued` task. The project must exist and target ≠ source.
    pub fn create_task(&self, input: NewTask) -> Result<Task, StoreError> {
        if input.prompt.trim().is_empty() {
            return Err(StoreError::InvalidInput("prompt must not be empty".into()));
        }
        let source = input.source_branch.trim();
        let target = input.target_branch.trim();
        if source.is_empty() || target.is_empty() {
            return Err(StoreError::InvalidInput(
                "source and target branches must not be empty".into(),
            ));
        }
        if source == target {
            return Err(StoreError::InvalidInput(format!(
                "target branch must differ from source branch `{source}`"
            )));
        }

        let now = now_timestamp();
        let task = Task {
            id: new_id(),
            project_id: input.project_id,
            prompt: input.prompt,
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            iteration: 0,
            consecutive_failures: 0,
            apply_failures: 0,
            state: TaskState::Queued,
            reason: None,
            cancel_requested: false,
            pr_url: None,
            pr_remote_id: None,
            created_at: now.clone(),
            updated_at: now,
        };

        let conn = self.conn()?;
        let project_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)",
            params![task.project_id],
            |row| row.get(0),
        )?;
        if !project_exists {
            return Err(StoreError::NotFound {
                kind: "project",
                id: task.project_id,
            });
        }
        conn.execute(
            "INSERT INTO tasks(id, project_id, prompt, source_branch, target_branch, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                task.project_id,
                task.prompt,
                task.source_branch,
                task.target_branch,
                task.state.as_str(),
                task.created_at,
                task.updated_at
            ],
        )?;
        debug!(task_id = %task.id, "task created");
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        let conn = self.conn()?;
        load_task(&conn, id)
    }

    /// Tasks ordered by creation, optionally filtered by state and project.
    pub fn list_tasks(
        &self,
        state: Option<TaskState>,
        project_id: Option<&str>,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR project_id = ?2)
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map(params![state.map(TaskState::as_str), project_id], task_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Ids of tasks in `state`, oldest first.
    pub fn task_ids_in_state(&self, state: TaskState) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id FROM tasks WHERE state = ?1 ORDER BY created_at, rowid")?;
        let rows = stmt.query_map(params![state.as_str()], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Move a task from `queued` to `running`. Returns `false` if another
    /// worker claimed it first or it is no longer queued.
    pub fn claim_queued(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET state = 'running', updated_at = ?1 WHERE id = ?2 AND state = 'queued'",
            params![now_timestamp(), id],
        )?;
        Ok(changed == 1)
    }

    /// Fail a task that has not started yet. Returns `false` if it already left `queued`.
    pub fn cancel_queued(&self, id: &str, reason: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET state = 'failed', reason = ?1, cancel_requested = 1, updated_at = ?2
             WHERE id = ?3 AND state = 'queued'",
            params![reason, now_timestamp(), id],
        )?;
        Ok(changed == 1)
    }

    /// Persist the executor-owned fields of `task`.
    ///
    /// Rejected when the stored task is terminal or when the write would
    /// decrease the iteration count. The prompt, branches and cancel flag are
    /// never written here.
    pub fn update_task(&self, task: &mut Task) -> Result<(), StoreError> {
        let now = now_timestamp();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET iteration = ?1, consecutive_failures = ?2, apply_failures = ?3,
                state = ?4, reason = ?5, pr_url = ?6, pr_remote_id = ?7, updated_at = ?8
             WHERE id = ?9 AND state NOT IN ('completed', 'failed') AND iteration <= ?1",
            params![
                task.iteration,
                task.consecutive_failures,
                task.apply_failures,
                task.state.as_str(),
                task.reason,
                task.pr_url,
                task.pr_remote_id,
                now,
                task.id
            ],
        )?;
        if changed == 1 {
            task.updated_at = now;
            return Ok(());
        }

        let stored = load_task(&conn, &task.id)?;
        if stored.state.is_terminal() {
            return Err(StoreError::TerminalTask {
                id: stored.id,
                state: stored.state,
            });
        }
        Err(StoreError::InvalidInput(format!(
            "iteration may not decrease (stored {}, attempted {})",
            stored.iteration, task.iteration
        )))
    }

    /// Set the durable cancel flag. Terminal tasks are rejected.
    pub fn request_cancel(&self, id: &str) -> Result<Task, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET cancel_requested = 1, updated_at = ?1
             WHERE id = ?2 AND state NOT IN ('completed', 'failed')",
            params![now_timestamp(), id],
        )?;
        let task = load_task(&conn, id)?;
        if changed == 0 {
            return Err(StoreError::TerminalTask {
                id: task.id,
                state: task.state,
            });
        }
        Ok(task)
    }

    pub fn is_cancel_requested(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT cancel_requested FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            kind: "task",
            id: id.to_string(),
        })
    }
}

pub(super) fn load_task(conn: &Connection, id: &str) -> Result<Task, StoreError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        kind: "task",
        id: id.to_string(),
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let raw_state: String = row.get(8)?;
    let state = TaskState::parse(&raw_state)
        .ok_or_else(|| corrupt(8, format!("unknown task state `{raw_state}`")))?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        prompt: row.get(2)?,
        source_branch: row.get(3)?,
        target_branch: row.get(4)?,
        iteration: row.get(5)?,
        consecutive_failures: row.get(6)?,
        apply_failures: row.get(7)?,
        state,
        reason: row.get(9)?,
        cancel_requested: row.get(10)?,
        pr_url: row.get(11)?,
        pr_remote_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
