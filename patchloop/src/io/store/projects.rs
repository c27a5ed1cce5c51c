use std::path::PathBuf;

use rusqlite::{ErrorCode, OptionalExtension, Row, params};

use super::{StoreError, TaskStore, new_id, now_timestamp};
use crate::core::types::Project;

const PROJECT_COLUMNS: &str = "id, name, path, remote_url, created_at, last_synced_at";

/// Input for [`TaskStore::create_project`].
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub path: PathBuf,
    pub remote_url: Option<String>,
}

impl TaskStore {
    pub fn create_project(&self, input: NewProject) -> Result<Project, StoreError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("project name must not be empty".into()));
        }
        let now = now_timestamp();
        let project = Project {
            id: new_id(),
            name: name.to_string(),
            path: input.path,
            remote_url: input.remote_url.filter(|url| !url.trim().is_empty()),
            created_at: now,
            last_synced_at: None,
        };

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO projects(id, name, path, remote_url, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.id,
                project.name,
                project.path.to_string_lossy(),
                project.remote_url,
                project.created_at
            ],
        );
        match inserted {
            Ok(_) => Ok(project),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateProject(project.name))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_project(&self, id: &str) -> Result<Project, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![id],
            project_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            kind: "project",
            id: id.to_string(),
        })
    }

    /// Look a project up by id, falling back to its display name.
    pub fn find_project(&self, id_or_name: &str) -> Result<Project, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1 OR name = ?1 ORDER BY id = ?1 DESC LIMIT 1"),
            params![id_or_name],
            project_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            kind: "project",
            id: id_or_name.to_string(),
        })
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name"
        ))?;
        let rows = stmt.query_map([], project_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Record that the working copy was just verified or refreshed.
    pub fn touch_project_synced(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE projects SET last_synced_at = ?1 WHERE id = ?2",
            params![now_timestamp(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "project",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        remote_url: row.get(3)?,
        created_at: row.get(4)?,
        last_synced_at: row.get(5)?,
    })
}
