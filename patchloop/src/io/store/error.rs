use thiserror::Error;

use crate::core::types::TaskState;

/// Failures surfaced by [`super::TaskStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("project name already registered: {0}")]
    DuplicateProject(String),
    /// Writes to `completed`/`failed` tasks are rejected, never applied.
    #[error("task {id} is {state}; terminal tasks cannot be modified")]
    TerminalTask { id: String, state: TaskState },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreError::TerminalTask { .. })
    }
}
