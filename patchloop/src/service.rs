//! Job submission and project registration.
//!
//! This is the surface the CLI and the HTTP server share: create projects,
//! submit/get/list/cancel tasks and read or follow a task's event log.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::core::types::{Event, Project, Severity, Task, TaskState};
use crate::io::config::ExecutorConfig;
use crate::io::git::Git;
use crate::io::init::DataPaths;
use crate::io::store::{NewProject, NewTask, StoreError, TaskStore};
use crate::orchestrator::{Orchestrator, OrchestratorParts};

/// Request to register a project.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateProject {
    pub name: String,
    /// Clone from here when `path` is not given.
    pub remote_url: Option<String>,
    /// Register an existing working copy instead of allocating one.
    pub path: Option<PathBuf>,
}

/// Request to queue a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitTask {
    /// Project id or name.
    pub project: String,
    pub prompt: String,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
}

pub struct Service {
    store: Arc<TaskStore>,
    config: ExecutorConfig,
    workspace_root: PathBuf,
}

impl Service {
    pub fn new(store: Arc<TaskStore>, config: ExecutorConfig, workspace_root: PathBuf) -> Self {
        Self {
            store,
            config,
            workspace_root,
        }
    }

    /// Open the store and config of a data directory.
    pub fn open(paths: &DataPaths) -> Result<Self> {
        if !paths.root.is_dir() {
            bail!(
                "data directory {} does not exist (run `patchloop init` first)",
                paths.root.display()
            );
        }
        let config = paths.load_config()?;
        let store = TaskStore::open(&paths.db_path)
            .with_context(|| format!("open store {}", paths.db_path.display()))?;
        let workspace_root = config.workspace_root(&paths.root);
        Ok(Self::new(Arc::new(store), config, workspace_root))
    }

    /// Orchestrator with the production collaborators for this config.
    pub fn orchestrator(&self, artifacts_dir: PathBuf) -> Result<Orchestrator> {
        let parts =
            OrchestratorParts::from_config(self.config.clone(), Arc::clone(&self.store), artifacts_dir)?;
        Orchestrator::new(parts)
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Register a project and allocate its working copy.
    ///
    /// With `path`, an existing working copy is registered as-is (its remote
    /// URL is read from git when not given). Otherwise a working copy is
    /// created under the workspace root: cloned from `remote_url`, or
    /// initialized empty on the default source branch.
    #[instrument(skip_all, fields(name = %request.name))]
    pub fn create_project(&self, request: CreateProject) -> Result<Project> {
        let name = request.name.trim();
        validate_project_name(name)?;
        match self.store.find_project(name) {
            Ok(_) => return Err(StoreError::DuplicateProject(name.to_string()).into()),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        let remote_url = request
            .remote_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        let timeout = self.config.git_timeout();

        let (path, remote_url) = match request.path {
            Some(path) => {
                let path = absolute(&path)?;
                let git = Git::new(&path, timeout);
                if !git.is_work_tree()? {
                    bail!("{} is not a git working copy", path.display());
                }
                let remote_url = match remote_url {
                    Some(url) => Some(url),
                    None => git.remote_url(&self.config.branch.remote)?,
                };
                (path, remote_url)
            }
            None => {
                let path = self.workspace_root.join(name);
                if path.exists() {
                    bail!("workspace {} already exists", path.display());
                }
                match &remote_url {
                    Some(url) => {
                        Git::clone(url, &path, timeout)
                            .with_context(|| format!("clone {url}"))?;
                    }
                    None => {
                        let git = Git::init(&path, &self.config.branch.default_source, timeout)?;
                        git.commit_empty("Initial commit", &self.config.author())?;
                    }
                }
                (path, remote_url)
            }
        };

        let project = self.store.create_project(NewProject {
            name: name.to_string(),
            path,
            remote_url,
        })?;
        self.store.touch_project_synced(&project.id)?;
        info!(project_id = %project.id, path = %project.path.display(), "project registered");
        Ok(self.store.get_project(&project.id)?)
    }

    pub fn get_project(&self, id_or_name: &str) -> Result<Project> {
        Ok(self.store.find_project(id_or_name)?)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.store.list_projects()?)
    }

    /// Queue a task. Returns the task in state `queued`.
    #[instrument(skip_all, fields(project = %request.project))]
    pub fn submit_task(&self, request: SubmitTask) -> Result<Task> {
        let project = self.store.find_project(request.project.trim())?;
        let source = request
            .source_branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.config.branch.default_source.clone());
        let target = request
            .target_branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| default_target_branch(&self.config.branch.prefix, &request.prompt));

        let task = self.store.create_task(NewTask {
            project_id: project.id,
            prompt: request.prompt,
            source_branch: source,
            target_branch: target,
        })?;
        self.store.append_event(
            &task.id,
            Severity::Info,
            &format!(
                "task queued on `{}` -> `{}`",
                task.source_branch, task.target_branch
            ),
        )?;
        info!(task_id = %task.id, "task queued");
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        Ok(self.store.get_task(id)?)
    }

    pub fn list_tasks(&self, state: Option<TaskState>, project: Option<&str>) -> Result<Vec<Task>> {
        let project_id = match project {
            Some(p) => Some(self.store.find_project(p)?.id),
            None => None,
        };
        Ok(self.store.list_tasks(state, project_id.as_deref())?)
    }

    /// Cancel a task.
    ///
    /// A queued task fails immediately; a running task gets the durable flag
    /// and stops at its next iteration boundary. Terminal tasks are rejected.
    #[instrument(skip_all, fields(task_id = id))]
    pub fn cancel_task(&self, id: &str) -> Result<Task> {
        if self.store.cancel_queued(id, "cancelled")? {
            self.store
                .append_event(id, Severity::Error, "task failed: cancelled before start")?;
            return Ok(self.store.get_task(id)?);
        }
        let task = self.store.request_cancel(id)?;
        self.store.append_event(
            id,
            Severity::Warning,
            "cancellation requested; stopping at the next iteration boundary",
        )?;
        Ok(task)
    }

    pub fn events(&self, task_id: &str, after: i64) -> Result<Vec<Event>> {
        self.store.get_task(task_id)?;
        Ok(self.store.events_after(task_id, after)?)
    }

    /// Follow a task's events until it reaches a terminal state.
    pub fn subscribe(&self, task_id: &str, after: i64) -> Result<EventSubscription> {
        self.store.get_task(task_id)?;
        Ok(EventSubscription::new(
            Arc::clone(&self.store),
            task_id,
            after,
            self.config.poll_interval(),
        ))
    }
}

/// Ordered live event stream for one task.
///
/// Yields every event after the starting sequence and ends after the event
/// appended in a terminal phase.
pub struct EventSubscription {
    store: Arc<TaskStore>,
    task_id: String,
    last_seq: i64,
    buffer: VecDeque<Event>,
    poll: Duration,
    idle_terminal_polls: u32,
    done: bool,
}

impl EventSubscription {
    pub fn new(store: Arc<TaskStore>, task_id: &str, after: i64, poll: Duration) -> Self {
        Self {
            store,
            task_id: task_id.to_string(),
            last_seq: after,
            buffer: VecDeque::new(),
            poll,
            idle_terminal_polls: 0,
            done: false,
        }
    }

    fn fetch(&mut self) -> Result<(), StoreError> {
        let events = self.store.events_after(&self.task_id, self.last_seq)?;
        if let Some(last) = events.last() {
            self.last_seq = last.seq;
        }
        self.buffer.extend(events);
        Ok(())
    }
}

impl Iterator for EventSubscription {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                if event.phase.is_terminal() {
                    self.done = true;
                }
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fetch() {
                self.done = true;
                return Some(Err(err.into()));
            }
            if !self.buffer.is_empty() {
                continue;
            }
            // A terminal task with nothing left to read: the terminal event
            // was consumed before `after`. Poll twice so an event appended
            // right after the state change is not missed.
            match self.store.get_task(&self.task_id) {
                Ok(task) if task.state.is_terminal() => {
                    self.idle_terminal_polls += 1;
                    if self.idle_terminal_polls > 1 {
                        return None;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
            thread::sleep(self.poll);
        }
    }
}

/// `<prefix><slug>-<suffix>`, from the first words of the prompt.
pub fn default_target_branch(prefix: &str, prompt: &str) -> String {
    let mut slug = String::new();
    for word in prompt
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if slug.len() + word.len() + 1 > 40 {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word.to_ascii_lowercase());
    }
    if slug.is_empty() {
        slug.push_str("change");
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{slug}-{}", &id[..6])
}

fn validate_project_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("project name must not be empty");
    }
    if name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!("project name `{name}` may only contain letters, digits, `-`, `_` and `.`");
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| anyhow!("resolve {}: {e}", path.display()))
}
