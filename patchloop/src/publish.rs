//! Pushing a finished task branch and opening its pull request.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use crate::core::types::{PreflightOutcome, Project, Task};
use crate::io::git::Git;
use crate::io::hosting::{CodeHost, PullRequestSpec, parse_repo_slug};
use crate::io::locks::ProjectLocks;

/// Pull request titles are cut to this many characters.
pub const TITLE_MAX_CHARS: usize = 72;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { url: String, remote_id: String },
    /// The project has no remote; the branch stays local.
    LocalOnly,
}

/// Bounded single-line prefix of the prompt.
pub fn pull_request_title(prompt: &str) -> String {
    let line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("patchloop change");
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS - 1).collect();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}

pub fn pull_request_body(task: &Task, preflight: Option<PreflightOutcome>) -> String {
    let preflight = preflight.map_or("not run", PreflightOutcome::as_str);
    format!(
        "Automated change generated by patchloop.\n\n\
         | | |\n|---|---|\n\
         | Task | `{}` |\n\
         | Iterations | {} |\n\
         | Source branch | `{}` |\n\
         | Target branch | `{}` |\n\
         | Preflight | {} |\n\n\
         ### Request\n\n{}\n",
        task.id,
        task.iteration,
        task.source_branch,
        task.target_branch,
        preflight,
        task.prompt.trim(),
    )
}

pub struct Publisher {
    host: Arc<dyn CodeHost>,
}

impl Publisher {
    pub fn new(host: Arc<dyn CodeHost>) -> Self {
        Self { host }
    }

    /// Push the task branch to the project's remote and open a pull request.
    ///
    /// The push happens under the project lock; the API call does not.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn publish(
        &self,
        task: &Task,
        project: &Project,
        git: &Git,
        locks: &ProjectLocks,
        preflight: Option<PreflightOutcome>,
    ) -> Result<PublishOutcome> {
        let Some(remote_url) = project.remote_url.as_deref() else {
            info!("no remote configured, keeping branch local");
            return Ok(PublishOutcome::LocalOnly);
        };

        locks.with_project(&project.id, || git.push(remote_url, &task.target_branch))??;

        let slug = parse_repo_slug(remote_url).ok_or_else(|| {
            anyhow!(
                "branch `{}` pushed, but `{remote_url}` is not a hosting URL; no pull request opened",
                task.target_branch
            )
        })?;
        let pr = self.host.open_pull_request(&PullRequestSpec {
            slug,
            title: pull_request_title(&task.prompt),
            body: pull_request_body(task, preflight),
            head: task.target_branch.clone(),
            base: task.source_branch.clone(),
        })?;
        info!(url = %pr.url, "pull request opened");
        Ok(PublishOutcome::Published {
            url: pr.url,
            remote_id: pr.remote_id,
        })
    }
}
