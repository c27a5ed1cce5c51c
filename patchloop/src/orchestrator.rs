//! Driving one task from `running` to a terminal state.
//!
//! Each iteration asks the [`PatchGenerator`] for a diff, applies it through
//! the [`WorkingCopyManager`], runs the preflight and feeds the result through
//! [`record_iteration`]. Counter changes are persisted before the next step
//! and every transition is appended to the task's event log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::core::transitions::{Decision, IterationResult, record_iteration};
use crate::core::types::{PatchOutcome, PreflightOutcome, Project, Severity, Task, TaskState};
use crate::io::artifacts::IterationArtifacts;
use crate::io::config::{CancelPolicy, ExecutorConfig};
use crate::io::git::Git;
use crate::io::hosting::{CodeHost, GitHubHost, parse_repo_slug};
use crate::io::locks::ProjectLocks;
use crate::io::model::{ModelProvider, build_provider};
use crate::io::preflight::{Preflight, PreflightReport, build_preflight};
use crate::io::prompt::{PromptBuilder, RepoContext, collect_repo_context};
use crate::io::store::TaskStore;
use crate::patch_generator::{IterationContext, PatchGenerator};
use crate::publish::{PublishOutcome, Publisher, pull_request_title};
use crate::working_copy::{WorkingCopyError, WorkingCopyManager};

/// Lines of apply/preflight output quoted in event messages.
const EVENT_EXCERPT_LINES: usize = 6;

/// Explicitly constructed collaborators of an [`Orchestrator`].
pub struct OrchestratorParts {
    pub store: Arc<TaskStore>,
    pub locks: Arc<ProjectLocks>,
    pub model: Arc<dyn ModelProvider>,
    pub host: Arc<dyn CodeHost>,
    pub preflight: Arc<dyn Preflight>,
    pub config: ExecutorConfig,
    /// Where attempt artifacts go; `None` disables them.
    pub artifacts_dir: Option<PathBuf>,
}

impl OrchestratorParts {
    /// Build the production collaborators selected by `config`.
    pub fn from_config(
        config: ExecutorConfig,
        store: Arc<TaskStore>,
        artifacts_dir: PathBuf,
    ) -> Result<Self> {
        let model = build_provider(&config.model, config.model_timeout())
            .context("configure model provider")?;
        let host = GitHubHost::from_env(&config.hosting, config.hosting_timeout())
            .context("configure code host")?;
        let preflight = build_preflight(&config.preflight.command, config.preflight_timeout())
            .context("configure preflight")?;
        Ok(Self {
            store,
            locks: Arc::new(ProjectLocks::new()),
            model,
            host: Arc::new(host),
            preflight: Arc::from(preflight),
            config,
            artifacts_dir: Some(artifacts_dir),
        })
    }
}

/// Result of applying one diff.
enum ApplyStep {
    Applied { commit: String, report: PreflightReport },
    Rejected(String),
}

pub struct Orchestrator {
    store: Arc<TaskStore>,
    locks: Arc<ProjectLocks>,
    model: Arc<dyn ModelProvider>,
    host: Arc<dyn CodeHost>,
    preflight: Arc<dyn Preflight>,
    prompts: PromptBuilder,
    config: ExecutorConfig,
    artifacts_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Result<Self> {
        parts.config.validate()?;
        let prompts = PromptBuilder::new(parts.config.prompt.budget_bytes)?;
        Ok(Self {
            store: parts.store,
            locks: parts.locks,
            model: parts.model,
            host: parts.host,
            preflight: parts.preflight,
            prompts,
            config: parts.config,
            artifacts_dir: parts.artifacts_dir,
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Claim a queued task and run it to a terminal state.
    ///
    /// Returns `Ok(None)` when the task was no longer queued (claimed by
    /// another worker or cancelled first).
    pub fn run_queued(&self, task_id: &str) -> Result<Option<Task>> {
        if !self.store.claim_queued(task_id)? {
            return Ok(None);
        }
        self.run_claimed(task_id, false).map(Some)
    }

    /// Continue a task left `running` by a previous process.
    pub fn resume(&self, task_id: &str) -> Result<Task> {
        self.run_claimed(task_id, true)
    }

    #[instrument(skip_all, fields(task_id, resumed))]
    fn run_claimed(&self, task_id: &str, resumed: bool) -> Result<Task> {
        let task = self.store.get_task(task_id)?;
        if task.state != TaskState::Running {
            anyhow::bail!("task {task_id} is {}, not running", task.state);
        }
        match self.drive(task, resumed) {
            Ok(task) => Ok(task),
            Err(err) => {
                error!(error = %format!("{err:#}"), "task aborted");
                let latest = self.store.get_task(task_id)?;
                if latest.state.is_terminal() {
                    return Err(err);
                }
                self.fail(latest, format!("unrecoverable error: {err:#}"))
            }
        }
    }

    fn drive(&self, mut task: Task, resumed: bool) -> Result<Task> {
        let project = self.store.get_project(&task.project_id)?;
        let wc = WorkingCopyManager::new(
            Git::new(&project.path, self.config.git_timeout()),
            self.config.author(),
            self.config.branch.force,
        );

        if resumed {
            self.event(
                &task,
                Severity::Warning,
                &format!(
                    "resumed after restart at iteration {} (diff failures {}, apply failures {})",
                    task.iteration, task.consecutive_failures, task.apply_failures
                ),
            )?;
        } else {
            self.event(
                &task,
                Severity::Info,
                &format!(
                    "task started on project `{}`: `{}` -> `{}`",
                    project.name, task.source_branch, task.target_branch
                ),
            )?;
        }

        // Local and bare-path remotes are pushed to but never get a pull request.
        if project.remote_url.as_deref().and_then(parse_repo_slug).is_some()
            && let Err(err) = self.host.check_credentials()
        {
            return self.fail(task, format!("{err:#}"));
        }

        let setup = self.locks.with_project(&project.id, || {
            if resumed {
                wc.checkout_task_branch(&task.source_branch, &task.target_branch)
            } else {
                wc.ensure_branch(&task.source_branch, &task.target_branch)
                    .map(|_| ())
            }
        })?;
        if let Err(err) = setup {
            return self.fail(task, err.to_string());
        }
        self.event(
            &task,
            Severity::Info,
            &format!("branch `{}` ready in {}", task.target_branch, project.path.display()),
        )?;

        let ceilings = self.config.ceilings();
        let mut feedback: Option<String> = None;
        let mut last_preflight: Option<PreflightOutcome> = None;

        loop {
            if self.store.is_cancel_requested(&task.id)? {
                return self.cancel(task, &project, &wc);
            }

            let iteration = task.iteration;
            self.event(
                &task,
                Severity::Info,
                &format!("iteration {} started", iteration + 1),
            )?;

            let repo = match self.repo_context(&task, &project, &wc)? {
                Ok(repo) => Some(repo),
                Err(err) if err.is_fatal() => return self.fail(task, err.to_string()),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "could not prepare the task branch");
                    self.event(
                        &task,
                        Severity::Warning,
                        &format!("could not prepare branch `{}`: {err:#}", task.target_branch),
                    )?;
                    None
                }
            };

            let outcome = match repo {
                Some(repo) => {
                    let mut generator =
                        PatchGenerator::new(self.model.as_ref(), &self.prompts, &self.store);
                    if let Some(dir) = &self.artifacts_dir {
                        generator = generator.with_artifacts(dir);
                    }
                    let outcome = generator.generate_diff(
                        &task,
                        &IterationContext {
                            iteration,
                            feedback: feedback.clone(),
                            repo,
                        },
                    )?;
                    Some(outcome)
                }
                None => None,
            };

            // What failed and its output, for apply-failure events.
            let mut rejected: Option<(&str, String)> = None;
            let result = match outcome {
                // Branch preparation failed; counts like a rejected patch.
                None => {
                    rejected = Some(("branch preparation failed", String::new()));
                    IterationResult::ApplyFailed
                }
                Some(None) => IterationResult::DiffExhausted,
                Some(Some(PatchOutcome::NoChanges)) => IterationResult::NoChanges,
                Some(Some(PatchOutcome::Diff(diff))) => match self.apply(&task, &project, &wc, &diff)? {
                    ApplyStep::Applied { commit, report } => {
                        self.event(
                            &task,
                            Severity::Info,
                            &format!(
                                "patch applied as commit {} (iteration {})",
                                short(&commit),
                                iteration + 1
                            ),
                        )?;
                        self.log_preflight(&task, &report)?;
                        last_preflight = Some(report.outcome);
                        feedback = (report.outcome == PreflightOutcome::Fail).then(|| {
                            format!(
                                "The preflight check failed after iteration {}:\n{}",
                                iteration + 1,
                                report.output.trim_end()
                            )
                        });
                        IterationResult::Applied {
                            preflight: report.outcome,
                        }
                    }
                    ApplyStep::Rejected(stderr) => {
                        feedback = Some(format!(
                            "The previous diff did not apply to branch `{}`:\n{}",
                            task.target_branch,
                            stderr.trim_end()
                        ));
                        rejected = Some(("patch did not apply", stderr));
                        IterationResult::ApplyFailed
                    }
                },
            };

            let decision = record_iteration(&mut task, result, &ceilings);
            self.store.update_task(&mut task)?;

            match result {
                IterationResult::DiffExhausted => self.event(
                    &task,
                    Severity::Warning,
                    &format!(
                        "diff generation exhausted ({}/{} consecutive failures)",
                        task.consecutive_failures, ceilings.max_consecutive_failures
                    ),
                )?,
                IterationResult::ApplyFailed => {
                    let (what, output) = rejected.unwrap_or(("patch did not apply", String::new()));
                    let mut message = format!(
                        "{what} ({}/{} apply failures)",
                        task.apply_failures, ceilings.max_apply_failures
                    );
                    if !output.trim().is_empty() {
                        message.push_str(": ");
                        message.push_str(&excerpt(&output));
                    }
                    self.event(&task, Severity::Warning, &message)?;
                }
                IterationResult::NoChanges => {
                    self.event(&task, Severity::Info, "model reported no changes needed")?;
                }
                IterationResult::Applied { .. } => {}
            }

            match decision {
                Decision::Continue => {}
                Decision::Converge => return self.converge(task, &project, &wc, last_preflight),
                Decision::Fail(reason) => return self.fail(task, reason),
            }
        }
    }

    /// Check out the task branch and gather prompt context.
    ///
    /// The inner error is the working copy's; only [`WorkingCopyError::is_fatal`]
    /// failures end the task.
    fn repo_context(
        &self,
        task: &Task,
        project: &Project,
        wc: &WorkingCopyManager,
    ) -> Result<Result<RepoContext, WorkingCopyError>> {
        self.locks.with_project(&project.id, || -> Result<RepoContext, WorkingCopyError> {
            wc.checkout_task_branch(&task.source_branch, &task.target_branch)?;
            Ok(collect_repo_context(wc.git(), &task.prompt, &self.config.prompt)?)
        })
    }

    /// Apply `diff`, then run the preflight, both under the project lock.
    fn apply(&self, task: &Task, project: &Project, wc: &WorkingCopyManager, diff: &str) -> Result<ApplyStep> {
        let iteration = task.iteration + 1;
        let message = format!(
            "{}\n\npatchloop task {} iteration {iteration}",
            pull_request_title(&task.prompt),
            task.id
        );
        let step = self.locks.with_project(&project.id, || -> Result<ApplyStep> {
            let commit = match wc.apply_patch(&task.source_branch, &task.target_branch, diff, &message) {
                Ok(commit) => commit,
                Err(WorkingCopyError::ApplyFailure(stderr)) => return Ok(ApplyStep::Rejected(stderr)),
                Err(err) if !err.is_fatal() => {
                    warn!(error = %format!("{err:#}"), "git failed while committing the patch");
                    return Ok(ApplyStep::Rejected(format!("{err:#}")));
                }
                Err(err) => return Err(err.into()),
            };
            let report = self
                .preflight
                .run(wc.git().workdir())
                .context("preflight could not run")?;
            Ok(ApplyStep::Applied { commit, report })
        })??;

        if let (Some(dir), ApplyStep::Applied { report, .. }) = (&self.artifacts_dir, &step) {
            let artifacts = IterationArtifacts::new(dir, &task.id, task.iteration);
            let written = artifacts
                .write_applied_diff(diff)
                .and_then(|()| artifacts.write_preflight_log(&report.output));
            if let Err(err) = written {
                warn!(error = %err, "failed to write iteration artifacts");
            }
        }
        Ok(step)
    }

    fn log_preflight(&self, task: &Task, report: &PreflightReport) -> Result<()> {
        match report.outcome {
            PreflightOutcome::Pass => self.event(task, Severity::Info, "preflight passed"),
            PreflightOutcome::Skipped => self.event(task, Severity::Info, "no preflight configured"),
            PreflightOutcome::Fail => self.event(
                task,
                Severity::Warning,
                &format!("preflight failed: {}", excerpt(&report.output)),
            ),
        }
    }

    /// Publish when the branch carries commits, then complete.
    fn converge(
        &self,
        mut task: Task,
        project: &Project,
        wc: &WorkingCopyManager,
        preflight: Option<PreflightOutcome>,
    ) -> Result<Task> {
        let commits = self.locks.with_project(&project.id, || {
            wc.applied_commits(&task.source_branch, &task.target_branch)
        })??;
        if commits == 0 {
            return self.complete(task, "no changes needed".to_string());
        }

        let publisher = Publisher::new(Arc::clone(&self.host));
        match publisher.publish(&task, project, wc.git(), &self.locks, preflight) {
            Ok(PublishOutcome::Published { url, remote_id }) => {
                task.pr_url = Some(url.clone());
                task.pr_remote_id = Some(remote_id);
                self.event(&task, Severity::Info, &format!("pull request opened: {url}"))?;
                self.complete(task, format!("pull request opened: {url}"))
            }
            Ok(PublishOutcome::LocalOnly) => {
                self.event(
                    &task,
                    Severity::Info,
                    &format!(
                        "completed locally: no remote configured, branch `{}` holds {commits} commit(s)",
                        task.target_branch
                    ),
                )?;
                self.complete(task, "completed locally".to_string())
            }
            Err(err) => {
                self.event(&task, Severity::Error, &format!("publication failed: {err:#}"))?;
                self.complete(task, format!("completed; publication failed: {err:#}"))
            }
        }
    }

    fn cancel(&self, task: Task, project: &Project, wc: &WorkingCopyManager) -> Result<Task> {
        self.event(&task, Severity::Warning, "cancellation requested, stopping")?;
        if self.config.cancel_policy == CancelPolicy::Rollback {
            let rolled_back = self.locks.with_project(&project.id, || {
                wc.rollback(&task.source_branch, &task.target_branch)
            })?;
            match rolled_back {
                Ok(()) => self.event(
                    &task,
                    Severity::Info,
                    &format!(
                        "rolled back `{}` to `{}`",
                        task.target_branch, task.source_branch
                    ),
                )?,
                Err(err) => self.event(&task, Severity::Warning, &format!("rollback failed: {err}"))?,
            }
        }
        self.fail(task, "cancelled".to_string())
    }

    fn complete(&self, task: Task, reason: String) -> Result<Task> {
        self.finish(task, TaskState::Completed, reason)
    }

    fn fail(&self, task: Task, reason: String) -> Result<Task> {
        self.finish(task, TaskState::Failed, reason)
    }

    fn finish(&self, mut task: Task, state: TaskState, reason: String) -> Result<Task> {
        task.state = state;
        task.reason = Some(reason.clone());
        self.store.update_task(&mut task)?;
        let severity = match state {
            TaskState::Failed => Severity::Error,
            _ => Severity::Info,
        };
        self.event(&task, severity, &format!("task {state}: {reason}"))?;
        info!(task_id = %task.id, state = %state, reason = %reason, "task finished");
        Ok(task)
    }

    fn event(&self, task: &Task, severity: Severity, message: &str) -> Result<()> {
        self.store.append_event(&task.id, severity, message)?;
        Ok(())
    }
}

fn short(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

/// First lines of tool output for an event message.
fn excerpt(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let mut text = lines
        .iter()
        .take(EVENT_EXCERPT_LINES)
        .copied()
        .collect::<Vec<_>>()
        .join(" | ");
    if lines.len() > EVENT_EXCERPT_LINES {
        text.push_str(" | ...");
    }
    text
}
