//! Turning one task iteration into a validated diff.
//!
//! Each call makes at most [`MAX_DIFF_ATTEMPTS`] model calls. Every reply is
//! classified into an [`AttemptResult`]; content and transport failures feed
//! the next attempt's `VALIDATION ERROR` section, the sentinel and a valid
//! diff end the loop. One event is appended per attempt.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::diff_validator::{Validation, validate};
use crate::core::sanitizer::{NO_DIFF_FOUND, sanitize};
use crate::core::types::{AttemptResult, NO_CHANGES_SENTINEL, PatchOutcome, Severity, Task};
use crate::io::artifacts::{AttemptMeta, IterationArtifacts};
use crate::io::model::{ModelProvider, ModelRequest};
use crate::io::prompt::{PromptBuilder, PromptInputs, RepoContext};
use crate::io::store::TaskStore;

/// Model calls per `generate_diff` invocation (1 initial + 2 retries).
pub const MAX_DIFF_ATTEMPTS: u32 = 3;

/// Per-iteration input that is not part of the task record.
#[derive(Debug, Clone, Default)]
pub struct IterationContext {
    /// Iteration number the diff is for (the task's applied count so far).
    pub iteration: u32,
    /// Apply or preflight output from the previous iteration.
    pub feedback: Option<String>,
    pub repo: RepoContext,
}

/// Classify one raw model reply.
///
/// The sentinel is recognized before anything else and is never sanitized or
/// validated.
pub fn classify_response(raw: &str) -> AttemptResult {
    if raw.trim() == NO_CHANGES_SENTINEL {
        return AttemptResult::Sentinel;
    }
    let Some(diff) = sanitize(raw) else {
        return AttemptResult::ContentError(NO_DIFF_FOUND.to_string());
    };
    match validate(&diff) {
        Validation::Valid => AttemptResult::Success(diff),
        Validation::NoChanges => AttemptResult::Sentinel,
        Validation::Invalid { reasons } => {
            AttemptResult::ContentError(format!("invalid diff: {}", reasons.join("; ")))
        }
    }
}

pub struct PatchGenerator<'a> {
    model: &'a dyn ModelProvider,
    prompts: &'a PromptBuilder,
    store: &'a TaskStore,
    artifacts_dir: Option<&'a Path>,
}

impl<'a> PatchGenerator<'a> {
    pub fn new(model: &'a dyn ModelProvider, prompts: &'a PromptBuilder, store: &'a TaskStore) -> Self {
        Self {
            model,
            prompts,
            store,
            artifacts_dir: None,
        }
    }

    /// Also write raw replies under `<dir>/<task>/<iteration>/`.
    pub fn with_artifacts(mut self, dir: &'a Path) -> Self {
        self.artifacts_dir = Some(dir);
        self
    }

    /// Ask the model for a diff.
    ///
    /// Returns `Ok(None)` when every attempt failed. Errors are reserved for
    /// failures outside the model exchange (prompt rendering, event log).
    #[instrument(skip_all, fields(task_id = %task.id, iteration = ctx.iteration))]
    pub fn generate_diff(&self, task: &Task, ctx: &IterationContext) -> Result<Option<PatchOutcome>> {
        let system = self.prompts.system_prompt()?;
        let artifacts = self
            .artifacts_dir
            .map(|dir| IterationArtifacts::new(dir, &task.id, ctx.iteration));
        let mut last_failure: Option<String> = None;

        for attempt in 1..=MAX_DIFF_ATTEMPTS {
            let user = self.prompts.user_prompt(&PromptInputs {
                task: task.prompt.clone(),
                feedback: ctx.feedback.clone(),
                validation_error: last_failure.take(),
                attempt,
                iteration: ctx.iteration,
                branch: task.target_branch.clone(),
                repo: ctx.repo.clone(),
            })?;
            let request = ModelRequest {
                system: system.clone(),
                user,
            };

            let (result, raw) = match self.model.complete(&request) {
                Ok(raw) => (classify_response(&raw), raw),
                Err(err) => (
                    AttemptResult::TransportError(format!("model call failed: {err:#}")),
                    String::new(),
                ),
            };
            debug!(attempt, outcome = result.label(), "model attempt classified");
            if let Some(artifacts) = &artifacts {
                write_attempt_artifact(artifacts, task, ctx.iteration, attempt, &result, &raw);
            }
            self.record_attempt(task, attempt, &result)?;

            match result {
                AttemptResult::Success(diff) => return Ok(Some(PatchOutcome::Diff(diff))),
                AttemptResult::Sentinel => return Ok(Some(PatchOutcome::NoChanges)),
                AttemptResult::ContentError(reason) | AttemptResult::TransportError(reason) => {
                    last_failure = Some(reason);
                }
            }
        }
        Ok(None)
    }

    fn record_attempt(&self, task: &Task, attempt: u32, result: &AttemptResult) -> Result<()> {
        let prefix = format!("attempt {attempt}/{MAX_DIFF_ATTEMPTS}: {}", result.label());
        let (severity, message) = match result {
            AttemptResult::Success(_) | AttemptResult::Sentinel => (Severity::Info, prefix),
            AttemptResult::ContentError(reason) | AttemptResult::TransportError(reason) => {
                (Severity::Warning, format!("{prefix}: {reason}"))
            }
        };
        self.store.append_event(&task.id, severity, &message)?;
        Ok(())
    }
}

fn write_attempt_artifact(
    artifacts: &IterationArtifacts,
    task: &Task,
    iteration: u32,
    attempt: u32,
    result: &AttemptResult,
    raw: &str,
) {
    let reason = match result {
        AttemptResult::ContentError(reason) | AttemptResult::TransportError(reason) => {
            Some(reason.as_str())
        }
        _ => None,
    };
    let meta = AttemptMeta {
        task_id: &task.id,
        iteration,
        attempt,
        outcome: result.label(),
        reason,
    };
    if let Err(err) = artifacts.write_attempt(&meta, raw) {
        warn!(error = %err, "failed to write attempt artifact");
    }
}
