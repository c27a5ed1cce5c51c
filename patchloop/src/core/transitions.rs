//! Executor-owned counter updates and iteration decisions.
//!
//! The orchestrator feeds each iteration's result through
//! [`record_iteration`], which mutates the task's counters and decides whether
//! the task keeps running, converges toward completion, or fails. Keeping this
//! pure lets the ceilings be tested without git or a model.

use crate::core::types::{PreflightOutcome, Task};

/// Ceilings that bound a task's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ceilings {
    /// Consecutive `generate_diff` exhaustions before the task fails.
    pub max_consecutive_failures: u32,
    /// Consecutive patch-application failures before the task fails.
    pub max_apply_failures: u32,
    /// Applied iterations with a failing preflight before the task fails.
    pub max_iterations: u32,
}

impl Default for Ceilings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            max_apply_failures: 3,
            max_iterations: 5,
        }
    }
}

/// What happened during one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    /// `generate_diff` used its whole attempt budget without a usable answer.
    DiffExhausted,
    /// The model answered with the sentinel.
    NoChanges,
    /// The diff was valid but did not apply to the working copy.
    ApplyFailed,
    /// The diff applied and was committed.
    Applied { preflight: PreflightOutcome },
}

/// Next step for the task after an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Stay `running` and start another iteration.
    Continue,
    /// Stop iterating; publish if there is anything to publish, then complete.
    Converge,
    /// Transition to `failed` with the given reason.
    Fail(String),
}

/// Apply the counter rules for `result` to `task` and decide what comes next.
pub fn record_iteration(task: &mut Task, result: IterationResult, ceilings: &Ceilings) -> Decision {
    match result {
        IterationResult::DiffExhausted => {
            task.consecutive_failures += 1;
            if task.consecutive_failures >= ceilings.max_consecutive_failures {
                return Decision::Fail(format!(
                    "diff generation exhausted ({} consecutive failures)",
                    task.consecutive_failures
                ));
            }
            Decision::Continue
        }
        IterationResult::NoChanges => Decision::Converge,
        IterationResult::ApplyFailed => {
            task.apply_failures += 1;
            if task.apply_failures >= ceilings.max_apply_failures {
                return Decision::Fail(format!(
                    "patch application exhausted ({} consecutive apply failures)",
                    task.apply_failures
                ));
            }
            Decision::Continue
        }
        IterationResult::Applied { preflight } => {
            task.consecutive_failures = 0;
            task.apply_failures = 0;
            task.iteration += 1;
            match preflight {
                PreflightOutcome::Pass | PreflightOutcome::Skipped => Decision::Converge,
                PreflightOutcome::Fail if task.iteration >= ceilings.max_iterations => {
                    Decision::Fail(format!(
                        "preflight still failing after {} iterations",
                        task.iteration
                    ))
                }
                PreflightOutcome::Fail => Decision::Continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskState;

    fn task() -> Task {
        Task {
            id: "t".to_string(),
            project_id: "p".to_string(),
            prompt: "do it".to_string(),
            source_branch: "main".to_string(),
            target_branch: "patchloop/t".to_string(),
            iteration: 0,
            consecutive_failures: 0,
            apply_failures: 0,
            state: TaskState::Running,
            reason: None,
            cancel_requested: false,
            pr_url: None,
            pr_remote_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn diff_exhaustion_fails_at_ceiling() {
        let mut task = task();
        let ceilings = Ceilings::default();
        assert_eq!(
            record_iteration(&mut task, IterationResult::DiffExhausted, &ceilings),
            Decision::Continue
        );
        assert_eq!(
            record_iteration(&mut task, IterationResult::DiffExhausted, &ceilings),
            Decision::Continue
        );
        let decision = record_iteration(&mut task, IterationResult::DiffExhausted, &ceilings);
        assert!(matches!(decision, Decision::Fail(reason) if reason.contains("diff generation exhausted")));
        assert_eq!(task.consecutive_failures, 3);
    }

    #[test]
    fn apply_failures_do_not_touch_diff_counter() {
        let mut task = task();
        task.consecutive_failures = 1;
        let decision = record_iteration(&mut task, IterationResult::ApplyFailed, &Ceilings::default());
        assert_eq!(decision, Decision::Continue);
        assert_eq!(task.consecutive_failures, 1);
        assert_eq!(task.apply_failures, 1);
        assert_eq!(task.iteration, 0);
    }

    #[test]
    fn apply_failures_fail_at_their_own_ceiling() {
        let mut task = task();
        let ceilings = Ceilings {
            max_apply_failures: 2,
            ..Ceilings::default()
        };
        record_iteration(&mut task, IterationResult::ApplyFailed, &ceilings);
        let decision = record_iteration(&mut task, IterationResult::ApplyFailed, &ceilings);
        assert!(matches!(decision, Decision::Fail(reason) if reason.contains("patch application exhausted")));
    }

    #[test]
    fn successful_apply_resets_counters_and_converges() {
        let mut task = task();
        task.consecutive_failures = 2;
        task.apply_failures = 2;
        let decision = record_iteration(
            &mut task,
            IterationResult::Applied {
                preflight: PreflightOutcome::Skipped,
            },
            &Ceilings::default(),
        );
        assert_eq!(decision, Decision::Converge);
        assert_eq!(task.iteration, 1);
        assert_eq!(task.consecutive_failures, 0);
        assert_eq!(task.apply_failures, 0);
    }

    #[test]
    fn failing_preflight_continues_until_iteration_ceiling() {
        let mut task = task();
        let ceilings = Ceilings {
            max_iterations: 2,
            ..Ceilings::default()
        };
        let failing = IterationResult::Applied {
            preflight: PreflightOutcome::Fail,
        };
        assert_eq!(record_iteration(&mut task, failing, &ceilings), Decision::Continue);
        let decision = record_iteration(&mut task, failing, &ceilings);
        assert!(matches!(decision, Decision::Fail(reason) if reason.contains("preflight")));
        assert_eq!(task.iteration, 2);
    }

    #[test]
    fn no_changes_converges_without_touching_counters() {
        let mut task = task();
        task.consecutive_failures = 1;
        let decision = record_iteration(&mut task, IterationResult::NoChanges, &Ceilings::default());
        assert_eq!(decision, Decision::Converge);
        assert_eq!(task.consecutive_failures, 1);
        assert_eq!(task.iteration, 0);
    }
}
