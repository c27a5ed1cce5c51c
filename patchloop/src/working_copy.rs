//! Task branches inside a project's working copy.
//!
//! Every method leaves the worktree clean: on any failure after touching
//! files the branch is reset to its last commit and untracked files are
//! removed. Callers hold the project lock around each call.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::io::git::{ApplyResult, Author, Git};

#[derive(Debug, Error)]
pub enum WorkingCopyError {
    #[error("not a git working copy: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("source branch `{0}` does not exist")]
    MissingSource(String),

    #[error(
        "branch conflict: `{branch}` has commits not reachable from `{base}` (enable branch.force to reset it)"
    )]
    BranchConflict { branch: String, base: String },

    /// `git apply` stderr, verbatim.
    #[error("{0}")]
    ApplyFailure(String),

    #[error(transparent)]
    Git(#[from] anyhow::Error),
}

impl WorkingCopyError {
    /// Failures a task cannot recover from by iterating.
    ///
    /// A failed or timed-out git step is retried within the apply budget.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkingCopyError::NotARepository(_)
                | WorkingCopyError::MissingSource(_)
                | WorkingCopyError::BranchConflict { .. }
        )
    }
}

/// Owns branch setup, patch application and rollback for one working copy.
#[derive(Debug, Clone)]
pub struct WorkingCopyManager {
    git: Git,
    author: Author,
    force: bool,
}

impl WorkingCopyManager {
    pub fn new(git: Git, author: Author, force: bool) -> Self {
        Self { git, author, force }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Create or reset `target` at the tip of `source` and check it out.
    ///
    /// An existing `target` that holds commits not reachable from `source` is
    /// a conflict unless force is configured. Returns the source tip.
    #[instrument(skip_all, fields(source, target))]
    pub fn ensure_branch(&self, source: &str, target: &str) -> Result<String, WorkingCopyError> {
        self.require_work_tree()?;
        let source_tip = self
            .git
            .try_rev_parse(&format!("refs/heads/{source}"))?
            .ok_or_else(|| WorkingCopyError::MissingSource(source.to_string()))?;

        if self.git.branch_exists(target)? {
            let target_tip = self.git.rev_parse(&format!("refs/heads/{target}"))?;
            if !self.git.is_ancestor(&target_tip, &source_tip)? {
                if !self.force {
                    return Err(WorkingCopyError::BranchConflict {
                        branch: target.to_string(),
                        base: source.to_string(),
                    });
                }
                warn!(target, "resetting divergent branch (branch.force)");
            }
        }

        self.discard_changes()?;
        self.git.checkout_reset(target, &source_tip)?;
        info!(target, source_tip = %short(&source_tip), "task branch ready");
        Ok(source_tip)
    }

    /// Check out an existing task branch with a clean tree.
    ///
    /// Used before every apply and when resuming after a restart; falls back
    /// to [`Self::ensure_branch`] when the branch is gone.
    pub fn checkout_task_branch(&self, source: &str, target: &str) -> Result<(), WorkingCopyError> {
        self.require_work_tree()?;
        if !self.git.branch_exists(target)? {
            self.ensure_branch(source, target)?;
            return Ok(());
        }
        self.discard_changes()?;
        if self.git.current_branch()? != target {
            self.git.checkout(target)?;
        }
        Ok(())
    }

    /// Apply `diff` on `target`, stage everything and commit.
    ///
    /// Returns the new commit id. On rejection the tree is restored and the
    /// tool's stderr is returned as [`WorkingCopyError::ApplyFailure`].
    #[instrument(skip_all, fields(target))]
    pub fn apply_patch(
        &self,
        source: &str,
        target: &str,
        diff: &str,
        message: &str,
    ) -> Result<String, WorkingCopyError> {
        self.checkout_task_branch(source, target)?;
        match self.commit_diff(diff, message) {
            Ok(commit) => Ok(commit),
            Err(err) => {
                if let Err(cleanup) = self.discard_changes() {
                    warn!(error = %cleanup, "cleanup after failed apply also failed");
                }
                Err(err)
            }
        }
    }

    fn commit_diff(&self, diff: &str, message: &str) -> Result<String, WorkingCopyError> {
        if let ApplyResult::Rejected(stderr) = self.git.apply(diff)? {
            return Err(WorkingCopyError::ApplyFailure(stderr));
        }
        self.git.add_all()?;
        if !self.git.commit_staged(message, &self.author)? {
            return Err(WorkingCopyError::ApplyFailure(
                "patch applied cleanly but changed nothing".to_string(),
            ));
        }
        Ok(self.git.rev_parse("HEAD")?)
    }

    /// Reset `target` to the tip of `source`, dropping applied commits.
    #[instrument(skip_all, fields(source, target))]
    pub fn rollback(&self, source: &str, target: &str) -> Result<(), WorkingCopyError> {
        self.require_work_tree()?;
        let source_tip = self
            .git
            .try_rev_parse(&format!("refs/heads/{source}"))?
            .ok_or_else(|| WorkingCopyError::MissingSource(source.to_string()))?;
        self.discard_changes()?;
        self.git.checkout_reset(target, &source_tip)?;
        Ok(())
    }

    /// Commits on `target` that are not on `source`.
    pub fn applied_commits(&self, source: &str, target: &str) -> Result<u32, WorkingCopyError> {
        if !self.git.branch_exists(target)? {
            return Ok(0);
        }
        Ok(self
            .git
            .commits_ahead(&format!("refs/heads/{source}"), &format!("refs/heads/{target}"))?)
    }

    fn discard_changes(&self) -> Result<(), WorkingCopyError> {
        self.git.reset_hard(None)?;
        self.git.clean()?;
        Ok(())
    }

    fn require_work_tree(&self) -> Result<(), WorkingCopyError> {
        if self.git.is_work_tree()? {
            Ok(())
        } else {
            Err(WorkingCopyError::NotARepository(
                self.git.workdir().to_path_buf(),
            ))
        }
    }
}

fn short(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        HELLO_WORLD_DIFF, STALE_DIFF, TEST_TIMEOUT, TestRepo, new_file_diff, test_author,
    };

    fn manager(repo: &TestRepo, force: bool) -> WorkingCopyManager {
        WorkingCopyManager::new(repo.git().clone(), test_author(), force)
    }

    #[test]
    fn ensure_branch_creates_target_at_source_tip() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        let tip = wc.ensure_branch("main", "patchloop/x").expect("ensure");
        assert_eq!(repo.git().current_branch().expect("branch"), "patchloop/x");
        assert_eq!(repo.git().rev_parse("HEAD").expect("head"), tip);
    }

    #[test]
    fn ensure_branch_rejects_divergent_target_without_force() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        wc.ensure_branch("main", "patchloop/x").expect("ensure");
        repo.write_file("extra.txt", "diverged\n").expect("write");
        repo.commit_all("diverge").expect("commit");
        repo.git().checkout("main").expect("checkout");

        let err = wc.ensure_branch("main", "patchloop/x").unwrap_err();
        assert!(matches!(err, WorkingCopyError::BranchConflict { .. }));
        assert!(err.is_fatal());

        let forced = manager(&repo, true);
        forced.ensure_branch("main", "patchloop/x").expect("force");
        assert!(!repo.path().join("extra.txt").exists());
    }

    #[test]
    fn ensure_branch_accepts_target_behind_source() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        wc.ensure_branch("main", "patchloop/x").expect("ensure");
        repo.git().checkout("main").expect("checkout");
        repo.write_file("later.txt", "later\n").expect("write");
        repo.commit_all("advance main").expect("commit");

        wc.ensure_branch("main", "patchloop/x").expect("fast-forwardable");
        assert!(repo.path().join("later.txt").exists());
    }

    #[test]
    fn missing_source_and_non_repository_are_reported() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        assert!(matches!(
            wc.ensure_branch("develop", "patchloop/x"),
            Err(WorkingCopyError::MissingSource(_))
        ));

        let temp = tempfile::tempdir().expect("tempdir");
        let not_repo = WorkingCopyManager::new(Git::new(temp.path(), TEST_TIMEOUT), test_author(), false);
        assert!(matches!(
            not_repo.ensure_branch("main", "patchloop/x"),
            Err(WorkingCopyError::NotARepository(_))
        ));
    }

    #[test]
    fn apply_patch_commits_on_target() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        wc.ensure_branch("main", "patchloop/x").expect("ensure");

        wc.apply_patch("main", "patchloop/x", HELLO_WORLD_DIFF, "add hello")
            .expect("apply");
        assert!(repo.read_file("src/index.ts").expect("read").contains("hello world"));
        assert_eq!(wc.applied_commits("main", "patchloop/x").expect("ahead"), 1);
    }

    #[test]
    fn apply_failure_returns_stderr_and_leaves_tree_clean() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        wc.ensure_branch("main", "patchloop/x").expect("ensure");
        let head = repo.git().rev_parse("HEAD").expect("head");
        repo.write_file("stray.txt", "left over\n").expect("stray");

        let err = wc
            .apply_patch("main", "patchloop/x", STALE_DIFF, "stale")
            .unwrap_err();
        let WorkingCopyError::ApplyFailure(stderr) = &err else {
            panic!("expected apply failure, got {err:?}");
        };
        assert!(stderr.contains("src/index.ts"));
        assert!(!err.is_fatal());
        assert_eq!(repo.git().rev_parse("HEAD").expect("head"), head);
        assert!(!repo.path().join("stray.txt").exists());
        assert_eq!(repo.read_file("src/index.ts").expect("read"), crate::test_support::INDEX_TS);
    }

    #[test]
    fn stale_index_lock_is_a_retryable_git_failure() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        wc.ensure_branch("main", "patchloop/x").expect("ensure");
        let lock = repo.path().join(".git/index.lock");
        std::fs::write(&lock, "").expect("lock");

        let err = wc
            .apply_patch("main", "patchloop/x", &new_file_diff("NOTES.md", "hi"), "notes")
            .unwrap_err();
        assert!(matches!(err, WorkingCopyError::Git(_)), "got {err:?}");
        assert!(!err.is_fatal());
        assert!(format!("{err:#}").contains("index.lock"));

        std::fs::remove_file(&lock).expect("unlock");
        wc.apply_patch("main", "patchloop/x", &new_file_diff("NOTES.md", "hi"), "notes")
            .expect("apply after the lock is gone");
        assert_eq!(wc.applied_commits("main", "patchloop/x").expect("ahead"), 1);
    }

    #[test]
    fn rollback_drops_applied_commits() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        wc.ensure_branch("main", "patchloop/x").expect("ensure");
        wc.apply_patch("main", "patchloop/x", &new_file_diff("NOTES.md", "hi"), "notes")
            .expect("apply");
        assert_eq!(wc.applied_commits("main", "patchloop/x").expect("ahead"), 1);

        wc.rollback("main", "patchloop/x").expect("rollback");
        assert_eq!(wc.applied_commits("main", "patchloop/x").expect("ahead"), 0);
        assert!(!repo.path().join("NOTES.md").exists());
    }

    #[test]
    fn apply_switches_back_to_task_branch() {
        let repo = TestRepo::new().expect("repo");
        let wc = manager(&repo, false);
        wc.ensure_branch("main", "patchloop/x").expect("ensure");
        repo.git().checkout("main").expect("other branch");

        wc.apply_patch("main", "patchloop/x", HELLO_WORLD_DIFF, "add hello")
            .expect("apply");
        assert_eq!(repo.git().current_branch().expect("branch"), "patchloop/x");
    }
}
