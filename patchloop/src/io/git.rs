//! Git adapter for working-copy operations.
//!
//! Every call is a `git` subprocess bounded by the configured timeout; exit
//! status and stderr are always inspected. Commits carry an explicit identity
//! so they do not depend on the host's global git config.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

/// Identity recorded on executor commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// Result of applying a diff to the worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    Clean,
    /// `git apply` refused the patch; carries its stderr verbatim.
    Rejected(String),
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Create a repository at `path` whose unborn default branch is `branch`.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn init(path: &Path, branch: &str, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
        let git = Self::new(path, timeout);
        git.run_checked(&["init", "-q"])?;
        git.run_checked(&["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")])?;
        Ok(git)
    }

    /// Clone `url` into `dest` (which must not exist yet).
    #[instrument(skip_all, fields(dest = %dest.display()))]
    pub fn clone(url: &str, dest: &Path, timeout: Duration) -> Result<Self> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("clone destination has no parent: {}", dest.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
        let parent_git = Self::new(parent, timeout);
        let dest_arg = dest.to_string_lossy();
        parent_git.run_checked(&["clone", "--quiet", url, dest_arg.as_ref()])?;
        Ok(Self::new(dest, timeout))
    }

    /// True when the workdir exists and is inside a git working tree.
    pub fn is_work_tree(&self) -> Result<bool> {
        if !self.workdir.is_dir() {
            return Ok(false);
        }
        let out = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        Ok(out.success() && out.stdout_text().trim() == "true")
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Resolve `rev` to a commit id, or `None` when it does not name a commit.
    pub fn try_rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if out.success() {
            Ok(Some(out.stdout_text().trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Resolve `rev` to a commit id.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        self.try_rev_parse(rev)?
            .ok_or_else(|| anyhow!("unknown revision `{rev}`"))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.success())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", "--quiet", branch])?;
        Ok(())
    }

    /// Create or reset `branch` to `start` and check it out.
    #[instrument(skip_all, fields(branch, start))]
    pub fn checkout_reset(&self, branch: &str, start: &str) -> Result<()> {
        debug!(branch, start, "resetting branch to start point");
        self.run_checked(&["checkout", "--quiet", "-B", branch, start])?;
        Ok(())
    }

    /// `git reset --hard [rev]`.
    pub fn reset_hard(&self, rev: Option<&str>) -> Result<()> {
        match rev {
            Some(rev) => self.run_checked(&["reset", "--quiet", "--hard", rev])?,
            None => self.run_checked(&["reset", "--quiet", "--hard"])?,
        };
        Ok(())
    }

    /// Remove untracked files and directories (`git clean -fd`).
    pub fn clean(&self) -> Result<()> {
        self.run_checked(&["clean", "-fdq"])?;
        Ok(())
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                out.stderr_text().trim()
            )),
        }
    }

    /// Number of commits reachable from `head` but not from `base`.
    pub fn commits_ahead(&self, base: &str, head: &str) -> Result<u32> {
        let range = format!("{base}..{head}");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .map_err(|e| anyhow!("parse rev-list count `{}`: {e}", out.trim()))
    }

    /// Check then apply `diff` to the worktree (not the index).
    #[instrument(skip_all, fields(diff_bytes = diff.len()))]
    pub fn apply(&self, diff: &str) -> Result<ApplyResult> {
        let base = ["apply", "--recount", "--whitespace=nowarn"];
        let mut check_args = base.to_vec();
        check_args.extend(["--check", "-"]);
        let check = self.run_with_stdin(&check_args, diff.as_bytes())?;
        if !check.success() {
            debug!("git apply --check rejected the patch");
            return Ok(ApplyResult::Rejected(rejection_text(&check)));
        }

        let mut apply_args = base.to_vec();
        apply_args.push("-");
        let applied = self.run_with_stdin(&apply_args, diff.as_bytes())?;
        if !applied.success() {
            return Ok(ApplyResult::Rejected(rejection_text(&applied)));
        }
        Ok(ApplyResult::Clean)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--quiet"])?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(anyhow!(
                "git diff --cached failed: {}",
                out.stderr_text().trim()
            )),
        }
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str, author: &Author) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.commit(message, author, false)?;
        Ok(true)
    }

    /// Record a commit with no changes (used to give a fresh repo its first commit).
    pub fn commit_empty(&self, message: &str, author: &Author) -> Result<()> {
        self.commit(message, author, true)
    }

    /// Force-push `branch` to `remote` under the same name.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        self.run_checked(&["push", "--quiet", "--force", remote, &refspec])?;
        Ok(())
    }

    /// URL of `remote`, or `None` when the remote is not configured.
    pub fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        let out = self.run(&["remote", "get-url", remote])?;
        if out.success() {
            Ok(Some(out.stdout_text().trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Tracked file paths at HEAD, sorted.
    pub fn ls_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files"])?;
        let mut files: Vec<String> = out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    fn commit(&self, message: &str, author: &Author, allow_empty: bool) -> Result<()> {
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        let mut args = vec![
            "-c",
            name.as_str(),
            "-c",
            email.as_str(),
            "commit",
            "--quiet",
            "--no-verify",
            "-m",
            message,
        ];
        if allow_empty {
            args.push("--allow-empty");
        }
        self.run_checked(&args)?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        run_command_with_timeout(
            self.command(args),
            None,
            self.timeout,
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )
    }

    fn run_with_stdin(&self, args: &[&str], stdin: &[u8]) -> Result<CommandOutput> {
        run_command_with_timeout(
            self.command(args),
            Some(stdin),
            self.timeout,
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }
}

fn rejection_text(out: &CommandOutput) -> String {
    if out.timed_out {
        return "git apply timed out".to_string();
    }
    let stderr = out.stderr_text();
    if stderr.trim().is_empty() {
        format!("git apply exited with {:?}", out.status.code())
    } else {
        stderr
    }
}
