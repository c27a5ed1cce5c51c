//! Preflight check run in the working copy after each successful apply.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, instrument};

use crate::core::types::PreflightOutcome;
use crate::io::process::run_command_with_timeout;

/// Captured output kept for feedback and artifacts.
pub const PREFLIGHT_OUTPUT_LIMIT_BYTES: usize = 200_000;

/// Outcome plus the output that is fed back to the model on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub outcome: PreflightOutcome,
    pub output: String,
}

impl PreflightReport {
    pub fn skipped() -> Self {
        Self {
            outcome: PreflightOutcome::Skipped,
            output: String::new(),
        }
    }
}

pub trait Preflight: Send + Sync {
    /// Run the check in `workdir`. Errors mean the check could not run at all.
    fn run(&self, workdir: &Path) -> Result<PreflightReport>;
}

/// Runs a configured command; exit 0 passes, anything else (including a
/// timeout) fails.
pub struct CommandPreflight {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandPreflight {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("preflight command must not be empty");
        }
        Ok(Self { argv, timeout })
    }
}

impl Preflight for CommandPreflight {
    #[instrument(skip_all, fields(program = %self.argv[0]))]
    fn run(&self, workdir: &Path) -> Result<PreflightReport> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]).current_dir(workdir);
        let out = run_command_with_timeout(cmd, None, self.timeout, PREFLIGHT_OUTPUT_LIMIT_BYTES)?;
        let outcome = if out.success() {
            PreflightOutcome::Pass
        } else {
            PreflightOutcome::Fail
        };
        debug!(outcome = outcome.as_str(), exit_code = ?out.status.code(), "preflight finished");
        Ok(PreflightReport {
            outcome,
            output: out.combined_text("preflight"),
        })
    }
}

/// Used when no preflight command is configured.
pub struct NoPreflight;

impl Preflight for NoPreflight {
    fn run(&self, _workdir: &Path) -> Result<PreflightReport> {
        Ok(PreflightReport::skipped())
    }
}

/// Build the preflight selected by config: an empty command means none.
pub fn build_preflight(argv: &[String], timeout: Duration) -> Result<Box<dyn Preflight>> {
    if argv.is_empty() {
        return Ok(Box::new(NoPreflight));
    }
    Ok(Box::new(CommandPreflight::new(argv.to_vec(), timeout)?))
}
