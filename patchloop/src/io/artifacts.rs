//! Attempt artifacts under `<data_dir>/artifacts/<task>/<iteration>/`.
//!
//! The event log carries one line per attempt; the full raw model output and
//! the diff that was actually applied live here for post-mortems. Artifacts
//! are best-effort product output and are never read back by the executor.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Per-attempt metadata written next to the raw output.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta<'a> {
    pub task_id: &'a str,
    pub iteration: u32,
    pub attempt: u32,
    /// Attempt result label (`valid diff`, `content error`, ...).
    pub outcome: &'a str,
    pub reason: Option<&'a str>,
}

/// Paths for one task iteration.
#[derive(Debug, Clone)]
pub struct IterationArtifacts {
    pub dir: PathBuf,
}

impl IterationArtifacts {
    pub fn new(root: &Path, task_id: &str, iteration: u32) -> Self {
        Self {
            dir: root.join(task_id).join(iteration.to_string()),
        }
    }

    pub fn raw_output_path(&self, attempt: u32) -> PathBuf {
        self.dir.join(format!("attempt-{attempt}.raw.txt"))
    }

    pub fn attempt_meta_path(&self, attempt: u32) -> PathBuf {
        self.dir.join(format!("attempt-{attempt}.json"))
    }

    pub fn applied_diff_path(&self) -> PathBuf {
        self.dir.join("applied.diff")
    }

    pub fn preflight_log_path(&self) -> PathBuf {
        self.dir.join("preflight.log")
    }

    /// Write the raw model output (empty on transport errors) and its metadata.
    pub fn write_attempt(&self, meta: &AttemptMeta<'_>, raw: &str) -> Result<()> {
        self.ensure_dir()?;
        write_text(&self.raw_output_path(meta.attempt), raw)?;
        write_json(&self.attempt_meta_path(meta.attempt), meta)
    }

    pub fn write_applied_diff(&self, diff: &str) -> Result<()> {
        self.ensure_dir()?;
        write_text(&self.applied_diff_path(), diff)
    }

    pub fn write_preflight_log(&self, output: &str) -> Result<()> {
        self.ensure_dir()?;
        write_text(&self.preflight_log_path(), output)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
