//! Autonomous code-modification executor.
//!
//! A task carries a natural-language change request against a registered
//! project. The executor drives a language model through a bounded retry loop
//! until it produces a structurally valid unified diff, applies the diff to the
//! project's working copy on a task-owned branch, optionally runs a preflight
//! command, and publishes the branch as a pull request. Every transition is
//! appended to a durable per-task event log that observers can stream.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (diff validation, sanitization,
//!   state transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (SQLite store, git, child processes,
//!   model provider, code host, preflight, prompts, config).
//!
//! Orchestration modules ([`patch_generator`], [`working_copy`], [`publish`],
//! [`orchestrator`], [`worker`], [`service`]) coordinate core logic with I/O.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod patch_generator;
pub mod publish;
pub mod service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
pub mod working_copy;
