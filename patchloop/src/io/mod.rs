//! Side-effecting adapters: storage, git, child processes, model provider,
//! code host, preflight, prompts and configuration.

pub mod artifacts;
pub mod config;
pub mod git;
pub mod hosting;
pub mod init;
pub mod locks;
pub mod model;
pub mod preflight;
pub mod process;
pub mod prompt;
pub mod store;
