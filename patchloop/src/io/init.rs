//! Data directory layout and `patchloop init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ExecutorConfig, load_config, write_config};

/// Default data directory name, relative to the current directory.
pub const DEFAULT_DATA_DIR: &str = ".patchloop";

/// All canonical paths within a data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join("config.toml"),
            db_path: root.join("patchloop.db"),
            artifacts_dir: root.join("artifacts"),
            workspaces_dir: root.join("workspaces"),
            gitignore_path: root.join(".gitignore"),
            root,
        }
    }

    /// Load the config for this data dir (defaults when the file is missing).
    pub fn load_config(&self) -> Result<ExecutorConfig> {
        load_config(&self.config_path)
    }
}

/// Create the data directory with a default `config.toml`.
///
/// Fails if a config already exists unless `force` is set. The database is
/// created lazily on first open.
pub fn init_data_dir(root: &Path, force: bool) -> Result<DataPaths> {
    let paths = DataPaths::new(root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.root.display()
        ));
    }
    if paths.config_path.exists() && !force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.root)?;
    create_dir(&paths.artifacts_dir)?;
    create_dir(&paths.workspaces_dir)?;
    fs::write(&paths.gitignore_path, DATA_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &ExecutorConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const DATA_GITIGNORE: &str = "*\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_data_dir(&temp.path().join("data"), false).expect("init");

        assert!(paths.root.is_dir());
        assert!(paths.artifacts_dir.is_dir());
        assert!(paths.workspaces_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            DATA_GITIGNORE
        );
        assert_eq!(paths.load_config().expect("load"), ExecutorConfig::default());
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_data_dir(temp.path(), false).expect("init");
        let err = init_data_dir(temp.path(), false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_data_dir(temp.path(), false).expect("init");
        fs::write(&paths.config_path, "workers = 7\n").expect("write custom");
        assert_eq!(paths.load_config().expect("load").workers, 7);

        init_data_dir(temp.path(), true).expect("re-init");
        assert_eq!(paths.load_config().expect("load"), ExecutorConfig::default());
    }
}
