//! Test-only helpers: throwaway repositories and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{PreflightOutcome, Project, Task};
use crate::io::config::ExecutorConfig;
use crate::io::git::{Author, Git};
use crate::io::hosting::{CodeHost, PullRequest, PullRequestSpec};
use crate::io::locks::ProjectLocks;
use crate::io::model::{ModelProvider, ModelRequest};
use crate::io::preflight::{Preflight, PreflightReport};
use crate::io::store::{NewProject, NewTask, TaskStore};
use crate::orchestrator::{Orchestrator, OrchestratorParts};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial contents of `src/index.ts` in [`TestRepo`].
pub const INDEX_TS: &str = "export function hello() {\n}\n";

/// Diff that fills in the empty function from [`INDEX_TS`].
pub const HELLO_WORLD_DIFF: &str = concat!(
    "diff --git a/src/index.ts b/src/index.ts\n",
    "--- a/src/index.ts\n",
    "+++ b/src/index.ts\n",
    "@@ -1,2 +1,3 @@\n",
    " export function hello() {\n",
    "+  return \"hello world\";\n",
    " }\n",
);

/// Diff that adds a new file; applies to any tree without `NOTES.md`.
pub fn new_file_diff(name: &str, line: &str) -> String {
    format!(
        "diff --git a/{name} b/{name}\nnew file mode 100644\n--- /dev/null\n+++ b/{name}\n@@ -0,0 +1 @@\n+{line}\n"
    )
}

/// Well-formed diff whose context does not match [`INDEX_TS`].
pub const STALE_DIFF: &str = concat!(
    "diff --git a/src/index.ts b/src/index.ts\n",
    "--- a/src/index.ts\n",
    "+++ b/src/index.ts\n",
    "@@ -1,2 +1,2 @@\n",
    " export function goodbye() {\n",
    "-}\n",
    "+};\n",
);

pub fn test_author() -> Author {
    Author {
        name: "patchloop-test".to_string(),
        email: "patchloop-test@localhost".to_string(),
    }
}

/// Git repository on `main` with `src/index.ts` and a README committed.
pub struct TestRepo {
    temp: TempDir,
    root: PathBuf,
    git: Git,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().join("repo");
        let git = Git::init(&root, "main", TEST_TIMEOUT)?;
        let repo = Self {
            temp,
            root,
            git,
        };
        repo.write_file("README.md", "# demo\n")?;
        repo.write_file("src/index.ts", INDEX_TS)?;
        repo.commit_all("Initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Scratch directory next to the repository, removed with it.
    pub fn scratch_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.temp.path().join(name);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git.add_all()?;
        if !self.git.commit_staged(message, &test_author())? {
            bail!("nothing to commit");
        }
        Ok(())
    }

    /// Create a bare repository reachable as `https://example.test/acme/demo.git`.
    ///
    /// Uses `url.<base>.insteadOf` in the repository config so pushes to the
    /// hosting-style URL land in the local bare repository.
    pub fn add_fake_remote(&self) -> Result<(String, PathBuf)> {
        let hosts = self.scratch_dir("hosts")?;
        let bare = hosts.join("acme").join("demo.git");
        fs::create_dir_all(&bare)?;
        run_git(&bare, &["init", "-q", "--bare"])?;
        let base = format!("{}/", hosts.display());
        run_git(
            &self.root,
            &["config", &format!("url.{base}.insteadOf"), "https://example.test/"],
        )?;
        Ok(("https://example.test/acme/demo.git".to_string(), bare))
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .context("spawn git")?;
    if !out.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(())
}

/// Reply script entry: `Ok(text)` is returned as the model output, `Err`
/// becomes a transport error.
pub type ScriptedReply = Result<String, String>;

/// Model that replays a fixed script and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script where every reply is text.
    pub fn texts<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::new(replies.into_iter().map(|s| Ok(s.into())).collect())
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ModelProvider for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: &ModelRequest) -> Result<String> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests poisoned"))?
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow!("replies poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model exhausted"))?;
        reply.map_err(|err| anyhow!(err))
    }
}

/// Preflight that replays outcomes, then repeats its fallback.
pub struct ScriptedPreflight {
    outcomes: Mutex<VecDeque<PreflightOutcome>>,
    fallback: PreflightOutcome,
    calls: AtomicUsize,
}

impl ScriptedPreflight {
    /// Replays `outcomes`, then passes.
    pub fn new(outcomes: Vec<PreflightOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback: PreflightOutcome::Pass,
            calls: AtomicUsize::new(0),
        }
    }

    /// Behaves like an unconfigured preflight.
    pub fn none() -> Self {
        Self {
            fallback: PreflightOutcome::Skipped,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Preflight for ScriptedPreflight {
    fn run(&self, _workdir: &Path) -> Result<PreflightReport> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self
            .outcomes
            .lock()
            .map_err(|_| anyhow!("outcomes poisoned"))?
            .pop_front()
            .unwrap_or(self.fallback);
        Ok(PreflightReport {
            outcome,
            output: format!("scripted preflight run {n}: {}", outcome.as_str()),
        })
    }
}

/// Host that records pull requests instead of calling an API.
#[derive(Default)]
pub struct RecordingHost {
    missing_credentials: bool,
    failure: Option<String>,
    opened: Mutex<Vec<PullRequestSpec>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_credentials() -> Self {
        Self {
            missing_credentials: true,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<PullRequestSpec> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

impl CodeHost for RecordingHost {
    fn check_credentials(&self) -> Result<()> {
        if self.missing_credentials {
            bail!("missing credential: GITHUB_TOKEN is not set");
        }
        Ok(())
    }

    fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<PullRequest> {
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        let mut opened = self.opened.lock().map_err(|_| anyhow!("opened poisoned"))?;
        opened.push(spec.clone());
        let number = opened.len();
        Ok(PullRequest {
            url: format!(
                "https://example.test/{}/{}/pull/{number}",
                spec.slug.owner, spec.slug.repo
            ),
            remote_id: number.to_string(),
        })
    }
}

/// Config tuned for tests: short timeouts, test author, no preflight command.
pub fn test_config() -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    config.timeouts.git_timeout_secs = 30;
    config.timeouts.model_timeout_secs = 30;
    config.poll_interval_ms = 10;
    config.commit.author_name = test_author().name;
    config.commit.author_email = test_author().email;
    config
}

/// Register `repo` as project `demo`.
pub fn seed_project(store: &TaskStore, repo: &TestRepo, remote_url: Option<&str>) -> Result<Project> {
    Ok(store.create_project(NewProject {
        name: "demo".to_string(),
        path: repo.path().to_path_buf(),
        remote_url: remote_url.map(str::to_string),
    })?)
}

/// Queue a task on `project` targeting `patchloop/test`.
pub fn seed_task(store: &TaskStore, project: &Project, prompt: &str) -> Result<Task> {
    Ok(store.create_task(NewTask {
        project_id: project.id.clone(),
        prompt: prompt.to_string(),
        source_branch: "main".to_string(),
        target_branch: "patchloop/test".to_string(),
    })?)
}

/// Orchestrator wired to scripted collaborators.
pub struct Harness {
    pub store: Arc<TaskStore>,
    pub model: Arc<ScriptedModel>,
    pub preflight: Arc<ScriptedPreflight>,
    pub host: Arc<RecordingHost>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(
        config: ExecutorConfig,
        model: ScriptedModel,
        preflight: ScriptedPreflight,
        host: RecordingHost,
        artifacts_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let store = Arc::new(TaskStore::open_in_memory()?);
        let model = Arc::new(model);
        let preflight = Arc::new(preflight);
        let host = Arc::new(host);
        let orchestrator = Orchestrator::new(OrchestratorParts {
            store: Arc::clone(&store),
            locks: Arc::new(ProjectLocks::new()),
            model: Arc::clone(&model) as Arc<dyn ModelProvider>,
            host: Arc::clone(&host) as Arc<dyn CodeHost>,
            preflight: Arc::clone(&preflight) as Arc<dyn Preflight>,
            config,
            artifacts_dir,
        })?;
        Ok(Self {
            store,
            model,
            preflight,
            host,
            orchestrator,
        })
    }

    /// Messages of every event logged for `task_id`, in order.
    pub fn messages(&self, task_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_events(task_id)?
            .into_iter()
            .map(|e| e.message)
            .collect())
    }
}
