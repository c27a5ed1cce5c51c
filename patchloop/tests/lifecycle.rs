//! End-to-end task lifecycle scenarios.
//!
//! These tests submit tasks through [`Service`] against a real git working
//! copy and drive them with [`WorkerPool`], using scripted model, preflight
//! and code host collaborators.

use std::sync::Arc;

use patchloop::core::types::{Event, PreflightOutcome, Severity, TaskState};
use patchloop::service::{CreateProject, Service, SubmitTask};
use patchloop::test_support::{
    HELLO_WORLD_DIFF, Harness, RecordingHost, STALE_DIFF, ScriptedModel, ScriptedPreflight,
    TestRepo, test_config,
};
use patchloop::worker::WorkerPool;

fn service_for(h: &Harness, repo: &TestRepo, remote_url: Option<String>) -> Service {
    let workspaces = repo.scratch_dir("workspaces").expect("workspaces");
    let service = Service::new(Arc::clone(&h.store), test_config(), workspaces);
    service
        .create_project(CreateProject {
            name: "demo".into(),
            remote_url,
            path: Some(repo.path().to_path_buf()),
        })
        .expect("project");
    service
}

fn submit(service: &Service, prompt: &str) -> String {
    service
        .submit_task(SubmitTask {
            project: "demo".into(),
            prompt: prompt.into(),
            target_branch: Some("patchloop/hello".into()),
            ..SubmitTask::default()
        })
        .expect("submit")
        .id
}

fn terminal_event(events: &[Event]) -> &Event {
    events
        .iter()
        .find(|e| e.phase.is_terminal())
        .expect("terminal event")
}

/// Submit → worker picks it up → diff applied → pull request opened.
///
/// Checks the observable contract: the task leaves `queued`, at least one
/// event is logged in the `running` phase before the terminal one, and the
/// event sequence is strictly increasing.
#[test]
fn hello_world_request_runs_to_pull_request() {
    let repo = TestRepo::new().expect("repo");
    let (remote_url, _bare) = repo.add_fake_remote().expect("remote");
    let h = Harness::new(
        test_config(),
        ScriptedModel::texts([HELLO_WORLD_DIFF]),
        ScriptedPreflight::new(vec![PreflightOutcome::Pass]),
        RecordingHost::new(),
        None,
    )
    .expect("harness");
    let service = service_for(&h, &repo, Some(remote_url));
    let id = submit(&service, "add a hello world function to src/index.ts");

    let summary = WorkerPool::new(&h.orchestrator).run_until_idle().expect("drain");
    assert_eq!(summary.completed, vec![id.clone()]);

    let task = service.get_task(&id).expect("task");
    assert_ne!(task.state, TaskState::Queued);
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.iteration, 1);
    assert_eq!(
        task.pr_url.as_deref(),
        Some("https://example.test/acme/demo/pull/1")
    );

    let events = service.events(&id, 0).expect("events");
    let terminal = terminal_event(&events);
    assert!(
        events
            .iter()
            .any(|e| e.phase == TaskState::Running && e.seq < terminal.seq)
    );
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    repo.git().checkout("patchloop/hello").expect("checkout");
    assert!(
        repo.read_file("src/index.ts")
            .expect("read")
            .contains("return \"hello world\";")
    );
    let opened = h.host.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].title, "add a hello world function to src/index.ts");
}

#[test]
fn project_without_remote_completes_locally() {
    let repo = TestRepo::new().expect("repo");
    let h = Harness::new(
        test_config(),
        ScriptedModel::texts([HELLO_WORLD_DIFF]),
        ScriptedPreflight::none(),
        RecordingHost::without_credentials(),
        None,
    )
    .expect("harness");
    let service = service_for(&h, &repo, None);
    let id = submit(&service, "add a hello world function to src/index.ts");

    WorkerPool::new(&h.orchestrator).run_until_idle().expect("drain");

    let task = service.get_task(&id).expect("task");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.reason.as_deref(), Some("completed locally"));
    assert!(task.pr_url.is_none());
    assert!(h.host.opened().is_empty());
    assert_eq!(
        repo.git()
            .commits_ahead("refs/heads/main", "refs/heads/patchloop/hello")
            .expect("ahead"),
        1
    );
}

#[test]
fn rejected_diff_is_fed_back_and_retried() {
    let repo = TestRepo::new().expect("repo");
    let h = Harness::new(
        test_config(),
        ScriptedModel::texts([STALE_DIFF, HELLO_WORLD_DIFF]),
        ScriptedPreflight::none(),
        RecordingHost::new(),
        None,
    )
    .expect("harness");
    let service = service_for(&h, &repo, None);
    let id = submit(&service, "add a hello world function to src/index.ts");

    WorkerPool::new(&h.orchestrator).run_until_idle().expect("drain");

    let task = service.get_task(&id).expect("task");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.apply_failures, 0);
    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].user.contains("did not apply"));

    let warnings: Vec<Event> = service
        .events(&id, 0)
        .expect("events")
        .into_iter()
        .filter(|e| e.severity == Severity::Warning)
        .collect();
    assert!(
        warnings
            .iter()
            .any(|e| e.message.starts_with("patch did not apply"))
    );
}

#[test]
fn queued_task_cancelled_before_pickup_never_runs() {
    let repo = TestRepo::new().expect("repo");
    let h = Harness::new(
        test_config(),
        ScriptedModel::texts([HELLO_WORLD_DIFF]),
        ScriptedPreflight::none(),
        RecordingHost::new(),
        None,
    )
    .expect("harness");
    let service = service_for(&h, &repo, None);
    let id = submit(&service, "add a hello world function to src/index.ts");

    let cancelled = service.cancel_task(&id).expect("cancel");
    assert_eq!(cancelled.state, TaskState::Failed);

    let summary = WorkerPool::new(&h.orchestrator).run_until_idle().expect("drain");
    assert_eq!(summary.processed(), 0);
    assert_eq!(h.model.calls(), 0);
    assert!(!repo.git().branch_exists("patchloop/hello").expect("branch"));
}

/// A task left `running` by a dead process is picked up again at startup and
/// finishes without duplicating the commit it already made.
#[test]
fn interrupted_task_resumes_on_next_boot() {
    let repo = TestRepo::new().expect("repo");
    let h = Harness::new(
        test_config(),
        ScriptedModel::texts(["NO_CHANGES"]),
        ScriptedPreflight::none(),
        RecordingHost::new(),
        None,
    )
    .expect("harness");
    let service = service_for(&h, &repo, None);
    let id = submit(&service, "add a hello world function to src/index.ts");

    // Simulate a crash after the first apply: claimed, branch committed,
    // iteration persisted, but no terminal state.
    assert!(h.store.claim_queued(&id).expect("claim"));
    let wc = patchloop::working_copy::WorkingCopyManager::new(
        repo.git().clone(),
        patchloop::test_support::test_author(),
        false,
    );
    wc.ensure_branch("main", "patchloop/hello").expect("branch");
    wc.apply_patch("main", "patchloop/hello", HELLO_WORLD_DIFF, "hello")
        .expect("apply");
    let mut task = service.get_task(&id).expect("task");
    task.iteration = 1;
    h.store.update_task(&mut task).expect("persist");

    let summary = WorkerPool::new(&h.orchestrator).run_until_idle().expect("drain");
    assert_eq!(summary.resumed, vec![id.clone()]);

    let task = service.get_task(&id).expect("task");
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.reason.as_deref(), Some("completed locally"));
    assert_eq!(
        wc.applied_commits("main", "patchloop/hello").expect("ahead"),
        1
    );
}
