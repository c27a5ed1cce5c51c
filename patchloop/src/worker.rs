//! Worker pool draining the task queue.
//!
//! Tasks found `running` when the pool starts were interrupted by a previous
//! process and are resumed first. After that each worker repeatedly claims
//! the oldest queued task and runs it to a terminal state.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{error, info, instrument};

use crate::core::types::{Task, TaskState};
use crate::orchestrator::Orchestrator;

/// What a pool run did, by task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub resumed: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Errors that prevented a task from reaching a terminal state.
    pub errors: Vec<String>,
}

impl DrainSummary {
    pub fn processed(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    fn record(&mut self, task: &Task) {
        match task.state {
            TaskState::Completed => self.completed.push(task.id.clone()),
            TaskState::Failed => self.failed.push(task.id.clone()),
            TaskState::Queued | TaskState::Running => {}
        }
    }
}

enum Job {
    Resume(String),
    Queued(String),
}

pub struct WorkerPool<'a> {
    orchestrator: &'a Orchestrator,
    workers: usize,
    poll_interval: Duration,
}

impl<'a> WorkerPool<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        let config = orchestrator.config();
        Self {
            orchestrator,
            workers: config.workers.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Resume interrupted tasks, then drain the queue and return once it is
    /// empty.
    pub fn run_until_idle(&self) -> Result<DrainSummary> {
        self.run(&AtomicBool::new(false), false)
    }

    /// Keep polling for queued tasks until `stop` is set. In-flight tasks
    /// finish before this returns.
    pub fn run_forever(&self, stop: &AtomicBool) -> Result<DrainSummary> {
        self.run(stop, true)
    }

    #[instrument(skip_all, fields(workers = self.workers, watch))]
    fn run(&self, stop: &AtomicBool, watch: bool) -> Result<DrainSummary> {
        let interrupted = self
            .orchestrator
            .store()
            .task_ids_in_state(TaskState::Running)?;
        if !interrupted.is_empty() {
            info!(count = interrupted.len(), "resuming interrupted tasks");
        }
        let resumable = Mutex::new(VecDeque::from(interrupted));
        let summary = Mutex::new(DrainSummary::default());

        thread::scope(|scope| {
            for worker in 0..self.workers {
                let resumable = &resumable;
                let summary = &summary;
                scope.spawn(move || self.worker_loop(worker, resumable, summary, stop, watch));
            }
        });

        summary
            .into_inner()
            .map_err(|_| anyhow!("worker summary poisoned"))
    }

    fn worker_loop(
        &self,
        worker: usize,
        resumable: &Mutex<VecDeque<String>>,
        summary: &Mutex<DrainSummary>,
        stop: &AtomicBool,
        watch: bool,
    ) {
        while !stop.load(Ordering::SeqCst) {
            match self.next_job(resumable) {
                Ok(Some(job)) => self.run_job(worker, job, summary),
                Ok(None) if watch => thread::sleep(self.poll_interval),
                Ok(None) => return,
                Err(err) => {
                    error!(worker, error = %format!("{err:#}"), "queue poll failed");
                    if let Ok(mut summary) = summary.lock() {
                        summary.errors.push(format!("{err:#}"));
                    }
                    if !watch {
                        return;
                    }
                    thread::sleep(self.poll_interval);
                }
            }
        }
    }

    fn next_job(&self, resumable: &Mutex<VecDeque<String>>) -> Result<Option<Job>> {
        let resume = resumable
            .lock()
            .map_err(|_| anyhow!("resume queue poisoned"))?
            .pop_front();
        if let Some(id) = resume {
            return Ok(Some(Job::Resume(id)));
        }
        let queued = self
            .orchestrator
            .store()
            .task_ids_in_state(TaskState::Queued)?;
        Ok(queued.into_iter().next().map(Job::Queued))
    }

    fn run_job(&self, worker: usize, job: Job, summary: &Mutex<DrainSummary>) {
        let (task_id, result) = match job {
            Job::Resume(id) => {
                let result = self.orchestrator.resume(&id).map(Some);
                if let Ok(mut summary) = summary.lock() {
                    summary.resumed.push(id.clone());
                }
                (id, result)
            }
            Job::Queued(id) => {
                let result = self.orchestrator.run_queued(&id);
                (id, result)
            }
        };
        match result {
            Ok(Some(task)) => {
                info!(worker, task_id = %task.id, state = %task.state, "task finished");
                if let Ok(mut summary) = summary.lock() {
                    summary.record(&task);
                }
            }
            // Claimed by another worker or cancelled before the claim.
            Ok(None) => {}
            Err(err) => {
                error!(worker, task_id = %task_id, error = %format!("{err:#}"), "task run failed");
                if let Ok(mut summary) = summary.lock() {
                    summary.errors.push(format!("{task_id}: {err:#}"));
                }
            }
        }
    }
}
