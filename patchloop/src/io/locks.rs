//! Per-project mutual exclusion for working-copy operations.
//!
//! Tasks on different projects proceed in parallel; tasks on the same project
//! take turns whenever they touch its working copy (branch setup, apply,
//! preflight, push). Model calls happen outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use tracing::trace;

/// Explicit lock manager; one instance is shared by all workers.
#[derive(Debug, Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `project_id`.
    pub fn with_project<T>(&self, project_id: &str, f: impl FnOnce() -> T) -> Result<T> {
        let lock = {
            let mut table = self
                .locks
                .lock()
                .map_err(|_| anyhow!("project lock table poisoned"))?;
            Arc::clone(table.entry(project_id.to_string()).or_default())
        };
        // A panic inside a previous holder leaves nothing to repair in `()`.
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        trace!(project_id, "project lock acquired");
        Ok(f())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn same_project_is_serialized() {
        let locks = Arc::new(ProjectLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    locks
                        .with_project("p", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            inside.fetch_sub(1, Ordering::SeqCst);
                        })
                        .expect("lock");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_projects_do_not_block() {
        let locks = ProjectLocks::new();
        let value = locks
            .with_project("a", || locks.with_project("b", || 42).expect("inner"))
            .expect("outer");
        assert_eq!(value, 42);
    }
}
