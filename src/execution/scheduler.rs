use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;

use super::shutdown::ShutdownSignal;

/// Runs deferred work after a delay, off the caller's context.
///
/// Pending tasks are dropped when shutdown fires or `shutdown()` is called.
#[derive(Clone)]
pub struct Scheduler {
    tasks: Arc<Mutex<JoinSet<()>>>,
    shutdown: ShutdownSignal,
}

impl Scheduler {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            shutdown,
        }
    }

    pub fn schedule<F>(&self, name: &'static str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // Reap finished tasks so the set stays small
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            if !delay.is_zero() && !shutdown.sleep(delay).await {
                tracing::debug!(task = name, "Deferred task dropped on shutdown");
                return;
            }
            if shutdown.is_triggered() {
                return;
            }
            tracing::debug!(task = name, "Running deferred task");
            task.await;
        });
    }

    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Abort every pending task
    pub fn shutdown(&self) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
    }
}
