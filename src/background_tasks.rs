//! Named background tasks of a consumer session.
//!
//! Each consumer session runs a couple of long-lived helpers next to its
//! control loop: the lease heartbeat and the rebalance notification
//! listener. A [`BackgroundTaskRegistry`] owns their join handles so the
//! session can:
//! - stop all of them with one broadcast signal,
//! - bound how long it waits for them before aborting,
//! - notice when an essential task (the heartbeat) ended on its own.
//!
//! Partition workers are not registered here; they are stopped one by one
//! during rebalances and need a per-worker signal.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct TaskInfo {
    handle: JoinHandle<()>,
    /// Ending on its own means the session can no longer be trusted.
    essential: bool,
}

/// Owns the background tasks of one consumer session.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<String, TaskInfo>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named task. It is dropped at its next await point once
    /// shutdown is signalled.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_with_options(name.into(), task, false);
    }

    /// Spawn a named task whose early exit [`essential_failures`] reports.
    ///
    /// [`essential_failures`]: Self::essential_failures
    pub fn spawn_essential<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_with_options(name.into(), task, true);
    }

    fn spawn_with_options<F>(&mut self, name: String, task: F, essential: bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            tracing::warn!(task = %name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(old_info) = self.tasks.remove(&name) {
            old_info.handle.abort();
            tracing::debug!(task = %name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = %task_name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = %task_name, "Task received shutdown signal");
                }
            }
        });

        tracing::debug!(task = %name, essential, "Spawned background task");
        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                essential,
            },
        );
    }

    /// Names of essential tasks that are no longer running.
    pub fn essential_failures(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .tasks
            .iter()
            .filter(|(_, info)| info.essential && info.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every task to stop and wait up to `timeout` in total.
    /// Tasks still running at the deadline are aborted.
    ///
    /// The registry can be reused afterwards.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        tracing::debug!(task_count = self.tasks.len(), "Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        let deadline = Instant::now() + timeout;
        for (name, info) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(task = %name, "Aborting task (timeout exceeded)");
                info.handle.abort();
                continue;
            }
            match tokio::time::timeout(remaining, info.handle).await {
                Ok(Ok(())) => {
                    tracing::debug!(task = %name, "Task shutdown complete");
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = %name, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    tracing::warn!(task = %name, "Task did not respond to shutdown, aborted");
                }
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = shutdown_tx;
        self.shutting_down = false;
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        for (name, info) in self.tasks.drain() {
            tracing::debug!(task = %name, "Aborting task on registry drop");
            info.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let mut registry = BackgroundTaskRegistry::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&ticks);
        registry.spawn("ticker", async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        assert_eq!(registry.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry
            .shutdown_all_with_timeout(Duration::from_secs(1))
            .await;
        assert_eq!(registry.task_count(), 0);

        let after = ticks.load(Ordering::SeqCst);
        assert!(after > 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_respawn_replaces_task() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("listener", std::future::pending());
        registry.spawn("listener", std::future::pending());
        assert_eq!(registry.task_count(), 1);
    }

    #[tokio::test]
    async fn test_essential_failure_reported() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn_essential("heartbeat", async {});
        registry.spawn("listener", async {});
        registry.spawn("idle", std::future::pending());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Only the essential task counts; a finished listener does not.
        assert_eq!(registry.essential_failures(), vec!["heartbeat".to_string()]);
        assert_eq!(registry.task_count(), 3);
    }

    #[tokio::test]
    async fn test_registry_reusable_after_shutdown() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("a", std::future::pending());
        registry
            .shutdown_all_with_timeout(Duration::from_millis(100))
            .await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        registry.spawn("b", async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let dropped = Arc::new(AtomicBool::new(false));
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        {
            let mut registry = BackgroundTaskRegistry::new();
            let guard = SetOnDrop(Arc::clone(&dropped));
            registry.spawn("guarded", async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }
}
