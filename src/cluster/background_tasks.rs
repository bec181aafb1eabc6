//! Named background tasks owned by the coordinator.
//!
//! The coordinator runs a handful of long-lived loops next to its
//! serialization worker: the membership debounce loop, the event pump, the
//! shutdown listener and the action watchdog. The registry gives each one a
//! name for logs and health checks and stops them all through one broadcast
//! signal.
//!
//! ```rust,ignore
//! let mut tasks = BackgroundTaskRegistry::new();
//! tasks.spawn("membership_events", pump);
//! tasks.spawn_periodic("action_watchdog", Duration::from_secs(20), move |_| {
//!     let actions = actions.clone();
//!     async move { actions.warn_stalled(Duration::from_secs(20)); }
//! });
//! tasks.shutdown_all().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::BACKGROUND_SHUTDOWN_TIMEOUT;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// The task's future returned on its own (or panicked).
    Finished,
}

struct TaskInfo {
    handle: JoinHandle<()>,
    spawned_at: Instant,
}

/// Registry of named tokio tasks sharing one shutdown signal.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<&'static str, TaskInfo>,
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
    /// shutdown is signalled. A task already registered under `name` is aborted.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(previous) = self.tasks.remove(name) {
            previous.handle.abort();
            debug!(task = name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => debug!(task = name, "Task finished"),
                _ = shutdown_rx.recv() => debug!(task = name, "Task stopped by shutdown"),
            }
        });

        debug!(task = name, "Spawned background task");
        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                spawned_at: Instant::now(),
            },
        );
    }

    /// Spawn a task that runs `tick` every `period`, starting immediately.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut count = 0u64;
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                tick(count).await;
                count = count.wrapping_add(1);
            }
        });
    }

    /// Status of every registered task, sorted by name.
    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        let mut statuses: Vec<_> = self
            .tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect();
        statuses.sort_by_key(|(name, _)| *name);
        statuses
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    pub fn task_uptime(&self, name: &str) -> Option<Duration> {
        self.tasks.get(name).map(|info| info.spawned_at.elapsed())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Signal shutdown and wait for every task to stop.
    pub async fn shutdown_all(&mut self) {
        self.shutdown_all_with_timeout(BACKGROUND_SHUTDOWN_TIMEOUT)
            .await;
    }

    /// Signal shutdown and wait up to `timeout` in total; stragglers are aborted.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(task_count = self.tasks.len(), "Stopping background tasks");

        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + timeout;

        for (name, info) in self.tasks.drain() {
            let mut handle = info.handle;
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) if e.is_panic() => warn!(task = name, error = %e, "Task panicked"),
                Ok(Err(_)) => debug!(task = name, "Task was cancelled"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (name, info) in self.tasks.drain() {
                debug!(task = name, "Aborting task on registry drop");
                info.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("forever", std::future::pending());
        registry.spawn("short", async {});
        tokio::task::yield_now().await;

        assert_eq!(registry.task_count(), 2);
        assert_eq!(
            registry.health_check(),
            vec![("forever", TaskStatus::Running), ("short", TaskStatus::Finished)]
        );

        registry.shutdown_all().await;
        assert!(registry.is_shutting_down());
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_ignored() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.shutdown_all().await;
        registry.spawn("late", std::future::pending());
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_respawn_replaces_task() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("loop", std::future::pending());
        registry.spawn("loop", std::future::pending());
        assert_eq!(registry.task_count(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks() {
        let ticks = Arc::new(AtomicU64::new(0));
        let mut registry = BackgroundTaskRegistry::new();
        let counter = ticks.clone();
        registry.spawn_periodic("ticker", Duration::from_secs(1), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        // Immediate first tick plus one per elapsed second.
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        registry.shutdown_all().await;
    }
}
