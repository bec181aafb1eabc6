//! Bookkeeping for externally triggered coordinator actions.
//!
//! Startup, every membership transition and shutdown get a monotonically
//! increasing action id. Start and finish are logged with the elapsed time,
//! and a periodic watchdog warns about actions that have not finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

use super::error::ClusterResult;
use super::metrics;

#[derive(Debug, Clone)]
struct PendingAction {
    kind: &'static str,
    detail: String,
    started: Instant,
}

/// Snapshot of an unfinished action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSummary {
    pub id: u64,
    pub kind: &'static str,
    pub detail: String,
    pub elapsed: Duration,
}

/// Tracks unfinished actions by id.
#[derive(Debug, Default)]
pub struct ActionTracker {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingAction>,
}

impl ActionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new action and log its start.
    pub fn begin(self: &Arc<Self>, kind: &'static str, detail: impl Into<String>) -> ActionGuard {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let detail = detail.into();
        info!(action_id = id, kind, detail = %detail, "Action started");

        let started = Instant::now();
        self.pending.insert(
            id,
            PendingAction {
                kind,
                detail,
                started,
            },
        );
        ActionGuard {
            id,
            kind,
            started,
            tracker: self.clone(),
            finished: false,
        }
    }

    /// Unfinished actions, oldest first.
    pub fn pending(&self) -> Vec<ActionSummary> {
        let mut actions: Vec<ActionSummary> = self
            .pending
            .iter()
            .map(|entry| ActionSummary {
                id: *entry.key(),
                kind: entry.kind,
                detail: entry.detail.clone(),
                elapsed: entry.started.elapsed(),
            })
            .collect();
        actions.sort_by_key(|action| action.id);
        actions
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Warn about every action pending for at least `threshold`.
    ///
    /// Returns the number of actions reported.
    pub fn warn_stalled(&self, threshold: Duration) -> usize {
        let stalled: Vec<ActionSummary> = self
            .pending()
            .into_iter()
            .filter(|action| action.elapsed >= threshold)
            .collect();

        for action in &stalled {
            warn!(
                action_id = action.id,
                kind = action.kind,
                detail = %action.detail,
                elapsed_ms = action.elapsed.as_millis() as u64,
                "Action has not finished"
            );
        }
        metrics::record_stalled_actions(stalled.len());
        stalled.len()
    }

    fn complete(&self, id: u64) {
        self.pending.remove(&id);
    }
}

/// Handle for one pending action. Dropping it unfinished logs the action as
/// abandoned.
#[derive(Debug)]
pub struct ActionGuard {
    id: u64,
    kind: &'static str,
    started: Instant,
    tracker: Arc<ActionTracker>,
    finished: bool,
}

impl ActionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the action finished with the outcome of the work it tracked.
    pub fn finish<T>(mut self, outcome: &ClusterResult<T>) {
        let elapsed = self.started.elapsed();
        match outcome {
            Ok(_) => {
                info!(action_id = self.id, kind = self.kind, elapsed_ms = elapsed.as_millis() as u64, "Action finished");
                self.close("success", elapsed);
            }
            Err(e) => {
                warn!(action_id = self.id, kind = self.kind, elapsed_ms = elapsed.as_millis() as u64, error = %e, "Action failed");
                self.close("error", elapsed);
            }
        }
    }

    fn close(&mut self, outcome: &str, elapsed: Duration) {
        self.finished = true;
        self.tracker.complete(self.id);
        metrics::record_action(self.kind, outcome, elapsed.as_secs_f64());
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed = self.started.elapsed();
            warn!(action_id = self.id, kind = self.kind, "Action abandoned");
            self.close("abandoned", elapsed);
        }
    }
}
