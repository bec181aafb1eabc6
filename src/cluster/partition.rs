//! One partition this node is responsible for: its lease and its handler.
//!
//! Start and stop may overlap. A partition can be reassigned away while its
//! lease is still queued, so `stop` cancels the acquisition, waits for the
//! start task to settle, and only then tears down whatever it got as far as.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{ClusterError, ClusterResult};
use super::lease::Lease;
use super::lifecycle::{
    FailureReporter, PartitionContext, PartitionHandler, ServiceState, panic_message,
};
use super::metrics;
use crate::types::{FenceToken, PartitionId};

/// Called when an active partition fails; the coordinator aborts on it.
pub type FailureEscalation = Arc<dyn Fn(ClusterError) + Send + Sync>;

/// A partition assigned to this node.
pub struct ActivePartition {
    partition: PartitionId,
    lease: Lease,
    handler: Arc<dyn PartitionHandler>,
    state: watch::Sender<ServiceState>,
    start_settled: watch::Sender<bool>,
    handler_started: AtomicBool,
    stopping: AtomicBool,
    escalate: FailureEscalation,
}

impl ActivePartition {
    /// Create the partition and start it in the background.
    ///
    /// The returned handle resolves when start has settled: handler running,
    /// acquisition abandoned, or start failed (already escalated).
    pub fn spawn(
        partition: PartitionId,
        lease: Lease,
        handler: Arc<dyn PartitionHandler>,
        escalate: FailureEscalation,
    ) -> (Arc<Self>, JoinHandle<ClusterResult<()>>) {
        let (state, _) = watch::channel(ServiceState::NotStarted);
        let (start_settled, _) = watch::channel(false);
        let active = Arc::new(Self {
            partition,
            lease,
            handler,
            state,
            start_settled,
            handler_started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            escalate,
        });

        let starting = active.clone();
        let handle = tokio::spawn(async move { starting.start().await });
        (active, handle)
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn fence_token(&self) -> Option<FenceToken> {
        self.lease.fence_token()
    }

    /// True until stop begins or the partition fails.
    pub fn is_active(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst) && !self.state().is_terminal()
    }

    async fn start(self: Arc<Self>) -> ClusterResult<()> {
        // Marks start settled even if this task is cancelled mid-way.
        let _settled = SettleOnDrop(&self.start_settled);
        self.transition(ServiceState::Starting);
        let result = self.acquire_and_start().await;

        match &result {
            Ok(true) => {
                self.transition(ServiceState::Running);
                info!(partition = %self.partition, fence_token = ?self.fence_token(), "Partition started");
            }
            Ok(false) => debug!(partition = %self.partition, "Partition start abandoned"),
            Err(e) => self.fail(e.clone()),
        }
        result.map(|_| ())
    }

    /// Returns whether the handler was started.
    async fn acquire_and_start(self: &Arc<Self>) -> ClusterResult<bool> {
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(fence_token) = self.lease.acquire().await? else {
            return Ok(false);
        };
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let ctx = PartitionContext::new(self.partition, fence_token, self.failure_reporter());
        match AssertUnwindSafe(self.handler.start(ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.handler_failed(e.to_string())),
            Err(panic) => return Err(self.handler_failed(panic_message(panic.as_ref()))),
        }
        self.handler_started.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn handler_failed(&self, message: String) -> ClusterError {
        ClusterError::HandlerFailed {
            partition: self.partition,
            message,
        }
    }

    fn failure_reporter(self: &Arc<Self>) -> FailureReporter {
        let weak: Weak<Self> = Arc::downgrade(self);
        FailureReporter::new(move |message| {
            if let Some(active) = weak.upgrade() {
                active.fail(ClusterError::HandlerFailed {
                    partition: active.partition,
                    message,
                });
            }
        })
    }

    /// Record a failure and escalate it if the partition is still active.
    fn fail(&self, error: ClusterError) {
        if !self.is_active() {
            debug!(partition = %self.partition, error = %error, "Ignoring failure of inactive partition");
            return;
        }
        self.transition(ServiceState::Failed);
        metrics::record_handler_failure();
        warn!(partition = %self.partition, error = %error, "Partition failed");
        (self.escalate)(error);
    }

    /// Stop the handler (if it started) and release the lease.
    ///
    /// Safe to call while start is still in progress. Subsequent calls return
    /// immediately.
    pub async fn stop(&self) -> ClusterResult<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transition(ServiceState::Stopping);

        self.lease.cancel();
        let mut settled = self.start_settled.subscribe();
        let _ = settled.wait_for(|settled| *settled).await;

        let stopped = if self.handler_started.load(Ordering::SeqCst) {
            match AssertUnwindSafe(self.handler.stop()).catch_unwind().await {
                Ok(result) => result.map_err(|e| self.handler_failed(e.to_string())),
                Err(panic) => Err(self.handler_failed(panic_message(panic.as_ref()))),
            }
        } else {
            Ok(())
        };
        if let Err(e) = &stopped {
            warn!(partition = %self.partition, error = %e, "Partition handler failed to stop");
        }

        let released = self.lease.release().await;
        self.state.send_if_modified(|state| {
            if *state == ServiceState::Failed {
                false
            } else {
                *state = ServiceState::Terminated;
                true
            }
        });
        debug!(partition = %self.partition, "Partition stopped");
        stopped.and(released)
    }

    fn transition(&self, next: ServiceState) {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
    }
}

struct SettleOnDrop<'a>(&'a watch::Sender<bool>);

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl fmt::Debug for ActivePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePartition")
            .field("partition", &self.partition)
            .field("state", &self.state())
            .field("lease", &self.lease)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::lease::{LockStrategy, LockStrategyFactory, ResourceLocker};
    use crate::types::NodeId;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct GateLock {
        open: Notify,
    }

    #[async_trait]
    impl LockStrategy for GateLock {
        async fn request_lock(&self) -> ClusterResult<Option<FenceToken>> {
            self.open.notified().await;
            Ok(Some(FenceToken::new(5)))
        }

        async fn relinquish_lock(&self) -> ClusterResult<()> {
            Ok(())
        }
    }

    struct GateFactory(Mutex<Option<Arc<GateLock>>>);

    impl LockStrategyFactory for GateFactory {
        fn strategy(&self, _resource_id: &str, _local_node: &NodeId) -> Arc<dyn LockStrategy> {
            let lock = Arc::new(GateLock { open: Notify::new() });
            *self.0.lock().unwrap() = Some(lock.clone());
            lock
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
        ctx: Mutex<Option<PartitionContext>>,
    }

    #[async_trait]
    impl PartitionHandler for RecordingHandler {
        async fn start(&self, ctx: PartitionContext) -> ClusterResult<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("start {}", ctx.fence_token));
            *self.ctx.lock().unwrap() = Some(ctx);
            Ok(())
        }

        async fn stop(&self) -> ClusterResult<()> {
            self.events.lock().unwrap().push("stop".into());
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl PartitionHandler for PanickingHandler {
        async fn start(&self, _ctx: PartitionContext) -> ClusterResult<()> {
            panic!("corrupt segment")
        }

        async fn stop(&self) -> ClusterResult<()> {
            Ok(())
        }
    }

    fn setup() -> (ResourceLocker, Arc<GateFactory>) {
        let factory = Arc::new(GateFactory(Mutex::new(None)));
        (ResourceLocker::new(NodeId::new("local"), factory.clone()), factory)
    }

    fn escalation_log() -> (FailureEscalation, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (
            Arc::new(move |e: ClusterError| sink.lock().unwrap().push(e.to_string())),
            log,
        )
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (locker, factory) = setup();
        let handler = Arc::new(RecordingHandler::default());
        let (escalate, escalations) = escalation_log();
        let partition = PartitionId::new(3);

        let (active, started) = ActivePartition::spawn(
            partition,
            locker.prepare(&partition.resource_id()).unwrap(),
            handler.clone(),
            escalate,
        );
        tokio::task::yield_now().await;
        factory.0.lock().unwrap().as_ref().unwrap().open.notify_one();
        started.await.unwrap().unwrap();
        assert_eq!(active.state(), ServiceState::Running);

        active.stop().await.unwrap();
        assert_eq!(active.state(), ServiceState::Terminated);
        assert_eq!(*handler.events.lock().unwrap(), ["start fence-5", "stop"]);
        assert!(!locker.is_active(&partition.resource_id()));
        assert!(escalations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_acquiring_skips_handler() {
        let (locker, _factory) = setup();
        let handler = Arc::new(RecordingHandler::default());
        let (escalate, escalations) = escalation_log();
        let partition = PartitionId::new(4);

        let (active, started) = ActivePartition::spawn(
            partition,
            locker.prepare(&partition.resource_id()).unwrap(),
            handler.clone(),
            escalate,
        );
        tokio::task::yield_now().await;

        active.stop().await.unwrap();
        started.await.unwrap().unwrap();
        assert!(handler.events.lock().unwrap().is_empty());
        assert!(escalations.lock().unwrap().is_empty());
        assert!(!locker.is_active(&partition.resource_id()));
    }

    #[tokio::test]
    async fn test_reported_failure_escalates_only_while_active() {
        let (locker, factory) = setup();
        let handler = Arc::new(RecordingHandler::default());
        let (escalate, escalations) = escalation_log();
        let partition = PartitionId::new(5);

        let (active, started) = ActivePartition::spawn(
            partition,
            locker.prepare(&partition.resource_id()).unwrap(),
            handler.clone(),
            escalate,
        );
        tokio::task::yield_now().await;
        factory.0.lock().unwrap().as_ref().unwrap().open.notify_one();
        started.await.unwrap().unwrap();

        let ctx = handler.ctx.lock().unwrap().clone().unwrap();
        ctx.report_failure("disk full");
        assert_eq!(active.state(), ServiceState::Failed);
        assert_eq!(escalations.lock().unwrap().len(), 1);

        // A second report after failure is ignored.
        ctx.report_failure("still full");
        assert_eq!(escalations.lock().unwrap().len(), 1);
        active.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_start_is_escalated() {
        let (locker, factory) = setup();
        let (escalate, escalations) = escalation_log();
        let partition = PartitionId::new(6);

        let (active, started) = ActivePartition::spawn(
            partition,
            locker.prepare(&partition.resource_id()).unwrap(),
            Arc::new(PanickingHandler),
            escalate,
        );
        tokio::task::yield_now().await;
        factory.0.lock().unwrap().as_ref().unwrap().open.notify_one();

        let err = started.await.unwrap().unwrap_err();
        assert!(matches!(err, ClusterError::HandlerFailed { .. }));
        assert!(err.to_string().contains("panicked: corrupt segment"));
        assert_eq!(active.state(), ServiceState::Failed);
        assert_eq!(escalations.lock().unwrap().len(), 1);

        // Start has settled, so stop does not wait on it.
        tokio::time::timeout(std::time::Duration::from_secs(5), active.stop())
            .await
            .expect("stop hung after a panicking start")
            .unwrap();
        assert!(!locker.is_active(&partition.resource_id()));
    }
}
