//! Partition coordinator: reconciles ring ownership with running partitions.
//!
//! # Architecture
//!
//! ```text
//!  MembershipSource ──events──▶ Accumulator ──transition──┐
//!                                                         ▼
//!  start()/stop() ───────────────────────────────▶ command channel
//!                                                         │
//!                                              AssignmentWorker (one task)
//!                                                ring + active partitions
//!                                                         │
//!                                  ┌──────────────────────┴──────────────┐
//!                           stop removed partitions          spawn added partitions
//!                           (awaited before the next         (lease acquire, then
//!                            command is taken)                handler start; detached)
//! ```
//!
//! All assignment state lives on the worker task, so transitions are applied
//! strictly one at a time in arrival order. Because the worker waits for a
//! transition's releases before taking the next command, a partition's old
//! lease is always released before a new one is prepared for it.
//!
//! # Failure
//!
//! Any reconciliation error, a partition start failure, or a handler failure
//! reported while the partition is active moves the coordinator to
//! [`ServiceState::Failed`]. The worker then stops every remaining partition
//! best-effort. There is no partially degraded mode: a node that cannot serve
//! one of its partitions gives all of them up.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::actions::{ActionSummary, ActionTracker};
use super::background_tasks::{BackgroundTaskRegistry, TaskStatus};
use super::config::CoordinatorConfig;
use super::error::{ClusterError, ClusterResult};
use super::hash_ring::HashRing;
use super::lease::{LockStrategyFactory, ResourceLocker};
use super::lifecycle::{PartitionHandlerFactory, ServiceState, panic_message};
use super::membership::{
    MembershipSource, MembershipTransition, MembershipTransitionAccumulator, TransitionSink,
};
use super::metrics;
use super::partition::{ActivePartition, FailureEscalation};
use crate::types::{NodeId, PartitionId};

enum Command {
    Transition {
        transition: MembershipTransition,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    Abort,
}

struct Inner {
    config: CoordinatorConfig,
    membership: Arc<dyn MembershipSource>,
    lock_factory: Arc<dyn LockStrategyFactory>,
    handlers: Arc<dyn PartitionHandlerFactory>,
    state: watch::Sender<ServiceState>,
    failure: Mutex<Option<ClusterError>>,
    local_node: OnceLock<NodeId>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    tasks: tokio::sync::Mutex<BackgroundTaskRegistry>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
    actions: Arc<ActionTracker>,
    settled: watch::Sender<bool>,
    active: watch::Sender<BTreeSet<PartitionId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Move to `next`, or return the state that forbade it.
    fn advance(&self, next: ServiceState) -> Result<(), ServiceState> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        match refused {
            None => {
                metrics::set_coordinator_state(next);
                info!(state = %next, "Coordinator state changed");
                Ok(())
            }
            Some(state) => Err(state),
        }
    }

    /// Record `cause` and move to Failed. Only the first failure is kept.
    fn fail(self: &Arc<Self>, cause: ClusterError) {
        {
            let mut failure = lock(&self.failure);
            if self.state().is_terminal() {
                debug!(error = %cause, "Ignoring failure after coordinator finished");
                return;
            }
            failure.get_or_insert_with(|| cause.clone());
        }
        if self.advance(ServiceState::Failed).is_err() {
            return;
        }

        error!(error = %cause, "Coordinator failed");
        metrics::record_coordinator_failure(cause.as_metric_label());
        if let Some(commands) = lock(&self.commands).as_ref() {
            let _ = commands.send(Command::Abort);
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.tasks.lock().await.shutdown_all().await;
        });
    }

    fn failure_error(&self) -> ClusterError {
        let cause = lock(&self.failure)
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown cause".to_string());
        ClusterError::CoordinatorFailed(cause)
    }

    /// Error for a command that could not be delivered or answered.
    fn closed_error(&self, operation: &'static str) -> ClusterError {
        match self.state() {
            ServiceState::Failed => self.failure_error(),
            ServiceState::NotStarted => ClusterError::InvalidState {
                operation,
                state: ServiceState::NotStarted,
            },
            _ => ClusterError::Shutdown,
        }
    }

    fn send(&self, command: Command, operation: &'static str) -> ClusterResult<()> {
        let commands = lock(&self.commands);
        match commands.as_ref() {
            Some(tx) if self.state() != ServiceState::Failed => tx
                .send(command)
                .map_err(|_| self.closed_error(operation)),
            _ => Err(self.closed_error(operation)),
        }
    }

    fn submit_transition(
        &self,
        transition: MembershipTransition,
    ) -> ClusterResult<oneshot::Receiver<ClusterResult<()>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Transition { transition, reply }, "membership transition")?;
        Ok(rx)
    }

    async fn await_reply(&self, rx: oneshot::Receiver<ClusterResult<()>>, operation: &'static str) -> ClusterResult<()> {
        rx.await.unwrap_or_else(|_| Err(self.closed_error(operation)))
    }
}

fn describe(transition: &MembershipTransition) -> String {
    format!(
        "+{} -{}",
        transition.joined().len(),
        transition.departed().len()
    )
}

/// Owns this node's share of the partition keyspace.
///
/// Cheap to clone; clones control the same coordinator.
#[derive(Clone)]
pub struct PartitionCoordinator {
    inner: Arc<Inner>,
}

impl PartitionCoordinator {
    /// Create a coordinator. Nothing happens until [`start`](Self::start).
    pub fn new(
        config: CoordinatorConfig,
        membership: Arc<dyn MembershipSource>,
        lock_factory: Arc<dyn LockStrategyFactory>,
        handlers: Arc<dyn PartitionHandlerFactory>,
    ) -> ClusterResult<Self> {
        config
            .validate()
            .map_err(|errors| ClusterError::Config(errors.join("; ")))?;

        let (state, _) = watch::channel(ServiceState::NotStarted);
        let (settled, _) = watch::channel(false);
        let (active, _) = watch::channel(BTreeSet::new());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                membership,
                lock_factory,
                handlers,
                state,
                failure: Mutex::new(None),
                local_node: OnceLock::new(),
                commands: Mutex::new(None),
                worker: Mutex::new(None),
                tasks: tokio::sync::Mutex::new(BackgroundTaskRegistry::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                actions: ActionTracker::new(),
                settled,
                active,
            }),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    /// The error that failed the coordinator, if it failed.
    pub fn failure_cause(&self) -> Option<ClusterError> {
        lock(&self.inner.failure).clone()
    }

    /// This node's identity, known once started.
    pub fn local_node(&self) -> Option<NodeId> {
        self.inner.local_node.get().cloned()
    }

    /// Partitions currently assigned to this node (started or still acquiring).
    pub fn active_partitions(&self) -> BTreeSet<PartitionId> {
        self.inner.active.borrow().clone()
    }

    pub fn subscribe_active_partitions(&self) -> watch::Receiver<BTreeSet<PartitionId>> {
        self.inner.active.subscribe()
    }

    /// Actions that have been submitted but not finished.
    pub fn pending_actions(&self) -> Vec<ActionSummary> {
        self.inner.actions.pending()
    }

    pub async fn background_task_health(&self) -> Vec<(&'static str, TaskStatus)> {
        self.inner.tasks.lock().await.health_check()
    }

    /// Resolves once the first assignment after startup has fully settled:
    /// releases done, and every added partition started or abandoned.
    ///
    /// Fails if the coordinator fails or stops first.
    pub async fn initial_assignment_settled(&self) -> ClusterResult<()> {
        let mut settled = self.inner.settled.subscribe();
        let mut state = self.inner.state.subscribe();
        loop {
            if *settled.borrow_and_update() {
                return Ok(());
            }
            match *state.borrow_and_update() {
                ServiceState::Failed => return Err(self.inner.failure_error()),
                ServiceState::Stopping | ServiceState::Terminated => {
                    return Err(ClusterError::Shutdown);
                }
                _ => {}
            }
            tokio::select! {
                _ = settled.changed() => {}
                _ = state.changed() => {}
            }
        }
    }

    /// Wait until the coordinator is Terminated or Failed.
    pub async fn await_terminated(&self) -> ServiceState {
        let mut state = self.inner.state.subscribe();
        match state.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Start coordinating.
    ///
    /// Requires local membership to be established. Returns once the
    /// coordinator is Running and the current membership snapshot has been
    /// queued; use [`initial_assignment_settled`](Self::initial_assignment_settled)
    /// to wait for the resulting assignment.
    pub async fn start(&self) -> ClusterResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let inner = &self.inner;

        let Some(local) = inner.membership.local_node() else {
            return Err(ClusterError::MembershipNotEstablished);
        };
        inner
            .advance(ServiceState::Starting)
            .map_err(|state| ClusterError::InvalidState {
                operation: "start",
                state,
            })?;

        let action = inner.actions.begin("startup", format!("node {}", local));
        let result = self.launch(local).await;
        if let Err(e) = &result {
            inner.fail(e.clone());
        }
        action.finish(&result);
        result
    }

    async fn launch(&self, local: NodeId) -> ClusterResult<()> {
        let inner = &self.inner;
        let _ = inner.local_node.set(local.clone());

        let (commands, rx) = mpsc::unbounded_channel();
        *lock(&inner.commands) = Some(commands);
        let worker = AssignmentWorker::new(inner, local.clone());
        *lock(&inner.worker) = Some(tokio::spawn(supervise_worker(
            Arc::downgrade(inner),
            worker.run(rx),
        )));

        let subscription = inner.membership.subscribe();
        inner
            .advance(ServiceState::Running)
            .map_err(|state| ClusterError::InvalidState {
                operation: "start",
                state,
            })?;

        // The snapshot goes straight to the worker, ahead of any debounced change.
        let mut initial = MembershipTransition::joining(subscription.members);
        initial.node_joined(local.clone());
        let action = inner
            .actions
            .begin("membership-transition", format!("initial {}", describe(&initial)));
        let reply = inner.submit_transition(initial)?;
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let result = match weak.upgrade() {
                Some(inner) => inner.await_reply(reply, "membership transition").await,
                None => Err(ClusterError::Shutdown),
            };
            action.finish(&result);
        });

        let sink = Arc::new(CoordinatorSink {
            inner: Arc::downgrade(inner),
        });
        let (accumulator, debounce) = MembershipTransitionAccumulator::new(
            inner.config.membership_idle,
            inner.config.membership_max_delay,
            sink,
        );
        let shutdown_requested = inner.membership.shutdown_requested();
        let actions = inner.actions.clone();
        let watchdog_interval = inner.config.watchdog_interval;

        let mut tasks = inner.tasks.lock().await;
        tasks.spawn("membership_debounce", debounce.run());
        tasks.spawn("membership_events", accumulator.forward(subscription.events));
        tasks.spawn(
            "shutdown_listener",
            listen_for_shutdown(Arc::downgrade(inner), shutdown_requested),
        );
        tasks.spawn_periodic("action_watchdog", watchdog_interval, move |tick| {
            let actions = actions.clone();
            async move {
                if tick > 0 {
                    actions.warn_stalled(watchdog_interval);
                }
            }
        });

        info!(node = %local, partitions = inner.config.partition_count, "Partition coordinator started");
        Ok(())
    }

    /// Apply a membership transition and wait until its releases are done.
    ///
    /// Additions are started in the background and are not awaited.
    pub async fn on_membership_changed(&self, transition: MembershipTransition) -> ClusterResult<()> {
        let action = self
            .inner
            .actions
            .begin("membership-transition", describe(&transition));
        let result = match self.inner.submit_transition(transition) {
            Ok(reply) => self.inner.await_reply(reply, "membership transition").await,
            Err(e) => Err(e),
        };
        action.finish(&result);
        result
    }

    /// Stop every partition and shut down.
    ///
    /// Stopping a coordinator that never started terminates it directly.
    pub async fn stop(&self) -> ClusterResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let inner = &self.inner;

        match inner.state() {
            ServiceState::Terminated => return Ok(()),
            ServiceState::Failed => return Err(inner.failure_error()),
            ServiceState::NotStarted => {
                return match inner.advance(ServiceState::Terminated) {
                    Ok(()) => Ok(()),
                    Err(ServiceState::Failed) => Err(inner.failure_error()),
                    Err(_) => Ok(()),
                };
            }
            _ => {}
        }
        if let Err(state) = inner.advance(ServiceState::Stopping) {
            return match state {
                ServiceState::Failed => Err(inner.failure_error()),
                _ => Ok(()),
            };
        }

        let action = inner.actions.begin("shutdown", "");
        let (reply, rx) = oneshot::channel();
        let result = match inner.send(Command::Shutdown { reply }, "shutdown") {
            Ok(()) => inner.await_reply(rx, "shutdown").await,
            Err(e) => Err(e),
        };

        inner.tasks.lock().await.shutdown_all().await;
        let worker = lock(&inner.worker).take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!(error = %e, "Assignment worker did not exit cleanly");
        }

        let result = match result {
            Ok(()) => match inner.advance(ServiceState::Terminated) {
                Ok(()) => {
                    info!("Partition coordinator stopped");
                    Ok(())
                }
                // Failed while the final release was in flight.
                Err(ServiceState::Failed) => Err(inner.failure_error()),
                Err(state) => Err(ClusterError::InvalidState {
                    operation: "stop",
                    state,
                }),
            },
            Err(e) => {
                inner.fail(e.clone());
                Err(e)
            }
        };
        action.finish(&result);
        result
    }
}

#[async_trait]
impl TransitionSink for PartitionCoordinator {
    async fn on_membership_changed(&self, transition: MembershipTransition) -> ClusterResult<()> {
        PartitionCoordinator::on_membership_changed(self, transition).await
    }
}

impl std::fmt::Debug for PartitionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionCoordinator")
            .field("state", &self.state())
            .field("local_node", &self.local_node())
            .field("active_partitions", &self.inner.active.borrow().len())
            .finish()
    }
}

/// Transition sink held by background tasks; does not keep the coordinator alive.
struct CoordinatorSink {
    inner: Weak<Inner>,
}

#[async_trait]
impl TransitionSink for CoordinatorSink {
    async fn on_membership_changed(&self, transition: MembershipTransition) -> ClusterResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(ClusterError::Shutdown);
        };
        PartitionCoordinator { inner }
            .on_membership_changed(transition)
            .await
    }
}

async fn listen_for_shutdown(inner: Weak<Inner>, mut requested: watch::Receiver<bool>) {
    if requested.wait_for(|requested| *requested).await.is_err() {
        return;
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };

    info!("Cluster requested shutdown of this node");
    // Detached: stop() waits for this task to finish.
    let coordinator = PartitionCoordinator { inner };
    tokio::spawn(async move {
        if let Err(e) = coordinator.stop().await {
            warn!(error = %e, "Requested shutdown failed");
        }
    });
}

/// Run the assignment worker and fail the coordinator if it dies early.
///
/// The worker only exits on shutdown or after a failure; any other exit,
/// including a panic, leaves nothing to apply transitions.
async fn supervise_worker(inner: Weak<Inner>, worker: impl Future<Output = ()>) {
    let outcome = AssertUnwindSafe(worker).catch_unwind().await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let cause = match outcome {
        Err(panic) => panic_message(panic.as_ref()),
        Ok(()) if inner.state() == ServiceState::Running => "worker stopped".to_string(),
        Ok(()) => return,
    };
    error!(cause = %cause, "Assignment worker exited while coordinator was running");
    inner.fail(ClusterError::WorkerLost(cause));
}

/// Owner of the assignment state. Runs on a single task.
struct AssignmentWorker {
    inner: Weak<Inner>,
    local: NodeId,
    locker: ResourceLocker,
    handlers: Arc<dyn PartitionHandlerFactory>,
    partitions: Vec<PartitionId>,
    ring: HashRing<NodeId>,
    active: HashMap<PartitionId, Arc<ActivePartition>>,
    initial_pending: bool,
    escalate: FailureEscalation,
}

impl AssignmentWorker {
    fn new(inner: &Arc<Inner>, local: NodeId) -> Self {
        let weak = Arc::downgrade(inner);
        let escalate: FailureEscalation = {
            let weak = weak.clone();
            Arc::new(move |cause| {
                if let Some(inner) = weak.upgrade() {
                    inner.fail(cause);
                }
            })
        };

        Self {
            inner: weak,
            locker: ResourceLocker::new(local.clone(), inner.lock_factory.clone()),
            local,
            handlers: inner.handlers.clone(),
            partitions: inner.config.partitions(),
            ring: HashRing::new(inner.config.virtual_nodes_per_worker),
            active: HashMap::new(),
            initial_pending: true,
            escalate,
        }
    }

    fn coordinator_state(&self) -> ServiceState {
        self.inner
            .upgrade()
            .map(|inner| inner.state())
            .unwrap_or(ServiceState::Terminated)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Transition { transition, reply } => {
                    if self.coordinator_state() == ServiceState::Failed {
                        let _ = reply.send(Err(self.failed_error()));
                        continue;
                    }
                    let result = self.apply(transition).await;
                    if let Err(e) = &result {
                        (self.escalate)(e.clone());
                    }
                    let _ = reply.send(result);
                }
                Command::Shutdown { reply } => {
                    let result = self.reconcile().await;
                    let _ = reply.send(result);
                    break;
                }
                Command::Abort => break,
            }
        }

        self.teardown().await;
        debug!(node = %self.local, "Assignment worker stopped");
    }

    fn failed_error(&self) -> ClusterError {
        self.inner
            .upgrade()
            .map(|inner| inner.failure_error())
            .unwrap_or(ClusterError::Shutdown)
    }

    async fn apply(&mut self, transition: MembershipTransition) -> ClusterResult<()> {
        self.ring.remove_workers(transition.departed());
        self.ring.add_workers(transition.joined().iter().cloned())?;
        metrics::set_ring_workers(self.ring.len());
        debug!(
            joined = ?transition.joined(),
            departed = ?transition.departed(),
            workers = self.ring.len(),
            "Ring updated"
        );
        self.reconcile().await
    }

    /// Diff the ring's assignment against the active partitions and act on it.
    ///
    /// Completes when the removed partitions are released.
    async fn reconcile(&mut self) -> ClusterResult<()> {
        let target: HashSet<PartitionId> = if self.coordinator_state() == ServiceState::Running {
            self.ring
                .compute_assignments(&self.local, self.partitions.iter().copied(), |p| p.hash())
        } else {
            HashSet::new()
        };

        let mut removals: Vec<PartitionId> = self
            .active
            .keys()
            .filter(|p| !target.contains(*p))
            .copied()
            .collect();
        let mut additions: Vec<PartitionId> = target
            .iter()
            .filter(|p| !self.active.contains_key(*p))
            .copied()
            .collect();
        removals.sort_unstable();
        additions.sort_unstable();

        if removals.is_empty() && additions.is_empty() {
            debug!(active = self.active.len(), "Assignment unchanged");
            self.settle_initial(Vec::new());
            return Ok(());
        }
        info!(
            added = additions.len(),
            removed = removals.len(),
            active = self.active.len(),
            "Reconciling partition assignment"
        );

        let releasing: Vec<(PartitionId, JoinHandle<ClusterResult<()>>)> = removals
            .iter()
            .filter_map(|p| self.active.remove(p).map(|active| (*p, active)))
            .map(|(p, active)| (p, tokio::spawn(async move { active.stop().await })))
            .collect();

        let mut starting = Vec::with_capacity(additions.len());
        let mut result = Ok(());
        for partition in additions {
            match self.start_partition(partition) {
                Ok(handle) => starting.push(handle),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.publish_active();
        metrics::record_partition_changes("added", starting.len());
        metrics::record_partition_changes("removed", releasing.len());

        let (released, handles): (Vec<PartitionId>, Vec<_>) = releasing.into_iter().unzip();
        for (partition, outcome) in released.into_iter().zip(join_all(handles).await) {
            let outcome = outcome.unwrap_or_else(|e| {
                Err(ClusterError::Coordination(format!(
                    "stop task for {} failed: {}",
                    partition, e
                )))
            });
            if let Err(e) = outcome {
                warn!(partition = %partition, error = %e, "Failed to release partition");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if result.is_ok() {
            self.settle_initial(starting);
        }
        result
    }

    fn start_partition(&mut self, partition: PartitionId) -> ClusterResult<JoinHandle<ClusterResult<()>>> {
        let handlers = &self.handlers;
        let handler = std::panic::catch_unwind(AssertUnwindSafe(|| handlers.create(partition)))
            .map_err(|panic| ClusterError::HandlerFailed {
                partition,
                message: panic_message(panic.as_ref()),
            })?;
        let lease = self.locker.prepare(&partition.resource_id())?;
        let (active, handle) =
            ActivePartition::spawn(partition, lease, handler, self.escalate.clone());
        self.active.insert(partition, active);
        Ok(handle)
    }

    /// Resolve "initial assignment settled" once the first transition's
    /// additions have all started or been abandoned.
    fn settle_initial(&mut self, starting: Vec<JoinHandle<ClusterResult<()>>>) {
        if !std::mem::replace(&mut self.initial_pending, false) {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let all_started = join_all(starting)
                .await
                .into_iter()
                .all(|outcome| matches!(outcome, Ok(Ok(()))));
            // Failed starts have already been escalated.
            if all_started && let Some(inner) = inner.upgrade() {
                inner.settled.send_replace(true);
                info!("Initial partition assignment settled");
            }
        });
    }

    fn publish_active(&self) {
        metrics::set_active_partitions(self.active.len());
        if let Some(inner) = self.inner.upgrade() {
            inner
                .active
                .send_replace(self.active.keys().copied().collect());
        }
    }

    /// Best-effort stop of every remaining partition.
    async fn teardown(&mut self) {
        if self.active.is_empty() {
            return;
        }
        warn!(remaining = self.active.len(), "Tearing down remaining partitions");

        let remaining: Vec<Arc<ActivePartition>> =
            self.active.drain().map(|(_, active)| active).collect();
        let outcomes = join_all(remaining.iter().map(|active| active.stop())).await;
        for (active, outcome) in remaining.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(partition = %active.partition(), error = %e, "Failed to release partition during teardown");
            }
        }
        self.publish_active();
    }
}
