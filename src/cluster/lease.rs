//! Resource leases: the local handle for one attempt to hold a distributed lock.
//!
//! The locking protocol itself lives behind [`LockStrategy`]. A [`Lease`]
//! drives one strategy instance through a small lifecycle:
//!
//! ```text
//! Idle -> Acquiring -> Held -> Releasing -> Released
//!   |         |                   ^
//!   +---------+-------------------+   (release is valid from any state)
//! ```
//!
//! # Cancellation
//!
//! A lease asked to stop while still acquiring abandons the attempt in place:
//! `acquire()` resolves to `Ok(None)` immediately, the attempt keeps running
//! detached and its late result is ignored. The strategy is responsible for
//! cleaning up anything the late attempt creates once it has been relinquished.
//!
//! # One Lease Per Resource
//!
//! [`ResourceLocker::prepare`] refuses to hand out a second lease for a
//! resource id whose previous lease has not been released. Two live leases
//! for the same resource inside one process would queue against each other.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::{ClusterError, ClusterResult};
use super::metrics;
use crate::types::{FenceToken, NodeId};

/// Lock protocol for a single resource, bound to the local node.
#[async_trait]
pub trait LockStrategy: Send + Sync {
    /// Wait until the lock is held and return its fence token.
    ///
    /// Returns `Ok(None)` when the attempt was abandoned because
    /// [`relinquish_lock`](Self::relinquish_lock) was called first.
    async fn request_lock(&self) -> ClusterResult<Option<FenceToken>>;

    /// Give up the lock or the pending attempt. Must be idempotent.
    async fn relinquish_lock(&self) -> ClusterResult<()>;
}

/// Builds a strategy for one resource id on behalf of the local node.
pub trait LockStrategyFactory: Send + Sync {
    fn strategy(&self, resource_id: &str, local_node: &NodeId) -> Arc<dyn LockStrategy>;
}

/// Lifecycle state of a [`Lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    Released,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeaseState::Idle => "idle",
            LeaseState::Acquiring => "acquiring",
            LeaseState::Held => "held",
            LeaseState::Releasing => "releasing",
            LeaseState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Hands out leases and enforces one active lease per resource id.
pub struct ResourceLocker {
    local_node: NodeId,
    factory: Arc<dyn LockStrategyFactory>,
    active: Arc<DashSet<String>>,
}

impl ResourceLocker {
    pub fn new(local_node: NodeId, factory: Arc<dyn LockStrategyFactory>) -> Self {
        Self {
            local_node,
            factory,
            active: Arc::new(DashSet::new()),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Prepare a lease for `resource_id`.
    ///
    /// Fails with [`ClusterError::LeaseAlreadyActive`] while an earlier lease
    /// for the same resource has not been released. That is a programming
    /// error in the caller, not contention.
    pub fn prepare(&self, resource_id: &str) -> ClusterResult<Lease> {
        if !self.active.insert(resource_id.to_string()) {
            return Err(ClusterError::LeaseAlreadyActive(resource_id.to_string()));
        }

        let strategy = self.factory.strategy(resource_id, &self.local_node);
        debug!(resource = resource_id, node = %self.local_node, "Prepared lease");
        Ok(Lease::new(
            resource_id.to_string(),
            strategy,
            self.active.clone(),
        ))
    }

    pub fn is_active(&self, resource_id: &str) -> bool {
        self.active.contains(resource_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl fmt::Debug for ResourceLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLocker")
            .field("local_node", &self.local_node)
            .field("active", &self.active.len())
            .finish()
    }
}

/// Local handle for one attempt to hold the lock on one resource.
pub struct Lease {
    resource_id: String,
    strategy: Arc<dyn LockStrategy>,
    state: watch::Sender<LeaseState>,
    cancelled: watch::Sender<bool>,
    fence_token: OnceLock<FenceToken>,
    registry: Arc<DashSet<String>>,
    unregistered: AtomicBool,
}

impl Lease {
    fn new(
        resource_id: String,
        strategy: Arc<dyn LockStrategy>,
        registry: Arc<DashSet<String>>,
    ) -> Self {
        let (state, _) = watch::channel(LeaseState::Idle);
        let (cancelled, _) = watch::channel(false);
        Self {
            resource_id,
            strategy,
            state,
            cancelled,
            fence_token: OnceLock::new(),
            registry,
            unregistered: AtomicBool::new(false),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Token obtained when the lock was confirmed, if it ever was.
    pub fn fence_token(&self) -> Option<FenceToken> {
        self.fence_token.get().copied()
    }

    /// Returns true if the lock is held with a fence token.
    pub fn is_held(&self) -> bool {
        self.state() == LeaseState::Held && self.fence_token().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Acquire the lock.
    ///
    /// Resolves to the fence token once the lock is held, or to `Ok(None)` if
    /// the lease was cancelled or released while the attempt was pending.
    pub async fn acquire(&self) -> ClusterResult<Option<FenceToken>> {
        let started = self.state.send_if_modified(|state| {
            if *state == LeaseState::Idle {
                *state = LeaseState::Acquiring;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ClusterError::LeaseState {
                resource_id: self.resource_id.clone(),
                operation: "acquire",
                state: self.state(),
            });
        }

        // Detached so an abandoned attempt keeps running instead of being
        // dropped halfway through a coordination call.
        let strategy = self.strategy.clone();
        let attempt = tokio::spawn(async move { strategy.request_lock().await });
        let mut cancelled = self.cancelled.subscribe();

        let outcome = tokio::select! {
            biased;
            _ = cancelled.wait_for(|c| *c) => None,
            joined = attempt => match joined {
                Ok(result) => result?,
                Err(e) => {
                    return Err(ClusterError::Coordination(format!(
                        "lock attempt for {} aborted: {}",
                        self.resource_id, e
                    )));
                }
            },
        };

        match outcome {
            Some(token) if !self.is_cancelled() => {
                let _ = self.fence_token.set(token);
                self.move_from_acquiring(LeaseState::Held);
                metrics::record_lease_acquisition("acquired");
                debug!(resource = %self.resource_id, token = %token, "Lease held");
                Ok(Some(token))
            }
            Some(_) | None if self.is_cancelled() => {
                self.move_from_acquiring(LeaseState::Held);
                metrics::record_lease_acquisition("abandoned");
                debug!(resource = %self.resource_id, "Lease acquisition abandoned");
                Ok(None)
            }
            _ => {
                metrics::record_lease_acquisition("error");
                Err(ClusterError::MissingFenceToken(self.resource_id.clone()))
            }
        }
    }

    /// Abandon a pending acquisition without relinquishing the lock.
    ///
    /// `acquire()` resolves to `Ok(None)` right away. Call [`release`](Self::release)
    /// afterwards to give up whatever the attempt may still obtain.
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    /// Release the lease from any state.
    ///
    /// Always relinquishes through the strategy, whether or not a token was
    /// ever obtained. Releasing an already released lease is a no-op.
    pub async fn release(&self) -> ClusterResult<()> {
        self.cancel();

        let previous = self.state.send_replace(LeaseState::Releasing);
        if previous == LeaseState::Released {
            self.state.send_replace(LeaseState::Released);
            return Ok(());
        }

        let result = self.strategy.relinquish_lock().await;
        self.state.send_replace(LeaseState::Released);
        self.unregister();

        match &result {
            Ok(()) => debug!(resource = %self.resource_id, from = %previous, "Lease released"),
            Err(e) => warn!(resource = %self.resource_id, error = %e, "Failed to relinquish lock"),
        }
        result
    }

    fn move_from_acquiring(&self, next: LeaseState) {
        self.state.send_if_modified(|state| {
            if *state == LeaseState::Acquiring {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    fn unregister(&self) {
        if !self.unregistered.swap(true, Ordering::SeqCst) {
            self.registry.remove(&self.resource_id);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.unregistered.load(Ordering::SeqCst) {
            warn!(
                resource = %self.resource_id,
                state = %self.state(),
                "Lease dropped without release"
            );
            self.unregister();
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("resource_id", &self.resource_id)
            .field("state", &self.state())
            .field("fence_token", &self.fence_token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Strategy whose lock is granted when the test says so.
    struct GatedStrategy {
        gate: Notify,
        token: Option<FenceToken>,
        relinquished: AtomicUsize,
    }

    #[async_trait]
    impl LockStrategy for GatedStrategy {
        async fn request_lock(&self) -> ClusterResult<Option<FenceToken>> {
            self.gate.notified().await;
            Ok(self.token)
        }

        async fn relinquish_lock(&self) -> ClusterResult<()> {
            self.relinquished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct GatedFactory {
        token: Option<FenceToken>,
        created: Mutex<Vec<Arc<GatedStrategy>>>,
    }

    impl GatedFactory {
        fn new(token: Option<FenceToken>) -> Arc<Self> {
            Arc::new(Self {
                token,
                created: Mutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Arc<GatedStrategy> {
            self.created.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl LockStrategyFactory for GatedFactory {
        fn strategy(&self, _resource_id: &str, _local_node: &NodeId) -> Arc<dyn LockStrategy> {
            let strategy = Arc::new(GatedStrategy {
                gate: Notify::new(),
                token: self.token,
                relinquished: AtomicUsize::new(0),
            });
            self.created.lock().unwrap().push(strategy.clone());
            strategy
        }
    }

    fn locker(factory: Arc<GatedFactory>) -> ResourceLocker {
        ResourceLocker::new(NodeId::new("local"), factory)
    }

    #[tokio::test]
    async fn test_prepare_twice_is_rejected() {
        let locker = locker(GatedFactory::new(Some(FenceToken::new(1))));
        let lease = locker.prepare("partition-1").unwrap();

        let err = locker.prepare("partition-1").unwrap_err();
        assert!(matches!(err, ClusterError::LeaseAlreadyActive(ref id) if id == "partition-1"));
        assert!(locker.prepare("partition-2").is_ok());

        lease.release().await.unwrap();
        assert!(locker.prepare("partition-1").is_ok());
    }

    #[tokio::test]
    async fn test_acquire_then_release() {
        let factory = GatedFactory::new(Some(FenceToken::new(42)));
        let locker = locker(factory.clone());
        let lease = Arc::new(locker.prepare("partition-1").unwrap());

        let acquiring = tokio::spawn({
            let lease = lease.clone();
            async move { lease.acquire().await }
        });
        tokio::task::yield_now().await;
        factory.last().gate.notify_one();

        let token = acquiring.await.unwrap().unwrap();
        assert_eq!(token, Some(FenceToken::new(42)));
        assert!(lease.is_held());

        lease.release().await.unwrap();
        assert_eq!(lease.state(), LeaseState::Released);
        assert_eq!(factory.last().relinquished.load(Ordering::SeqCst), 1);
        assert!(!locker.is_active("partition-1"));
    }

    #[tokio::test]
    async fn test_release_while_acquiring_abandons_attempt() {
        let factory = GatedFactory::new(Some(FenceToken::new(7)));
        let locker = locker(factory.clone());
        let lease = Arc::new(locker.prepare("partition-1").unwrap());

        let acquiring = tokio::spawn({
            let lease = lease.clone();
            async move { lease.acquire().await }
        });
        tokio::task::yield_now().await;

        lease.release().await.unwrap();
        assert_eq!(acquiring.await.unwrap().unwrap(), None);
        assert_eq!(lease.fence_token(), None);
        assert_eq!(lease.state(), LeaseState::Released);

        // The late success is ignored.
        factory.last().gate.notify_one();
        tokio::task::yield_now().await;
        assert_eq!(lease.fence_token(), None);
    }

    #[tokio::test]
    async fn test_cancel_moves_to_held_without_token() {
        let factory = GatedFactory::new(Some(FenceToken::new(7)));
        let locker = locker(factory);
        let lease = Arc::new(locker.prepare("partition-1").unwrap());

        let acquiring = tokio::spawn({
            let lease = lease.clone();
            async move { lease.acquire().await }
        });
        tokio::task::yield_now().await;
        lease.cancel();

        assert_eq!(acquiring.await.unwrap().unwrap(), None);
        assert_eq!(lease.state(), LeaseState::Held);
        assert!(!lease.is_held());
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_token_without_cancel_is_an_error() {
        let factory = GatedFactory::new(None);
        let locker = locker(factory.clone());
        let lease = Arc::new(locker.prepare("partition-1").unwrap());

        let acquiring = tokio::spawn({
            let lease = lease.clone();
            async move { lease.acquire().await }
        });
        tokio::task::yield_now().await;
        factory.last().gate.notify_one();

        let err = acquiring.await.unwrap().unwrap_err();
        assert!(matches!(err, ClusterError::MissingFenceToken(_)));
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let factory = GatedFactory::new(Some(FenceToken::new(1)));
        let locker = locker(factory.clone());
        let lease = locker.prepare("partition-1").unwrap();

        lease.release().await.unwrap();
        lease.release().await.unwrap();
        assert_eq!(lease.state(), LeaseState::Released);
        assert_eq!(factory.last().relinquished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_twice_is_rejected() {
        let factory = GatedFactory::new(Some(FenceToken::new(1)));
        let locker = locker(factory);
        let lease = locker.prepare("partition-1").unwrap();
        lease.release().await.unwrap();

        let err = lease.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::LeaseState {
                state: LeaseState::Released,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let locker = locker(GatedFactory::new(Some(FenceToken::new(1))));
        {
            let _lease = locker.prepare("partition-9").unwrap();
            assert!(locker.is_active("partition-9"));
        }
        assert!(!locker.is_active("partition-9"));
    }
}
