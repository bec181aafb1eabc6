//! Distributed lock recipe on ephemeral sequential nodes.
//!
//! For each resource the contenders queue up under `{lock_root}/{resource_id}`:
//!
//! 1. Create an ephemeral sequential node named
//!    `{marker}{owner}-lock-{sequence}`. The marker makes the create safe to
//!    retry: after a lost reply the contender finds its own node by marker
//!    instead of queueing twice.
//! 2. List the queue with a watch and count the entries that queued no later
//!    than ours (wraparound-safe). A count of one means the lock is held.
//!    Zero means our own entry is gone and the lock state is unknown, which
//!    is fatal. Anything larger means we wait for the watch and look again.
//! 3. The fence token is the creation id of our node. It is assigned by the
//!    service in creation order, so a later holder always carries a larger
//!    token than every earlier one.
//!
//! Relinquishing deletes our node. If that happens while the create is still
//! in flight, the late create notices and deletes its own node.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::coordination::{
    CoordinationService, CreatedNode, LockNodeName, child_path, node_name, protection_marker,
};
use super::error::{ClusterError, ClusterResult};
use super::lease::{LockStrategy, LockStrategyFactory};
use super::metrics;
use super::retry;
use crate::types::{FenceToken, NodeId};

/// [`LockStrategyFactory`] backed by a coordination service.
#[derive(Clone)]
pub struct SequentialNodeLocker {
    service: Arc<dyn CoordinationService>,
    lock_root: String,
}

impl SequentialNodeLocker {
    pub fn new(service: Arc<dyn CoordinationService>, lock_root: impl Into<String>) -> Self {
        Self {
            service,
            lock_root: lock_root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn lock_root(&self) -> &str {
        &self.lock_root
    }

    /// Path of the lock queue for `resource_id`.
    pub fn lock_path(&self, resource_id: &str) -> String {
        child_path(&self.lock_root, resource_id)
    }
}

impl LockStrategyFactory for SequentialNodeLocker {
    fn strategy(&self, resource_id: &str, local_node: &NodeId) -> Arc<dyn LockStrategy> {
        Arc::new(SequentialNodeStrategy::new(
            self.service.clone(),
            self.lock_path(resource_id),
            local_node.clone(),
        ))
    }
}

#[derive(Debug, Default)]
struct Attempt {
    /// Path of our queue entry once the create has been confirmed.
    node: Option<String>,
    released: bool,
}

/// One lock attempt on one resource.
pub struct SequentialNodeStrategy {
    service: Arc<dyn CoordinationService>,
    lock_path: String,
    owner: NodeId,
    marker: String,
    attempt: Mutex<Attempt>,
    released: watch::Sender<bool>,
}

impl SequentialNodeStrategy {
    pub fn new(service: Arc<dyn CoordinationService>, lock_path: String, owner: NodeId) -> Self {
        let (released, _) = watch::channel(false);
        Self {
            service,
            lock_path,
            owner,
            marker: protection_marker(),
            attempt: Mutex::new(Attempt::default()),
            released,
        }
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    /// Path of our queue entry, if one has been created and not yet deleted.
    pub fn node_path(&self) -> Option<String> {
        self.attempt().node.clone()
    }

    fn attempt(&self) -> MutexGuard<'_, Attempt> {
        self.attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create our queue entry, adopting an earlier one whose reply was lost.
    async fn create_entry(&self) -> ClusterResult<CreatedNode> {
        let prefix = child_path(
            &self.lock_path,
            &LockNodeName::prefix(Some(&self.marker), self.owner.as_str()),
        );
        let prefix = prefix.as_str();
        let data = self.owner.as_str().as_bytes();
        let mut first_attempt = true;

        retry::with_coordination_policy("create_lock_node", move || {
            let retrying = !std::mem::replace(&mut first_attempt, false);
            async move {
                if retrying && let Some(existing) = self.find_marked_entry().await? {
                    debug!(lock_path = %self.lock_path, node = %existing.path, "Adopted lock node after lost reply");
                    return Ok(existing);
                }
                self.service.create_ephemeral_sequential(prefix, data).await
            }
        })
        .await
    }

    /// Look for a queue entry carrying this attempt's marker.
    async fn find_marked_entry(&self) -> ClusterResult<Option<CreatedNode>> {
        let names = match self.service.get_children(&self.lock_path, false).await {
            Ok(children) => children.names,
            Err(ClusterError::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(name) = names.into_iter().find(|n| n.starts_with(&self.marker)) else {
            return Ok(None);
        };
        let path = child_path(&self.lock_path, &name);
        Ok(self
            .service
            .stat(&path)
            .await?
            .map(|stat| CreatedNode { path, stat }))
    }

    /// Delete every entry carrying this attempt's marker.
    async fn delete_marked_entries(&self) -> ClusterResult<()> {
        let names = match self.service.get_children(&self.lock_path, false).await {
            Ok(children) => children.names,
            Err(ClusterError::NoNode(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for name in names.iter().filter(|n| n.starts_with(&self.marker)) {
            self.service
                .delete(&child_path(&self.lock_path, name))
                .await?;
        }
        Ok(())
    }

    /// Count queue entries that queued no later than `own`, or `None` if
    /// `own` itself is missing.
    fn entries_not_after(&self, names: &[String], own: &LockNodeName, own_name: &str) -> Option<usize> {
        if !names.iter().any(|n| n == own_name) {
            return None;
        }

        let count = names
            .iter()
            .filter_map(|name| match LockNodeName::parse(name) {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    debug!(lock_path = %self.lock_path, node = %name, "Ignoring foreign node in lock queue");
                    None
                }
            })
            .filter(|entry| entry.is_not_after(own.sequence))
            .count();
        Some(count)
    }

    async fn wait_for_turn(&self, created: &CreatedNode) -> ClusterResult<Option<FenceToken>> {
        let own_name = created.name().to_string();
        let own = LockNodeName::parse(&own_name)?;
        let token = FenceToken::new(created.stat.creation_id);
        let mut released = self.released.subscribe();

        loop {
            let children = retry::with_coordination_policy("list_lock_queue", || {
                self.service.get_children(&self.lock_path, true)
            })
            .await?;

            // Relinquishing deletes our entry; that is not a lost queue.
            if *released.borrow_and_update() {
                return Ok(None);
            }
            match self.entries_not_after(&children.names, &own, &own_name) {
                None | Some(0) => {
                    metrics::LOCK_QUEUE_LOST.inc();
                    return Err(ClusterError::LockQueueLost {
                        lock_path: self.lock_path.clone(),
                        node: own_name,
                    });
                }
                Some(1) => {
                    info!(
                        lock_path = %self.lock_path,
                        node = %own_name,
                        fence_token = %token,
                        "Lock acquired"
                    );
                    return Ok(Some(token));
                }
                Some(n) => {
                    debug!(lock_path = %self.lock_path, ahead = n - 1, "Waiting in lock queue");
                    let Some(change) = children.change else {
                        tokio::task::yield_now().await;
                        continue;
                    };
                    tokio::select! {
                        biased;
                        _ = released.wait_for(|r| *r) => return Ok(None),
                        _ = change.changed() => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LockStrategy for SequentialNodeStrategy {
    async fn request_lock(&self) -> ClusterResult<Option<FenceToken>> {
        if self.attempt().released {
            return Ok(None);
        }

        let created = match self.create_entry().await {
            Ok(created) => created,
            Err(e) => {
                // The failed create may still have landed server-side.
                if let Err(cleanup) = self.delete_marked_entries().await {
                    warn!(lock_path = %self.lock_path, error = %cleanup, "Failed to clean up lock node");
                }
                return Err(e);
            }
        };

        let abandoned = {
            let mut attempt = self.attempt();
            if attempt.released {
                true
            } else {
                attempt.node = Some(created.path.clone());
                false
            }
        };
        if abandoned {
            debug!(lock_path = %self.lock_path, node = %created.name(), "Deleting lock node created after release");
            retry::with_fast_policy("delete_lock_node", || self.service.delete(&created.path)).await?;
            return Ok(None);
        }

        self.wait_for_turn(&created).await
    }

    async fn relinquish_lock(&self) -> ClusterResult<()> {
        let node = {
            let mut attempt = self.attempt();
            attempt.released = true;
            attempt.node.take()
        };
        self.released.send_replace(true);

        if let Some(path) = node {
            retry::with_coordination_policy("delete_lock_node", || self.service.delete(&path)).await?;
            debug!(lock_path = %self.lock_path, node = %node_name(&path), "Lock relinquished");
        }
        Ok(())
    }
}
