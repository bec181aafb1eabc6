//! Cluster membership changes and their debouncing.
//!
//! Membership sources report joins and leaves one at a time. Rolling
//! restarts and network blips produce bursts of them, and reconciling after
//! every single event would churn leases. The
//! [`MembershipTransitionAccumulator`] folds a burst into one
//! [`MembershipTransition`] and delivers it once the burst is over:
//!
//! - the burst ends after `idle` passes without a new event
//! - a burst never delays delivery past `max_delay` after its first event
//!
//! A node that joins and leaves inside one burst cancels out; a burst that
//! cancels out completely is not delivered at all.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::error::ClusterResult;
use super::metrics;
use crate::types::NodeId;

/// A single membership notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    Joined(NodeId),
    Left(NodeId),
}

/// Net membership change of one burst. `joined` and `departed` are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipTransition {
    joined: BTreeSet<NodeId>,
    departed: BTreeSet<NodeId>,
}

impl MembershipTransition {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transition in which every node in `nodes` joins.
    pub fn joining(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            joined: nodes.into_iter().collect(),
            departed: BTreeSet::new(),
        }
    }

    /// A transition in which every node in `nodes` departs.
    pub fn departing(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            joined: BTreeSet::new(),
            departed: nodes.into_iter().collect(),
        }
    }

    pub fn node_joined(&mut self, node: NodeId) {
        if !self.departed.remove(&node) {
            self.joined.insert(node);
        }
    }

    pub fn node_left(&mut self, node: NodeId) {
        if !self.joined.remove(&node) {
            self.departed.insert(node);
        }
    }

    pub fn apply(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::Joined(node) => self.node_joined(node),
            MembershipEvent::Left(node) => self.node_left(node),
        }
    }

    pub fn joined(&self) -> &BTreeSet<NodeId> {
        &self.joined
    }

    pub fn departed(&self) -> &BTreeSet<NodeId> {
        &self.departed
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed.is_empty()
    }
}

/// Snapshot of the current members plus the stream of later changes.
#[derive(Debug)]
pub struct MembershipSubscription {
    pub members: Vec<NodeId>,
    pub events: mpsc::UnboundedReceiver<MembershipEvent>,
}

/// Where membership comes from (gossip, a service registry, a static list).
pub trait MembershipSource: Send + Sync {
    /// This node's identity, or `None` until it has joined the cluster.
    fn local_node(&self) -> Option<NodeId>;

    /// Current members and every change after the snapshot.
    fn subscribe(&self) -> MembershipSubscription;

    /// Flips to `true` when the cluster asks this node to shut down.
    fn shutdown_requested(&self) -> watch::Receiver<bool>;
}

/// Receiver of debounced transitions.
#[async_trait]
pub trait TransitionSink: Send + Sync {
    async fn on_membership_changed(&self, transition: MembershipTransition) -> ClusterResult<()>;
}

/// Debounces membership events into transitions.
///
/// Cloning shares the same pending burst. The delivery loop ends once every
/// handle is dropped, flushing whatever is still pending.
#[derive(Debug, Clone)]
pub struct MembershipTransitionAccumulator {
    events: mpsc::UnboundedSender<MembershipEvent>,
}

impl MembershipTransitionAccumulator {
    /// Create an accumulator and the loop that delivers to `sink`.
    ///
    /// The loop does nothing until it is spawned.
    pub fn new(
        idle: Duration,
        max_delay: Duration,
        sink: Arc<dyn TransitionSink>,
    ) -> (Self, AccumulatorLoop) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self { events },
            AccumulatorLoop {
                idle,
                max_delay,
                sink,
                events: rx,
            },
        )
    }

    pub fn node_joined(&self, node: NodeId) {
        self.submit(MembershipEvent::Joined(node));
    }

    pub fn node_left(&self, node: NodeId) {
        self.submit(MembershipEvent::Left(node));
    }

    pub fn submit(&self, event: MembershipEvent) {
        if self.events.send(event).is_err() {
            debug!("Membership event dropped, accumulator loop has stopped");
        }
    }

    /// Forward every event from a subscription stream until it closes.
    pub async fn forward(self, mut events: mpsc::UnboundedReceiver<MembershipEvent>) {
        while let Some(event) = events.recv().await {
            self.submit(event);
        }
        debug!("Membership event stream closed");
    }
}

/// Delivery side of a [`MembershipTransitionAccumulator`].
pub struct AccumulatorLoop {
    idle: Duration,
    max_delay: Duration,
    sink: Arc<dyn TransitionSink>,
    events: mpsc::UnboundedReceiver<MembershipEvent>,
}

impl AccumulatorLoop {
    pub async fn run(mut self) {
        while let Some(first) = self.events.recv().await {
            let deadline = Instant::now() + self.max_delay;
            let mut pending = MembershipTransition::new();
            pending.apply(first);

            let closed = loop {
                let wake = (Instant::now() + self.idle).min(deadline);
                tokio::select! {
                    event = self.events.recv() => match event {
                        Some(event) => pending.apply(event),
                        None => break true,
                    },
                    _ = tokio::time::sleep_until(wake) => break false,
                }
            };

            self.deliver(pending).await;
            if closed {
                break;
            }
        }
        debug!("Membership accumulator stopped");
    }

    async fn deliver(&self, transition: MembershipTransition) {
        if transition.is_empty() {
            debug!("Membership burst cancelled out, nothing to deliver");
            return;
        }

        metrics::record_membership_transition(
            transition.joined().len(),
            transition.departed().len(),
        );
        info!(
            joined = transition.joined().len(),
            departed = transition.departed().len(),
            "Delivering membership transition"
        );
        if let Err(e) = self.sink.on_membership_changed(transition).await {
            error!(error = %e, "Membership transition failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_join_then_leave_cancels() {
        let mut transition = MembershipTransition::new();
        transition.node_joined(node("a"));
        transition.node_left(node("a"));
        assert!(transition.is_empty());
    }

    #[test]
    fn test_leave_then_join_cancels() {
        let mut transition = MembershipTransition::new();
        transition.node_left(node("a"));
        transition.node_joined(node("a"));
        assert!(transition.is_empty());
    }

    #[test]
    fn test_sets_stay_disjoint() {
        let mut transition = MembershipTransition::new();
        transition.apply(MembershipEvent::Joined(node("a")));
        transition.apply(MembershipEvent::Left(node("b")));
        transition.apply(MembershipEvent::Joined(node("a")));

        assert_eq!(transition.joined().iter().collect::<Vec<_>>(), [&node("a")]);
        assert_eq!(transition.departed().iter().collect::<Vec<_>>(), [&node("b")]);
    }

    #[test]
    fn test_serde_shape() {
        let transition = MembershipTransition::joining([node("a")]);
        let json = serde_json::to_string(&transition).unwrap();
        assert_eq!(json, r#"{"joined":["a"],"departed":[]}"#);
    }
}
