//! In-memory membership source for testing.
//!
//! Tests drive membership by hand with [`InMemoryMembership::join`] and
//! [`InMemoryMembership::leave`]; every subscriber sees the events in order.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};

use super::membership::{MembershipEvent, MembershipSource, MembershipSubscription};
use crate::types::NodeId;

#[derive(Default)]
struct State {
    local: Option<NodeId>,
    members: BTreeSet<NodeId>,
    subscribers: Vec<mpsc::UnboundedSender<MembershipEvent>>,
}

/// Hand-driven [`MembershipSource`].
pub struct InMemoryMembership {
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
}

impl InMemoryMembership {
    /// A source whose local node has not joined yet.
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Mutex::new(State::default()),
            shutdown,
        }
    }

    /// A source whose local node is already a member.
    pub fn with_local(local: impl Into<NodeId>) -> Self {
        let membership = Self::new();
        membership.establish(local);
        membership
    }

    /// Make `local` this node's identity and add it to the members.
    pub fn establish(&self, local: impl Into<NodeId>) {
        let local = local.into();
        self.lock().local = Some(local.clone());
        self.join(local);
    }

    pub fn join(&self, node: impl Into<NodeId>) {
        let node = node.into();
        let mut state = self.lock();
        if state.members.insert(node.clone()) {
            Self::broadcast(&mut state, MembershipEvent::Joined(node));
        }
    }

    pub fn leave(&self, node: impl Into<NodeId>) {
        let node = node.into();
        let mut state = self.lock();
        if state.members.remove(&node) {
            Self::broadcast(&mut state, MembershipEvent::Left(node));
        }
    }

    /// Send an event without touching the member set, e.g. a duplicate or
    /// out-of-order notification.
    pub fn emit(&self, event: MembershipEvent) {
        Self::broadcast(&mut self.lock(), event);
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.lock().members.iter().cloned().collect()
    }

    /// Ask the local node to shut down.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// End every subscriber's event stream.
    pub fn close_streams(&self) {
        self.lock().subscribers.clear();
    }

    fn broadcast(state: &mut State, event: MembershipEvent) {
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipSource for InMemoryMembership {
    fn local_node(&self) -> Option<NodeId> {
        self.lock().local.clone()
    }

    fn subscribe(&self) -> MembershipSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.subscribers.push(tx);
        MembershipSubscription {
            members: state.members.iter().cloned().collect(),
            events: rx,
        }
    }

    fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_sees_snapshot_then_events() {
        let membership = InMemoryMembership::with_local("a");
        membership.join("b");

        let mut subscription = membership.subscribe();
        assert_eq!(subscription.members, vec![NodeId::new("a"), NodeId::new("b")]);

        membership.leave("b");
        membership.leave("b");
        assert_eq!(
            subscription.events.recv().await,
            Some(MembershipEvent::Left(NodeId::new("b")))
        );
        assert!(subscription.events.try_recv().is_err());

        membership.close_streams();
        assert_eq!(subscription.events.recv().await, None);
    }

    #[test]
    fn test_local_node_requires_establish() {
        let membership = InMemoryMembership::new();
        assert_eq!(membership.local_node(), None);
        membership.establish("me");
        assert_eq!(membership.local_node(), Some(NodeId::new("me")));
    }
}
