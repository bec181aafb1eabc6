//! Debounce timing of the membership transition accumulator.
//!
//! All tests run on a paused clock, so elapsed times are exact.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ringlease::cluster::{
    ClusterError, ClusterResult, InMemoryMembership, MembershipSource, MembershipTransition,
    MembershipTransitionAccumulator, TransitionSink,
};
use ringlease::types::NodeId;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

const IDLE: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_millis(300);

struct RecordingSink {
    delivered: mpsc::UnboundedSender<(Instant, MembershipTransition)>,
    fail_first: AtomicBool,
}

#[async_trait]
impl TransitionSink for RecordingSink {
    async fn on_membership_changed(&self, transition: MembershipTransition) -> ClusterResult<()> {
        let _ = self.delivered.send((Instant::now(), transition));
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(ClusterError::CoordinatorFailed("sink refused".into()));
        }
        Ok(())
    }
}

fn accumulator(
    fail_first: bool,
) -> (
    MembershipTransitionAccumulator,
    mpsc::UnboundedReceiver<(Instant, MembershipTransition)>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = Arc::new(RecordingSink {
        delivered: tx,
        fail_first: AtomicBool::new(fail_first),
    });
    let (accumulator, delivery) = MembershipTransitionAccumulator::new(IDLE, MAX_DELAY, sink);
    (accumulator, rx, tokio::spawn(delivery.run()))
}

fn nodes(ids: &[&str]) -> Vec<NodeId> {
    ids.iter().map(|id| NodeId::new(id)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_delivered_after_idle() {
    let (acc, mut delivered, _loop) = accumulator(false);
    let start = Instant::now();

    acc.node_joined(NodeId::new("a"));
    sleep(Duration::from_millis(50)).await;
    acc.node_joined(NodeId::new("b"));

    let (at, transition) = delivered.recv().await.unwrap();
    // Idle restarts with every event: 50ms + 100ms.
    assert_eq!(at - start, Duration::from_millis(150));
    assert_eq!(transition, MembershipTransition::joining(nodes(&["a", "b"])));
}

#[tokio::test(start_paused = true)]
async fn test_continuous_events_are_capped_by_max_delay() {
    let (acc, mut delivered, delivery_loop) = accumulator(false);
    let start = Instant::now();

    let feeder = {
        let acc = acc.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                acc.node_joined(NodeId::new(format!("node-{i}")));
                sleep(Duration::from_millis(50)).await;
            }
        })
    };

    let (at, first) = delivered.recv().await.unwrap();
    assert_eq!(at - start, MAX_DELAY);
    // Events at 0, 50, ..., 300ms; the one at 300ms may land on either side.
    assert!((6..=7).contains(&first.joined().len()));

    feeder.await.unwrap();
    drop(acc);
    delivery_loop.await.unwrap();

    let mut total = first.joined().len();
    while let Ok((_, transition)) = delivered.try_recv() {
        total += transition.joined().len();
    }
    assert_eq!(total, 20);
}

#[tokio::test(start_paused = true)]
async fn test_join_and_leave_in_one_burst_cancel_out() {
    let (acc, mut delivered, _loop) = accumulator(false);
    let start = Instant::now();

    acc.node_joined(NodeId::new("x"));
    acc.node_left(NodeId::new("x"));
    sleep(IDLE * 3).await;
    acc.node_left(NodeId::new("y"));

    // Nothing was delivered for the cancelled burst.
    let (at, transition) = delivered.recv().await.unwrap();
    assert_eq!(at - start, IDLE * 4);
    assert_eq!(transition, MembershipTransition::departing(nodes(&["y"])));
}

#[tokio::test(start_paused = true)]
async fn test_closing_flushes_pending_transition() {
    let (acc, mut delivered, delivery_loop) = accumulator(false);
    let start = Instant::now();

    acc.node_joined(NodeId::new("a"));
    acc.node_left(NodeId::new("b"));
    drop(acc);

    let (at, transition) = delivered.recv().await.unwrap();
    assert_eq!(at, start);
    assert_eq!(transition.joined().len(), 1);
    assert_eq!(transition.departed().len(), 1);
    delivery_loop.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sink_error_does_not_stop_delivery() {
    let (acc, mut delivered, _loop) = accumulator(true);

    acc.node_joined(NodeId::new("a"));
    let (_, first) = delivered.recv().await.unwrap();
    assert!(first.joined().contains(&NodeId::new("a")));

    acc.node_joined(NodeId::new("b"));
    let (_, second) = delivered.recv().await.unwrap();
    assert!(second.joined().contains(&NodeId::new("b")));
}

#[tokio::test(start_paused = true)]
async fn test_forward_from_membership_source() {
    let membership = InMemoryMembership::with_local("local");
    let subscription = membership.subscribe();
    assert_eq!(subscription.members, nodes(&["local"]));

    let (acc, mut delivered, delivery_loop) = accumulator(false);
    let pump = tokio::spawn(acc.forward(subscription.events));

    membership.join("b");
    membership.join("c");
    membership.leave("b");
    let (_, transition) = delivered.recv().await.unwrap();
    assert_eq!(transition, MembershipTransition::joining(nodes(&["c"])));

    membership.leave("c");
    membership.close_streams();
    pump.await.unwrap();
    let (_, last) = delivered.recv().await.unwrap();
    assert_eq!(last, MembershipTransition::departing(nodes(&["c"])));
    delivery_loop.await.unwrap();
}
