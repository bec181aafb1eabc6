//! Partition ownership for a cluster of cooperating nodes.
//!
//! Each node runs a [`PartitionCoordinator`]. The coordinator places every
//! live member on a consistent [`HashRing`], takes the partitions the ring
//! assigns to the local node, and guards each of them with a fenced
//! [`Lease`] before starting its [`PartitionHandler`].
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────┐   events    ┌──────────────────────────┐
//!   │ MembershipSource │───────────▶ │ TransitionAccumulator    │
//!   └──────────────────┘             │ (idle / max-delay bursts)│
//!                                    └────────────┬─────────────┘
//!                                                 ▼
//!                                    ┌──────────────────────────┐
//!                                    │ PartitionCoordinator     │
//!                                    │  HashRing<NodeId>        │
//!                                    └──────┬────────────┬──────┘
//!                                   release │            │ acquire
//!                                           ▼            ▼
//!                                    ┌──────────────────────────┐
//!                                    │ ResourceLocker / Lease   │
//!                                    └────────────┬─────────────┘
//!                                                 ▼
//!                                    ┌──────────────────────────┐
//!                                    │ CoordinationService      │
//!                                    │ (sequential-node queue)  │
//!                                    └──────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Deterministic placement**: every node computes the same assignment
//!   from the same membership.
//! - **Minimal movement**: a join or leave only moves partitions between the
//!   affected node and its ring neighbours.
//! - **Fencing**: a partition handler only runs while its lease is held, and
//!   each acquisition carries a strictly larger [`FenceToken`] than any
//!   earlier one for the same partition.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ringlease::cluster::{
//!     CoordinatorConfig, InMemoryCoordinationService, InMemoryMembership,
//!     PartitionCoordinator, PartitionHandler, SequentialNodeLocker,
//! };
//! # use ringlease::cluster::{ClusterResult, PartitionContext};
//! # use ringlease::types::PartitionId;
//! # struct Worker;
//! # #[async_trait::async_trait]
//! # impl PartitionHandler for Worker {
//! #     async fn start(&self, _ctx: PartitionContext) -> ClusterResult<()> { Ok(()) }
//! #     async fn stop(&self) -> ClusterResult<()> { Ok(()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoordinatorConfig::from_env()?;
//!     let ensemble = InMemoryCoordinationService::new();
//!     let locker = SequentialNodeLocker::new(ensemble.connect(), config.lock_root.clone());
//!     let handlers = |_: PartitionId| -> Arc<dyn PartitionHandler> { Arc::new(Worker) };
//!
//!     let coordinator = PartitionCoordinator::new(
//!         config,
//!         Arc::new(InMemoryMembership::with_local("node-1")),
//!         Arc::new(locker),
//!         Arc::new(handlers),
//!     )?;
//!     coordinator.start().await?;
//!     coordinator.initial_assignment_settled().await?;
//!     coordinator.stop().await?;
//!     Ok(())
//! }
//! ```

mod actions;
pub mod background_tasks;
mod config;
mod coordination;
mod coordinator;
mod error;
pub mod hash_ring;
mod lease;
mod lifecycle;
mod membership;
pub mod metrics;
mod partition;
pub mod retry;
mod sequential_locker;

#[cfg(any(test, feature = "test-utilities"))]
mod mock_coordination;
#[cfg(any(test, feature = "test-utilities"))]
mod mock_membership;

pub use actions::{ActionGuard, ActionSummary, ActionTracker};
pub use background_tasks::{BackgroundTaskRegistry, TaskStatus};
pub use config::{CoordinationConfig, CoordinatorConfig};
pub use coordination::{
    ChangeSignal, Children, CoordinationService, CreatedNode, LockNodeName, NodeStat,
    sequence_not_after,
};
pub use coordinator::PartitionCoordinator;
pub use error::{ClusterError, ClusterResult};
pub use hash_ring::{HashRing, RingKey};
pub use lease::{Lease, LeaseState, LockStrategy, LockStrategyFactory, ResourceLocker};
pub use lifecycle::{
    FailureReporter, PartitionContext, PartitionHandler, PartitionHandlerFactory, ServiceState,
};
pub use membership::{
    AccumulatorLoop, MembershipEvent, MembershipSource, MembershipSubscription,
    MembershipTransition, MembershipTransitionAccumulator, TransitionSink,
};
#[cfg(any(test, feature = "test-utilities"))]
pub use mock_coordination::{InMemoryCoordinationService, InMemorySession};
#[cfg(any(test, feature = "test-utilities"))]
pub use mock_membership::InMemoryMembership;
pub use partition::{ActivePartition, FailureEscalation};
pub use sequential_locker::{SequentialNodeLocker, SequentialNodeStrategy};
