//! # ringlease
//! Consistent-hash partition ownership with fenced leases.
//!
//! A fleet of nodes shares a fixed keyspace of partitions. Every node runs a
//! [`PartitionCoordinator`](cluster::PartitionCoordinator) that
//!
//! - tracks cluster membership through a debounced event stream,
//! - places members on a consistent [`HashRing`](cluster::HashRing) with many
//!   virtual nodes each,
//! - acquires a lease for every partition the ring gives it, queueing behind
//!   the previous owner on a coordination service, and
//! - starts a user supplied [`PartitionHandler`](cluster::PartitionHandler)
//!   with a monotonically increasing [`FenceToken`](types::FenceToken) once
//!   the lease is held.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use ringlease::prelude::*;
//! use std::sync::Arc;
//!
//! struct Worker;
//!
//! #[async_trait::async_trait]
//! impl PartitionHandler for Worker {
//!     async fn start(&self, ctx: PartitionContext) -> ClusterResult<()> {
//!         tracing::info!(partition = %ctx.partition, fence = %ctx.fence_token, "serving");
//!         Ok(())
//!     }
//!
//!     async fn stop(&self) -> ClusterResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run(
//! #     membership: Arc<dyn MembershipSource>,
//! #     coordination: Arc<dyn CoordinationService>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoordinatorConfig::from_env()?;
//! let locker = SequentialNodeLocker::new(coordination, config.lock_root.clone());
//! let handlers = |_: PartitionId| -> Arc<dyn PartitionHandler> { Arc::new(Worker) };
//!
//! let coordinator =
//!     PartitionCoordinator::new(config, membership, Arc::new(locker), Arc::new(handlers))?;
//! coordinator.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! The types needed to run a coordinator.
    pub use crate::cluster::{
        ClusterError, ClusterResult, CoordinationService, CoordinatorConfig, MembershipSource,
        PartitionContext, PartitionCoordinator, PartitionHandler, PartitionHandlerFactory,
        SequentialNodeLocker, ServiceState,
    };
    pub use crate::types::{FenceToken, NodeId, PartitionId};
}
