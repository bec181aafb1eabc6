//! Error types for cluster coordination.
//!
//! # Error Taxonomy
//!
//! Errors fall into four groups, and the coordinator treats each differently:
//!
//! 1. **Invariant faults** (`RingCollision`, `LeaseAlreadyActive`, `LockQueueLost`,
//!    `InvalidState`, `Config`): always fatal, never retried.
//! 2. **Transient coordination faults** (`CoordinationTransient`): retried by the
//!    backoff policy in [`super::retry`]; only the terminal outcome reaches callers.
//! 3. **Partition handler failures** (`HandlerFailed`): escalate to a full
//!    coordinator failure.
//! 4. **Cancellation**: not an error. Abandoned lock attempts resolve to `Ok(None)`.
//!
//! ## Guidelines
//!
//! - **Reconciliation path**: fail-fast, every error becomes a coordinator failure
//! - **Teardown path**: best-effort, log and keep releasing the remaining partitions
//! - **Background tasks**: log with structured fields, never panic

use thiserror::Error;

use super::lease::LeaseState;
use super::lifecycle::ServiceState;
use crate::types::PartitionId;

/// Result type for cluster coordination operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur while coordinating partition ownership.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// Two workers derived the same virtual-node position.
    #[error("Ring position {position:#018x} claimed by both {existing} and {incoming}")]
    RingCollision {
        position: u64,
        existing: String,
        incoming: String,
    },

    /// A lease was prepared for a resource that already has an active lease.
    #[error("Lease for resource {0} is already active in this process")]
    LeaseAlreadyActive(String),

    /// This node's own entry vanished from the lock queue while waiting.
    #[error("Lock node {node} is no longer queued under {lock_path}")]
    LockQueueLost { lock_path: String, node: String },

    /// A lease operation was attempted from the wrong lease state.
    #[error("Lease for {resource_id} cannot {operation} while {state}")]
    LeaseState {
        resource_id: String,
        operation: &'static str,
        state: LeaseState,
    },

    /// A lock strategy returned without a token although nobody cancelled it.
    #[error("Lock attempt for {0} finished without a fence token")]
    MissingFenceToken(String),

    /// Node name could not be parsed as a lock queue entry.
    #[error("Malformed lock node name: {0}")]
    MalformedLockNode(String),

    /// Terminal coordination service error.
    #[error("Coordination service error: {0}")]
    Coordination(String),

    /// Retryable coordination service error (connection loss, timeouts).
    #[error("Transient coordination service error: {0}")]
    CoordinationTransient(String),

    /// A path the operation required does not exist.
    #[error("No node at {0}")]
    NoNode(String),

    /// The coordinator was started before local membership was established.
    #[error("Local cluster membership has not been established")]
    MembershipNotEstablished,

    /// A partition handler failed to start or failed while active.
    #[error("Partition handler for {partition} failed: {message}")]
    HandlerFailed {
        partition: PartitionId,
        message: String,
    },

    /// Operation is not valid in the component's current lifecycle state.
    #[error("Operation {operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServiceState,
    },

    /// The coordinator failed; carries the original cause.
    #[error("Coordinator failed: {0}")]
    CoordinatorFailed(String),

    /// The coordinator's serialization worker is gone.
    #[error("Coordinator has shut down")]
    Shutdown,

    /// The serialization worker exited while the coordinator was still running.
    #[error("Assignment worker exited unexpectedly: {0}")]
    WorkerLost(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Returns true if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::CoordinationTransient(_))
    }

    /// Returns true if this error reflects a broken invariant that must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::RingCollision { .. }
                | ClusterError::LeaseAlreadyActive(_)
                | ClusterError::LeaseState { .. }
                | ClusterError::LockQueueLost { .. }
                | ClusterError::MissingFenceToken(_)
                | ClusterError::InvalidState { .. }
                | ClusterError::WorkerLost(_)
                | ClusterError::Config(_)
        )
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ClusterError::RingCollision { .. } => "ring_collision",
            ClusterError::LeaseAlreadyActive(_) => "lease_already_active",
            ClusterError::LeaseState { .. } => "lease_state",
            ClusterError::LockQueueLost { .. } => "lock_queue_lost",
            ClusterError::MissingFenceToken(_) => "missing_fence_token",
            ClusterError::MalformedLockNode(_) => "malformed_lock_node",
            ClusterError::Coordination(_) => "coordination",
            ClusterError::CoordinationTransient(_) => "coordination_transient",
            ClusterError::NoNode(_) => "no_node",
            ClusterError::MembershipNotEstablished => "membership_not_established",
            ClusterError::HandlerFailed { .. } => "handler_failed",
            ClusterError::InvalidState { .. } => "invalid_state",
            ClusterError::CoordinatorFailed(_) => "coordinator_failed",
            ClusterError::Shutdown => "shutdown",
            ClusterError::WorkerLost(_) => "worker_lost",
            ClusterError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClusterError::CoordinationTransient("connection loss".into()).is_transient());
        assert!(!ClusterError::Coordination("auth failed".into()).is_transient());
        assert!(!ClusterError::NoNode("/locks/a".into()).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ClusterError::LeaseAlreadyActive("partition-1".into()).is_fatal());
        assert!(
            ClusterError::LockQueueLost {
                lock_path: "/locks/partition-1".into(),
                node: "n-lock-0000000001".into(),
            }
            .is_fatal()
        );
        assert!(!ClusterError::CoordinationTransient("timeout".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = ClusterError::RingCollision {
            position: 0xff,
            existing: "a".into(),
            incoming: "b".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x00000000000000ff"));
        assert!(msg.contains("a"));

        let err = ClusterError::HandlerFailed {
            partition: PartitionId::new(3),
            message: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "Partition handler for partition-3 failed: disk full"
        );
    }
}
