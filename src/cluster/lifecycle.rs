//! Service lifecycle states and the partition handler contract.
//!
//! Both the coordinator and every partition handler move through the same
//! closed set of states:
//!
//! ```text
//! NotStarted -> Starting -> Running -> Stopping -> Terminated
//!                   |           |          |
//!                   +-----------+----------+-----> Failed
//! ```
//!
//! Handlers are plain trait objects with an async `start`/`stop` pair. A
//! handler that fails after it started reports through the
//! [`FailureReporter`] in its [`PartitionContext`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::ClusterResult;
use crate::types::{FenceToken, PartitionId};

/// Lifecycle state of a coordinator or partition handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl ServiceState {
    /// Returns true once no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed)
    }

    /// Numeric value exported by the coordinator state gauge.
    pub fn as_gauge_value(self) -> i64 {
        match self {
            ServiceState::NotStarted => 0,
            ServiceState::Starting => 1,
            ServiceState::Running => 2,
            ServiceState::Stopping => 3,
            ServiceState::Terminated => 4,
            ServiceState::Failed => 5,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (NotStarted, Starting) | (NotStarted, Terminated) => true,
            (Starting, Running) | (Starting, Stopping) => true,
            (Running, Stopping) => true,
            (Stopping, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::NotStarted => "not-started",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Terminated => "terminated",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Callback a partition handler uses to report a failure after startup.
#[derive(Clone)]
pub struct FailureReporter {
    inner: Arc<dyn Fn(String) + Send + Sync>,
}

impl FailureReporter {
    pub fn new<F>(on_failure: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(on_failure),
        }
    }

    /// A reporter that drops every report.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, message: impl Into<String>) {
        (self.inner)(message.into())
    }
}

impl fmt::Debug for FailureReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureReporter")
    }
}

/// Everything a handler learns about the partition it was started for.
#[derive(Debug, Clone)]
pub struct PartitionContext {
    pub partition: PartitionId,
    /// Token to attach to every write made on behalf of this partition.
    pub fence_token: FenceToken,
    failures: FailureReporter,
}

impl PartitionContext {
    pub fn new(partition: PartitionId, fence_token: FenceToken, failures: FailureReporter) -> Self {
        Self {
            partition,
            fence_token,
            failures,
        }
    }

    /// Report that the handler can no longer serve this partition.
    ///
    /// While the partition is active this fails the whole coordinator.
    pub fn report_failure(&self, message: impl Into<String>) {
        self.failures.report(message)
    }

    pub fn failure_reporter(&self) -> FailureReporter {
        self.failures.clone()
    }
}

/// Work performed for one owned partition.
///
/// A fresh instance is created for every acquisition, so implementations do
/// not need to support restarting after `stop`.
#[async_trait]
pub trait PartitionHandler: Send + Sync {
    /// Begin serving the partition. Called only after the lease is held.
    async fn start(&self, ctx: PartitionContext) -> ClusterResult<()>;

    /// Stop serving the partition. Called before the lease is released.
    async fn stop(&self) -> ClusterResult<()>;
}

/// Source of fresh handler instances, one per partition acquisition.
pub trait PartitionHandlerFactory: Send + Sync {
    fn create(&self, partition: PartitionId) -> Arc<dyn PartitionHandler>;
}

impl<F> PartitionHandlerFactory for F
where
    F: Fn(PartitionId) -> Arc<dyn PartitionHandler> + Send + Sync,
{
    fn create(&self, partition: PartitionId) -> Arc<dyn PartitionHandler> {
        self(partition)
    }
}

/// Text of a caught panic payload, for handler failures.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", text)
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("panicked: {}", text)
    } else {
        "panicked".to_string()
    }
}
