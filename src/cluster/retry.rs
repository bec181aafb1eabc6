//! Retry policies for coordination service calls.
//!
//! Every retry in the crate goes through one of these named `backon`
//! policies so backoff behavior stays consistent and visible in metrics.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `coordination_policy` | 50ms | 5s | 10 | Lock node creation, queue listing, cleanup |
//! | `fast_policy` | 5ms | 100ms | 3 | Best-effort cleanup on teardown paths |
//!
//! Only [`ClusterError::is_transient`] errors are retried; anything else is
//! returned to the caller on the first attempt.
//!
//! # Example
//!
//! ```rust,ignore
//! use ringlease::cluster::retry;
//!
//! let children = retry::with_coordination_policy("list_lock_queue", || async {
//!     service.get_children("/ringlease/locks/partition-1", true).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use super::error::{ClusterError, ClusterResult};
use super::metrics;

/// Policy for coordination service operations.
///
/// Long enough to ride out a leader election on the service side, with
/// jitter so every contender does not come back at once.
pub fn coordination_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Policy for best-effort paths where latency matters more than success.
pub fn fast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Run `operation` under [`coordination_policy`], retrying transient errors.
pub async fn with_coordination_policy<F, Fut, T>(operation_name: &'static str, operation: F) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClusterResult<T>>,
{
    run_with(operation_name, coordination_policy(), operation).await
}

/// Run `operation` under [`fast_policy`], retrying transient errors.
pub async fn with_fast_policy<F, Fut, T>(operation_name: &'static str, operation: F) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClusterResult<T>>,
{
    run_with(operation_name, fast_policy(), operation).await
}

async fn run_with<F, Fut, T>(
    operation_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClusterResult<T>>,
{
    let result = operation
        .retry(policy)
        .when(ClusterError::is_transient)
        .notify(|err, delay| record_retry_attempt(operation_name, err, delay))
        .await;

    if let Err(e) = &result
        && e.is_transient()
    {
        record_retry_exhausted(operation_name);
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(operation: &str, error: &ClusterError, delay: Duration) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[operation, "attempt"])
        .inc();
    tracing::debug!(
        operation,
        error = %error,
        delay_ms = delay.as_millis() as u64,
        "Retrying coordination call"
    );
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(operation: &str) {
    metrics::RETRY_ATTEMPTS
        .with_label_values(&[operation, "exhausted"])
        .inc();
    tracing::warn!(operation, "Retry policy exhausted");
}
