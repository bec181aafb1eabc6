//! Prometheus metrics for partition coordination.
//!
//! Metrics cover:
//! - Coordinator lifecycle (state, failures)
//! - Partition ownership (active partitions, handler failures)
//! - Ring membership (workers, transitions applied)
//! - Lease acquisition outcomes and lock queue faults
//! - Coordinator actions (duration, stalled actions seen by the watchdog)
//! - Retries of coordination service calls
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "ringlease" prefix to avoid
//! name collisions with other libraries using the default Prometheus registry.
//! Registration errors are handled gracefully: if a metric fails to register,
//! the unregistered metric is returned instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

use super::lifecycle::ServiceState;

/// Custom Prometheus registry for ringlease metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("ringlease".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================
//
//   define_gauge!(MY_GAUGE, "my_metric", "Description");
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Coordinator metrics
// =============================================================================

define_gauge!(
    COORDINATOR_STATE,
    "coordinator_state",
    "Coordinator lifecycle state (0=not-started, 1=starting, 2=running, 3=stopping, 4=terminated, 5=failed)"
);
define_counter_vec!(
    COORDINATOR_FAILURES,
    "coordinator_failures_total",
    "Coordinator failures by cause",
    ["cause"]
);
define_histogram_vec!(
    ACTION_DURATION,
    "action_duration_seconds",
    "Duration of coordinator actions from submission to completion",
    ["kind", "outcome"],
    [0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 20.0, 60.0, 300.0]
);
define_counter!(
    STALLED_ACTIONS,
    "stalled_actions_total",
    "Unfinished actions reported by the watchdog"
);

// =============================================================================
// Ownership metrics
// =============================================================================

define_gauge!(
    ACTIVE_PARTITIONS,
    "active_partitions",
    "Partitions currently assigned to this node"
);
define_counter_vec!(
    PARTITION_CHANGES,
    "partition_changes_total",
    "Partitions started or stopped by reconciliation",
    ["change"]
);
define_counter!(
    HANDLER_FAILURES,
    "handler_failures_total",
    "Partition handler failures while active"
);

// =============================================================================
// Membership metrics
// =============================================================================

define_gauge!(RING_WORKERS, "ring_workers", "Workers currently on the hash ring");
define_counter_vec!(
    MEMBERSHIP_TRANSITIONS,
    "membership_transitions_total",
    "Membership changes delivered after debouncing",
    ["change"]
);

// =============================================================================
// Lease metrics
// =============================================================================

define_counter_vec!(
    LEASE_ACQUISITIONS,
    "lease_acquisitions_total",
    "Lease acquisition outcomes",
    ["outcome"]
);
define_counter!(
    LOCK_QUEUE_LOST,
    "lock_queue_lost_total",
    "Lock attempts whose own queue entry disappeared"
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Coordination call retries by operation",
    ["operation", "result"]
);

// =============================================================================
// Registration helpers
// =============================================================================

// Metric names and help strings are static literals, so construction cannot fail.

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Register every metric up front so they show up in the first scrape.
///
/// Idempotent; metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*COORDINATOR_STATE;
    let _ = &*COORDINATOR_FAILURES;
    let _ = &*ACTION_DURATION;
    let _ = &*STALLED_ACTIONS;
    let _ = &*ACTIVE_PARTITIONS;
    let _ = &*PARTITION_CHANGES;
    let _ = &*HANDLER_FAILURES;
    let _ = &*RING_WORKERS;
    let _ = &*MEMBERSHIP_TRANSITIONS;
    let _ = &*LEASE_ACQUISITIONS;
    let _ = &*LOCK_QUEUE_LOST;
    let _ = &*RETRY_ATTEMPTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn set_coordinator_state(state: ServiceState) {
    COORDINATOR_STATE.set(state.as_gauge_value());
}

pub fn record_coordinator_failure(cause: &str) {
    COORDINATOR_FAILURES.with_label_values(&[cause]).inc();
}

/// Record a finished action. `outcome` is "success", "error" or "abandoned".
pub fn record_action(kind: &str, outcome: &str, duration_secs: f64) {
    ACTION_DURATION
        .with_label_values(&[kind, outcome])
        .observe(duration_secs);
}

pub fn record_stalled_actions(count: usize) {
    STALLED_ACTIONS.inc_by(count as u64);
}

pub fn set_active_partitions(count: usize) {
    ACTIVE_PARTITIONS.set(count as i64);
}

/// Record partitions started (`"added"`) or stopped (`"removed"`).
pub fn record_partition_changes(change: &str, count: usize) {
    if count > 0 {
        PARTITION_CHANGES
            .with_label_values(&[change])
            .inc_by(count as u64);
    }
}

pub fn record_handler_failure() {
    HANDLER_FAILURES.inc();
}

pub fn set_ring_workers(count: usize) {
    RING_WORKERS.set(count as i64);
}

pub fn record_membership_transition(joined: usize, departed: usize) {
    if joined > 0 {
        MEMBERSHIP_TRANSITIONS
            .with_label_values(&["joined"])
            .inc_by(joined as u64);
    }
    if departed > 0 {
        MEMBERSHIP_TRANSITIONS
            .with_label_values(&["departed"])
            .inc_by(departed as u64);
    }
}

/// Record a lease acquisition. `outcome` is "acquired", "abandoned" or "error".
pub fn record_lease_acquisition(outcome: &str) {
    LEASE_ACQUISITIONS.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_encode_contains_registered_metrics() {
        init_metrics();
        record_lease_acquisition("acquired");
        set_coordinator_state(ServiceState::Running);

        let text = encode_metrics().unwrap();
        assert!(text.contains("ringlease_lease_acquisitions_total"));
        assert!(text.contains("ringlease_coordinator_state"));
    }

    #[test]
    #[serial]
    fn test_counters_accumulate() {
        let before = LEASE_ACQUISITIONS.with_label_values(&["abandoned"]).get();
        record_lease_acquisition("abandoned");
        record_lease_acquisition("abandoned");
        assert_eq!(
            LEASE_ACQUISITIONS.with_label_values(&["abandoned"]).get(),
            before + 2
        );
    }

    #[test]
    fn test_zero_changes_are_not_recorded() {
        record_partition_changes("noop-check", 0);
        assert_eq!(PARTITION_CHANGES.with_label_values(&["noop-check"]).get(), 0);
    }
}
