//! Centralized defaults and protocol constants.
//!
//! Everything tunable has its default here so `CoordinatorConfig::default()`,
//! `from_env()` and the docs agree on one value.
//!
//! # Categories
//!
//! - **Ring Constants**: virtual node counts and partition keyspace size
//! - **Membership Constants**: debounce timing for join/leave bursts
//! - **Lock Constants**: node naming for the sequential-node lock recipe
//! - **Coordinator Constants**: watchdog cadence

use std::time::Duration;

// =============================================================================
// Ring Constants
// =============================================================================

/// Default number of virtual nodes each worker occupies on the hash ring.
///
/// Higher values smooth the distribution at the cost of memory: with N workers
/// the ring has N * 10,000 positions.
pub const DEFAULT_VIRTUAL_NODES_PER_WORKER: usize = 10_000;

/// Default size of the partition keyspace.
pub const DEFAULT_PARTITION_COUNT: u32 = 1_024;

/// Upper bound accepted by config validation for the partition keyspace.
pub const MAX_PARTITION_COUNT: u32 = 1_000_000;

// =============================================================================
// Membership Constants
// =============================================================================

/// Silence required after the last membership event before a transition is flushed.
pub const DEFAULT_MEMBERSHIP_IDLE: Duration = Duration::from_millis(500);

/// Ceiling on how long the first event of a burst may be held back.
pub const DEFAULT_MEMBERSHIP_MAX_DELAY: Duration = Duration::from_secs(5);

// =============================================================================
// Lock Constants
// =============================================================================

/// Default root under which one lock directory per resource is created.
pub const DEFAULT_LOCK_ROOT: &str = "/ringlease/locks";

/// Separator between the owner id and the service-appended sequence suffix.
///
/// Without it an owner id ending in digits would be indistinguishable from the
/// sequence number.
pub const LOCK_NODE_DELIMITER: &str = "-lock-";

/// Marker that starts a retry-safe ("protected") node name.
pub const PROTECTED_PREFIX: &str = "_c_";

/// Width of the zero-padded sequence suffix appended by the coordination service.
pub const SEQUENCE_DIGITS: usize = 10;

/// Default coordination service connect string.
pub const DEFAULT_COORDINATION_CONNECT: &str = "127.0.0.1:2181";

/// Default coordination session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default coordination connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Coordinator Constants
// =============================================================================

/// How often the action watchdog looks for unfinished actions.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(20);

/// Time allowed for background tasks to exit during coordinator shutdown.
pub const BACKGROUND_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
