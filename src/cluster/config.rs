//! Configuration for the partition coordinator.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ringlease::cluster::CoordinatorConfig;
//!
//! // Defaults, overridden by environment variables where set
//! let config = CoordinatorConfig::from_env().expect("invalid configuration");
//!
//! // Or built in code
//! let config = CoordinatorConfig::default()
//!     .with_partition_count(4_096)
//!     .with_membership_debounce(Duration::from_millis(250), Duration::from_secs(2));
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `VIRTUAL_NODES_PER_WORKER` | 10000 |
//! | `PARTITION_COUNT` | 1024 |
//! | `MEMBERSHIP_IDLE_MS` | 500 |
//! | `MEMBERSHIP_MAX_DELAY_MS` | 5000 |
//! | `LOCK_ROOT` | `/ringlease/locks` |
//! | `WATCHDOG_INTERVAL_SECS` | 20 |
//! | `COORDINATION_CONNECT` | `127.0.0.1:2181` |
//! | `COORDINATION_SESSION_TIMEOUT_MS` | 30000 |
//! | `COORDINATION_CONNECT_TIMEOUT_MS` | 15000 |
//!
//! Unparseable values fall back to the default; the combined result is then
//! validated.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{ClusterError, ClusterResult};
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_COORDINATION_CONNECT, DEFAULT_LOCK_ROOT,
    DEFAULT_MEMBERSHIP_IDLE, DEFAULT_MEMBERSHIP_MAX_DELAY, DEFAULT_PARTITION_COUNT,
    DEFAULT_SESSION_TIMEOUT, DEFAULT_VIRTUAL_NODES_PER_WORKER, DEFAULT_WATCHDOG_INTERVAL,
    MAX_PARTITION_COUNT,
};
use crate::types::PartitionId;

/// Connection settings handed to the coordination service client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Comma-separated `host:port` list of the coordination ensemble.
    pub connect: String,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            connect: DEFAULT_COORDINATION_CONNECT.to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Virtual nodes each worker occupies on the hash ring.
    pub virtual_nodes_per_worker: usize,
    /// Size of the partition keyspace; partitions are `0..partition_count`.
    pub partition_count: u32,
    /// Quiet period that ends a membership burst.
    pub membership_idle: Duration,
    /// Longest a membership burst may be held back.
    pub membership_max_delay: Duration,
    /// Root path for per-partition lock queues.
    pub lock_root: String,
    /// How often unfinished actions are reported.
    pub watchdog_interval: Duration,
    pub coordination: CoordinationConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            virtual_nodes_per_worker: DEFAULT_VIRTUAL_NODES_PER_WORKER,
            partition_count: DEFAULT_PARTITION_COUNT,
            membership_idle: DEFAULT_MEMBERSHIP_IDLE,
            membership_max_delay: DEFAULT_MEMBERSHIP_MAX_DELAY,
            lock_root: DEFAULT_LOCK_ROOT.to_string(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            coordination: CoordinationConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis_or(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl CoordinatorConfig {
    /// Load from environment variables over the defaults, then validate.
    pub fn from_env() -> ClusterResult<Self> {
        let defaults = Self::default();

        let config = Self {
            virtual_nodes_per_worker: env_or(
                "VIRTUAL_NODES_PER_WORKER",
                defaults.virtual_nodes_per_worker,
            ),
            partition_count: env_or("PARTITION_COUNT", defaults.partition_count),
            membership_idle: env_millis_or("MEMBERSHIP_IDLE_MS", defaults.membership_idle),
            membership_max_delay: env_millis_or(
                "MEMBERSHIP_MAX_DELAY_MS",
                defaults.membership_max_delay,
            ),
            lock_root: std::env::var("LOCK_ROOT").unwrap_or(defaults.lock_root),
            watchdog_interval: std::env::var("WATCHDOG_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.watchdog_interval),
            coordination: CoordinationConfig {
                connect: std::env::var("COORDINATION_CONNECT")
                    .unwrap_or(defaults.coordination.connect),
                session_timeout: env_millis_or(
                    "COORDINATION_SESSION_TIMEOUT_MS",
                    defaults.coordination.session_timeout,
                ),
                connect_timeout: env_millis_or(
                    "COORDINATION_CONNECT_TIMEOUT_MS",
                    defaults.coordination.connect_timeout,
                ),
            },
        };

        config
            .validate()
            .map_err(|errors| ClusterError::Config(errors.join("; ")))?;
        Ok(config)
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.virtual_nodes_per_worker == 0 {
            errors.push("virtual_nodes_per_worker must be at least 1".to_string());
        }

        if self.partition_count == 0 || self.partition_count > MAX_PARTITION_COUNT {
            errors.push(format!(
                "partition_count ({}) must be between 1 and {}",
                self.partition_count, MAX_PARTITION_COUNT
            ));
        }

        if self.membership_idle > self.membership_max_delay {
            errors.push(format!(
                "membership_idle ({:?}) must not exceed membership_max_delay ({:?})",
                self.membership_idle, self.membership_max_delay
            ));
        }

        if !self.lock_root.starts_with('/') || self.lock_root.len() < 2 {
            errors.push(format!(
                "lock_root ({}) must be an absolute path below the root",
                self.lock_root
            ));
        }

        if self.watchdog_interval.is_zero() {
            errors.push("watchdog_interval must be greater than zero".to_string());
        }

        if self.coordination.connect.trim().is_empty() {
            errors.push("coordination.connect must not be empty".to_string());
        }

        if self.coordination.connect_timeout > self.coordination.session_timeout {
            errors.push(format!(
                "coordination.connect_timeout ({:?}) must not exceed session_timeout ({:?})",
                self.coordination.connect_timeout, self.coordination.session_timeout
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Every partition in the keyspace.
    pub fn partitions(&self) -> Vec<PartitionId> {
        PartitionId::all(self.partition_count)
    }

    pub fn with_virtual_nodes_per_worker(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes_per_worker = virtual_nodes;
        self
    }

    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_membership_debounce(mut self, idle: Duration, max_delay: Duration) -> Self {
        self.membership_idle = idle;
        self.membership_max_delay = max_delay;
        self
    }

    pub fn with_lock_root(mut self, lock_root: impl Into<String>) -> Self {
        self.lock_root = lock_root.into();
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_coordination(mut self, coordination: CoordinationConfig) -> Self {
        self.coordination = coordination;
        self
    }
}
