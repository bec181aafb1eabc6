//! Integration tests for CoordinatorConfig::from_env()
//!
//! Environment variables are process-global, so every test here runs under
//! `#[serial]` and restores the variables it touched.

use std::env;
use std::time::Duration;

use ringlease::cluster::{ClusterError, CoordinatorConfig};
use serial_test::serial;

/// All environment variables read by CoordinatorConfig::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "VIRTUAL_NODES_PER_WORKER",
    "PARTITION_COUNT",
    "MEMBERSHIP_IDLE_MS",
    "MEMBERSHIP_MAX_DELAY_MS",
    "LOCK_ROOT",
    "WATCHDOG_INTERVAL_SECS",
    "COORDINATION_CONNECT",
    "COORDINATION_SESSION_TIMEOUT_MS",
    "COORDINATION_CONNECT_TIMEOUT_MS",
];

/// Run `f` with exactly `vars` set among the config variables.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }
    result
}

#[test]
#[serial]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let config = CoordinatorConfig::from_env().expect("defaults are valid");
        assert_eq!(config, CoordinatorConfig::default());
    });
}

#[test]
#[serial]
fn test_from_env_overrides() {
    with_env_vars(
        &[
            ("VIRTUAL_NODES_PER_WORKER", "128"),
            ("PARTITION_COUNT", "4096"),
            ("MEMBERSHIP_IDLE_MS", "250"),
            ("MEMBERSHIP_MAX_DELAY_MS", "2000"),
            ("LOCK_ROOT", "/apps/locks"),
            ("WATCHDOG_INTERVAL_SECS", "5"),
            ("COORDINATION_CONNECT", "zk1:2181,zk2:2181"),
            ("COORDINATION_SESSION_TIMEOUT_MS", "20000"),
            ("COORDINATION_CONNECT_TIMEOUT_MS", "5000"),
        ],
        || {
            let config = CoordinatorConfig::from_env().expect("should parse config");
            assert_eq!(config.virtual_nodes_per_worker, 128);
            assert_eq!(config.partition_count, 4096);
            assert_eq!(config.membership_idle, Duration::from_millis(250));
            assert_eq!(config.membership_max_delay, Duration::from_secs(2));
            assert_eq!(config.lock_root, "/apps/locks");
            assert_eq!(config.watchdog_interval, Duration::from_secs(5));
            assert_eq!(config.coordination.connect, "zk1:2181,zk2:2181");
            assert_eq!(config.coordination.session_timeout, Duration::from_secs(20));
            assert_eq!(config.coordination.connect_timeout, Duration::from_secs(5));
        },
    );
}

#[test]
#[serial]
fn test_from_env_unparseable_falls_back_to_default() {
    with_env_vars(
        &[("PARTITION_COUNT", "lots"), ("MEMBERSHIP_IDLE_MS", "-3")],
        || {
            let config = CoordinatorConfig::from_env().expect("should parse config");
            let defaults = CoordinatorConfig::default();
            assert_eq!(config.partition_count, defaults.partition_count);
            assert_eq!(config.membership_idle, defaults.membership_idle);
        },
    );
}

#[test]
#[serial]
fn test_from_env_rejects_invalid_combination() {
    with_env_vars(
        &[
            ("MEMBERSHIP_IDLE_MS", "9000"),
            ("MEMBERSHIP_MAX_DELAY_MS", "1000"),
            ("PARTITION_COUNT", "0"),
        ],
        || {
            let err = CoordinatorConfig::from_env().unwrap_err();
            let ClusterError::Config(message) = err else {
                panic!("expected a config error, got {err:?}");
            };
            assert!(message.contains("membership_idle"));
            assert!(message.contains("partition_count"));
        },
    );
}

#[test]
#[serial]
fn test_from_env_rejects_relative_lock_root() {
    with_env_vars(&[("LOCK_ROOT", "locks")], || {
        let err = CoordinatorConfig::from_env().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("lock_root"));
    });
}

#[test]
fn test_config_serde_shape() {
    let config = CoordinatorConfig::default().with_partition_count(8);
    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["partition_count"], 8);
    assert_eq!(json["lock_root"], "/ringlease/locks");

    let back: CoordinatorConfig = serde_json::from_value(json).unwrap();
    assert_eq!(back, config);
}
