//! `ConnectionSettings::from_env` against real process environment variables.
//!
//! Every test runs serially and restores the variables it touched.

use std::env;
use std::time::Duration;

use eventesque::Error;
use eventesque::settings::{ConnectionSettings, ConnectionTarget};
use eventesque::types::{Attempts, NodePreference, UserCredentials};
use serial_test::serial;

const ALL_SETTINGS_ENV_VARS: &[&str] = &[
    "EVENTESQUE_ENDPOINT",
    "EVENTESQUE_GOSSIP_SEEDS",
    "EVENTESQUE_CLUSTER_DNS",
    "EVENTESQUE_GOSSIP_PORT",
    "EVENTESQUE_NODE_PREFERENCE",
    "EVENTESQUE_MAX_DISCOVER_ATTEMPTS",
    "EVENTESQUE_MAX_RETRIES",
    "EVENTESQUE_MAX_RECONNECTIONS",
    "EVENTESQUE_RECONNECTION_DELAY_MS",
    "EVENTESQUE_OPERATION_TIMEOUT_MS",
    "EVENTESQUE_HEARTBEAT_INTERVAL_MS",
    "EVENTESQUE_HEARTBEAT_TIMEOUT_MS",
    "EVENTESQUE_REQUIRE_LEADER",
    "EVENTESQUE_FAIL_ON_NO_SERVER_RESPONSE",
    "EVENTESQUE_USERNAME",
    "EVENTESQUE_PASSWORD",
    "EVENTESQUE_CONNECTION_NAME",
];

/// Run `f` with exactly `vars` set among the settings variables.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let originals: Vec<_> = ALL_SETTINGS_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_SETTINGS_ENV_VARS {
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

// ============================================================================
// Single Node
// ============================================================================

#[test]
#[serial]
fn test_from_env_defaults_without_variables() {
    let settings = with_env_vars(&[], ConnectionSettings::from_env).unwrap();
    assert_eq!(settings.max_retries, Attempts::Limited(10));
    assert!(settings.default_user_credentials.is_none());
    assert!(matches!(settings.target, ConnectionTarget::SingleNode(_)));
}

#[test]
#[serial]
fn test_from_env_single_node() {
    let settings = with_env_vars(
        &[
            ("EVENTESQUE_ENDPOINT", "10.1.2.3:1113"),
            ("EVENTESQUE_MAX_RETRIES", "unlimited"),
            ("EVENTESQUE_OPERATION_TIMEOUT_MS", "2500"),
            ("EVENTESQUE_USERNAME", "admin"),
            ("EVENTESQUE_PASSWORD", "changeit"),
            ("EVENTESQUE_CONNECTION_NAME", "billing"),
        ],
        ConnectionSettings::from_env,
    )
    .unwrap();

    assert_eq!(
        settings.target,
        ConnectionTarget::SingleNode("10.1.2.3:1113".parse().unwrap())
    );
    assert_eq!(settings.max_retries, Attempts::Unlimited);
    assert_eq!(settings.operation_timeout, Duration::from_millis(2500));
    assert_eq!(
        settings.default_user_credentials,
        Some(UserCredentials::new("admin", "changeit"))
    );
    assert_eq!(settings.connection_name.as_deref(), Some("billing"));
}

// ============================================================================
// Cluster
// ============================================================================

#[test]
#[serial]
fn test_from_env_cluster_seeds() {
    let settings = with_env_vars(
        &[
            ("EVENTESQUE_GOSSIP_SEEDS", "10.0.0.1:2113, 10.0.0.2:2113"),
            ("EVENTESQUE_NODE_PREFERENCE", "follower"),
            ("EVENTESQUE_MAX_DISCOVER_ATTEMPTS", "3"),
        ],
        ConnectionSettings::from_env,
    )
    .unwrap();

    let ConnectionTarget::Cluster(cluster) = settings.target else {
        panic!("expected cluster target");
    };
    assert_eq!(cluster.gossip_seeds.len(), 2);
    assert_eq!(cluster.node_preference, NodePreference::Follower);
    assert_eq!(cluster.max_discover_attempts, Attempts::Limited(3));
}

#[test]
#[serial]
fn test_from_env_cluster_dns() {
    let settings = with_env_vars(
        &[
            ("EVENTESQUE_CLUSTER_DNS", "eventstore.local"),
            ("EVENTESQUE_GOSSIP_PORT", "30778"),
        ],
        ConnectionSettings::from_env,
    )
    .unwrap();

    let ConnectionTarget::Cluster(cluster) = settings.target else {
        panic!("expected cluster target");
    };
    assert_eq!(cluster.cluster_dns.as_deref(), Some("eventstore.local"));
    assert_eq!(cluster.external_gossip_port, 30778);
    assert!(cluster.gossip_seeds.is_empty());
}

// ============================================================================
// Rejections
// ============================================================================

#[test]
#[serial]
fn test_from_env_rejects_unparsable_values() {
    let result = with_env_vars(
        &[("EVENTESQUE_HEARTBEAT_TIMEOUT_MS", "soon")],
        ConnectionSettings::from_env,
    );
    assert!(matches!(result, Err(Error::Config(_))));

    let result = with_env_vars(
        &[("EVENTESQUE_GOSSIP_SEEDS", "not-an-address")],
        ConnectionSettings::from_env,
    );
    assert!(matches!(result, Err(Error::Config(m)) if m.contains("not-an-address")));
}

#[test]
#[serial]
fn test_from_env_rejects_password_without_username() {
    let result = with_env_vars(
        &[("EVENTESQUE_PASSWORD", "secret")],
        ConnectionSettings::from_env,
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_from_env_runs_validation() {
    let result = with_env_vars(
        &[("EVENTESQUE_OPERATION_TIMEOUT_MS", "0")],
        ConnectionSettings::from_env,
    );
    assert!(matches!(result, Err(Error::Config(m)) if m.contains("operation_timeout")));
}
