//! Connection and subscription settings.
//!
//! [`ConnectionSettings`] can be built three ways:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use eventesque::settings::ConnectionSettings;
//! use eventesque::types::{Attempts, UserCredentials};
//!
//! // Defaults: single node on 127.0.0.1:1113
//! let defaults = ConnectionSettings::default();
//!
//! // Builder
//! let tuned = ConnectionSettings::builder()
//!     .single_node("10.0.0.5:1113".parse().unwrap())
//!     .operation_timeout(Duration::from_secs(3))
//!     .max_reconnections(Attempts::Unlimited)
//!     .default_user_credentials(UserCredentials::new("admin", "changeit"))
//!     .build()
//!     .expect("valid settings");
//!
//! // Environment (EVENTESQUE_* variables)
//! let from_env = ConnectionSettings::from_env().expect("valid environment");
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |---|---|
//! | `EVENTESQUE_ENDPOINT` | single node `host:port` |
//! | `EVENTESQUE_GOSSIP_SEEDS` | comma separated gossip `host:port` list |
//! | `EVENTESQUE_CLUSTER_DNS` | DNS name re-resolved on every discovery |
//! | `EVENTESQUE_GOSSIP_PORT` | gossip port used with the DNS name |
//! | `EVENTESQUE_NODE_PREFERENCE` | `leader`, `follower`, `random`, `read-only-replica` |
//! | `EVENTESQUE_MAX_DISCOVER_ATTEMPTS` | count or `unlimited` |
//! | `EVENTESQUE_MAX_RETRIES` | count or `unlimited` |
//! | `EVENTESQUE_MAX_RECONNECTIONS` | count or `unlimited` |
//! | `EVENTESQUE_RECONNECTION_DELAY_MS` | |
//! | `EVENTESQUE_OPERATION_TIMEOUT_MS` | |
//! | `EVENTESQUE_HEARTBEAT_INTERVAL_MS` | |
//! | `EVENTESQUE_HEARTBEAT_TIMEOUT_MS` | |
//! | `EVENTESQUE_REQUIRE_LEADER` | `true` / `false` |
//! | `EVENTESQUE_USERNAME`, `EVENTESQUE_PASSWORD` | default credentials |
//! | `EVENTESQUE_CONNECTION_NAME` | name reported to the server |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CLIENT_CONNECTION_TIMEOUT_MS, DEFAULT_DISCOVER_DELAY_MS, DEFAULT_GOSSIP_PORT,
    DEFAULT_GOSSIP_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_MAX_CONCURRENT_ITEMS, DEFAULT_MAX_DISCOVER_ATTEMPTS, DEFAULT_MAX_LIVE_QUEUE_SIZE,
    DEFAULT_MAX_OPERATION_RETRIES, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_RECONNECTIONS,
    DEFAULT_OPERATION_TIMEOUT_CHECK_PERIOD_MS, DEFAULT_OPERATION_TIMEOUT_MS,
    DEFAULT_READ_BATCH_SIZE, DEFAULT_RECONNECTION_DELAY_MS, MAX_READ_SIZE,
};
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatConfig;
use crate::types::{Attempts, NodePreference, UserCredentials};

const ENV_PREFIX: &str = "EVENTESQUE_";

/// Default TCP endpoint of a single node.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:1113";

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    SingleNode(SocketAddr),
    Cluster(ClusterSettings),
}

/// Gossip-based discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    /// Gossip HTTP endpoints queried in order. Takes precedence over `cluster_dns`.
    pub gossip_seeds: Vec<SocketAddr>,
    /// DNS name whose addresses are used as gossip seeds.
    pub cluster_dns: Option<String>,
    /// Gossip port paired with the addresses resolved from `cluster_dns`.
    pub external_gossip_port: u16,
    pub max_discover_attempts: Attempts,
    pub gossip_timeout: Duration,
    pub discover_delay: Duration,
    pub node_preference: NodePreference,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            gossip_seeds: Vec::new(),
            cluster_dns: None,
            external_gossip_port: DEFAULT_GOSSIP_PORT,
            max_discover_attempts: Attempts::Limited(DEFAULT_MAX_DISCOVER_ATTEMPTS),
            gossip_timeout: Duration::from_millis(DEFAULT_GOSSIP_TIMEOUT_MS),
            discover_delay: Duration::from_millis(DEFAULT_DISCOVER_DELAY_MS),
            node_preference: NodePreference::Leader,
        }
    }
}

/// Read-only settings of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Operations tracked by the connection, sent or not.
    pub max_queue_size: usize,
    /// Operations sent and awaiting a response.
    pub max_concurrent_items: usize,
    /// Retries per operation, across reconnects.
    pub max_retries: Attempts,
    /// Consecutive failed reconnects before the connection closes.
    /// `Limited(0)` fails fast on the first disconnect.
    pub max_reconnections: Attempts,
    /// Refuse to be served by a non-leader node.
    pub require_leader: bool,
    pub reconnection_delay: Duration,
    pub operation_timeout: Duration,
    pub operation_timeout_check_period: Duration,
    pub default_user_credentials: Option<UserCredentials>,
    /// Fail an operation that got no answer within `operation_timeout`
    /// instead of retrying it.
    pub fail_on_no_server_response: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub client_connection_timeout: Duration,
    /// Name reported to the server; generated when absent.
    pub connection_name: Option<String>,
    pub target: ConnectionTarget,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_concurrent_items: DEFAULT_MAX_CONCURRENT_ITEMS,
            max_retries: Attempts::Limited(DEFAULT_MAX_OPERATION_RETRIES),
            max_reconnections: Attempts::Limited(DEFAULT_MAX_RECONNECTIONS),
            require_leader: true,
            reconnection_delay: Duration::from_millis(DEFAULT_RECONNECTION_DELAY_MS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            operation_timeout_check_period: Duration::from_millis(
                DEFAULT_OPERATION_TIMEOUT_CHECK_PERIOD_MS,
            ),
            default_user_credentials: None,
            fail_on_no_server_response: true,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            client_connection_timeout: Duration::from_millis(DEFAULT_CLIENT_CONNECTION_TIMEOUT_MS),
            connection_name: None,
            target: ConnectionTarget::SingleNode(SocketAddr::from(([127, 0, 0, 1], 1113))),
        }
    }
}

impl ConnectionSettings {
    pub fn builder() -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::default()
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.heartbeat_interval,
            timeout: self.heartbeat_timeout,
        }
    }

    /// Validate the settings and return every violated constraint.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_queue_size == 0 {
            errors.push("max_queue_size must be at least 1".to_string());
        }
        if self.max_concurrent_items == 0 {
            errors.push("max_concurrent_items must be at least 1".to_string());
        }
        if self.operation_timeout.is_zero() {
            errors.push("operation_timeout must be greater than 0".to_string());
        }
        if self.operation_timeout_check_period.is_zero() {
            errors.push("operation_timeout_check_period must be greater than 0".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than 0".to_string());
        }
        if self.heartbeat_timeout.is_zero() {
            errors.push("heartbeat_timeout must be greater than 0".to_string());
        }
        if self.client_connection_timeout.is_zero() {
            errors.push("client_connection_timeout must be greater than 0".to_string());
        }
        if self
            .default_user_credentials
            .as_ref()
            .is_some_and(|creds| creds.username.is_empty())
        {
            errors.push("default_user_credentials username must not be empty".to_string());
        }

        if let ConnectionTarget::Cluster(cluster) = &self.target {
            if cluster.gossip_seeds.is_empty() && cluster.cluster_dns.is_none() {
                errors.push("cluster target needs gossip_seeds or cluster_dns".to_string());
            }
            if cluster
                .cluster_dns
                .as_ref()
                .is_some_and(|dns| dns.trim().is_empty())
            {
                errors.push("cluster_dns must not be empty".to_string());
            }
            if cluster.external_gossip_port == 0 {
                errors.push("external_gossip_port must be between 1 and 65535".to_string());
            }
            if cluster.gossip_timeout.is_zero() {
                errors.push("gossip_timeout must be greater than 0".to_string());
            }
            if cluster.max_discover_attempts == Attempts::Limited(0) {
                errors.push("max_discover_attempts must be at least 1".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load settings from `EVENTESQUE_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        settings.max_retries = env_parse("MAX_RETRIES")?.unwrap_or(settings.max_retries);
        settings.max_reconnections =
            env_parse("MAX_RECONNECTIONS")?.unwrap_or(settings.max_reconnections);
        settings.require_leader = env_parse("REQUIRE_LEADER")?.unwrap_or(settings.require_leader);
        settings.fail_on_no_server_response = env_parse("FAIL_ON_NO_SERVER_RESPONSE")?
            .unwrap_or(settings.fail_on_no_server_response);

        if let Some(ms) = env_parse::<u64>("RECONNECTION_DELAY_MS")? {
            settings.reconnection_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("OPERATION_TIMEOUT_MS")? {
            settings.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("HEARTBEAT_INTERVAL_MS")? {
            settings.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("HEARTBEAT_TIMEOUT_MS")? {
            settings.heartbeat_timeout = Duration::from_millis(ms);
        }

        settings.connection_name = env_var("CONNECTION_NAME");

        match (env_var("USERNAME"), env_var("PASSWORD")) {
            (Some(username), password) => {
                settings.default_user_credentials = Some(UserCredentials::new(
                    username,
                    password.unwrap_or_default(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::Config(format!(
                    "{}PASSWORD is set without {}USERNAME",
                    ENV_PREFIX, ENV_PREFIX
                )));
            }
            (None, None) => {}
        }

        let seeds = env_var("GOSSIP_SEEDS");
        let dns = env_var("CLUSTER_DNS");
        if seeds.is_some() || dns.is_some() {
            let mut cluster = ClusterSettings {
                cluster_dns: dns,
                ..ClusterSettings::default()
            };
            if let Some(seeds) = seeds {
                cluster.gossip_seeds = seeds
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<SocketAddr>().map_err(|e| {
                            Error::Config(format!("Invalid gossip seed '{}': {}", s, e))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
            }
            cluster.external_gossip_port =
                env_parse("GOSSIP_PORT")?.unwrap_or(cluster.external_gossip_port);
            cluster.max_discover_attempts =
                env_parse("MAX_DISCOVER_ATTEMPTS")?.unwrap_or(cluster.max_discover_attempts);
            cluster.node_preference =
                env_parse("NODE_PREFERENCE")?.unwrap_or(cluster.node_preference);
            settings.target = ConnectionTarget::Cluster(cluster);
        } else if let Some(endpoint) = env_parse::<SocketAddr>("ENDPOINT")? {
            settings.target = ConnectionTarget::SingleNode(endpoint);
        }

        settings.validate().map_err(|errors| Error::Config(errors.join("; ")))?;
        Ok(settings)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            Error::Config(format!("Invalid {}{}='{}': {}", ENV_PREFIX, name, raw, e))
        }),
        None => Ok(None),
    }
}

/// Fluent construction of [`ConnectionSettings`]; `build` validates.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettingsBuilder {
    settings: ConnectionSettings,
}

impl ConnectionSettingsBuilder {
    pub fn single_node(mut self, endpoint: SocketAddr) -> Self {
        self.settings.target = ConnectionTarget::SingleNode(endpoint);
        self
    }

    pub fn cluster(mut self, cluster: ClusterSettings) -> Self {
        self.settings.target = ConnectionTarget::Cluster(cluster);
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.settings.max_queue_size = size;
        self
    }

    pub fn max_concurrent_items(mut self, items: usize) -> Self {
        self.settings.max_concurrent_items = items;
        self
    }

    pub fn max_retries(mut self, attempts: Attempts) -> Self {
        self.settings.max_retries = attempts;
        self
    }

    pub fn max_reconnections(mut self, attempts: Attempts) -> Self {
        self.settings.max_reconnections = attempts;
        self
    }

    /// Close on the first disconnect instead of reconnecting.
    pub fn fail_fast(self) -> Self {
        self.max_reconnections(Attempts::Limited(0))
    }

    pub fn require_leader(mut self, require: bool) -> Self {
        self.settings.require_leader = require;
        self
    }

    pub fn reconnection_delay(mut self, delay: Duration) -> Self {
        self.settings.reconnection_delay = delay;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.operation_timeout = timeout;
        self
    }

    pub fn operation_timeout_check_period(mut self, period: Duration) -> Self {
        self.settings.operation_timeout_check_period = period;
        self
    }

    pub fn default_user_credentials(mut self, credentials: UserCredentials) -> Self {
        self.settings.default_user_credentials = Some(credentials);
        self
    }

    pub fn fail_on_no_server_response(mut self, fail: bool) -> Self {
        self.settings.fail_on_no_server_response = fail;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.settings.heartbeat_timeout = timeout;
        self
    }

    pub fn client_connection_timeout(mut self, timeout: Duration) -> Self {
        self.settings.client_connection_timeout = timeout;
        self
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.settings.connection_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<ConnectionSettings> {
        self.settings
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        Ok(self.settings)
    }
}

// =============================================================================
// Subscription Settings
// =============================================================================

/// Settings of a catch-up subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpSubscriptionSettings {
    /// Live events buffered while history is being read.
    /// Exceeding it drops the subscription with `ProcessingQueueOverflow`.
    pub max_live_queue_size: usize,
    /// Page size of historical reads.
    pub read_batch_size: i32,
    pub resolve_link_tos: bool,
    pub subscription_name: Option<String>,
}

impl Default for CatchUpSubscriptionSettings {
    fn default() -> Self {
        Self {
            max_live_queue_size: DEFAULT_MAX_LIVE_QUEUE_SIZE,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            resolve_link_tos: false,
            subscription_name: None,
        }
    }
}

impl CatchUpSubscriptionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.read_batch_size <= 0 || self.read_batch_size > MAX_READ_SIZE {
            return Err(Error::InvalidArgument(format!(
                "read_batch_size must be between 1 and {}, got {}",
                MAX_READ_SIZE, self.read_batch_size
            )));
        }
        if self.max_live_queue_size == 0 {
            return Err(Error::InvalidArgument(
                "max_live_queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a persistent subscription group spreads events over its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerStrategy {
    DispatchToSingle,
    #[default]
    RoundRobin,
    Pinned,
}

impl ConsumerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerStrategy::DispatchToSingle => "DispatchToSingle",
            ConsumerStrategy::RoundRobin => "RoundRobin",
            ConsumerStrategy::Pinned => "Pinned",
        }
    }
}

impl FromStr for ConsumerStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DispatchToSingle" => Ok(ConsumerStrategy::DispatchToSingle),
            "RoundRobin" => Ok(ConsumerStrategy::RoundRobin),
            "Pinned" => Ok(ConsumerStrategy::Pinned),
            other => Err(format!("unknown consumer strategy '{}'", other)),
        }
    }
}

/// Server-side definition of a persistent subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    /// First event number handed to the group; `-1` starts at the end.
    pub start_from: i64,
    pub extra_statistics: bool,
    /// An unacknowledged event is redelivered after this long.
    pub message_timeout: Duration,
    /// Deliveries before an event is parked.
    pub max_retry_count: i32,
    pub live_buffer_size: i32,
    pub read_batch_size: i32,
    pub history_buffer_size: i32,
    pub checkpoint_after: Duration,
    pub min_checkpoint_count: i32,
    pub max_checkpoint_count: i32,
    /// `0` means unbounded.
    pub max_subscriber_count: i32,
    pub named_consumer_strategy: ConsumerStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            extra_statistics: false,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after: Duration::from_secs(2),
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            max_subscriber_count: 0,
            named_consumer_strategy: ConsumerStrategy::RoundRobin,
        }
    }
}

impl PersistentSubscriptionSettings {
    pub fn resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    /// Deliver from the first event of the stream.
    pub fn start_from_beginning(mut self) -> Self {
        self.start_from = 0;
        self
    }

    pub fn start_from(mut self, event_number: i64) -> Self {
        self.start_from = event_number;
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn max_retry_count(mut self, count: i32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn max_subscriber_count(mut self, count: i32) -> Self {
        self.max_subscriber_count = count;
        self
    }

    pub fn consumer_strategy(mut self, strategy: ConsumerStrategy) -> Self {
        self.named_consumer_strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_from < -1 {
            return Err(Error::InvalidArgument(format!(
                "start_from must be >= -1, got {}",
                self.start_from
            )));
        }
        if self.max_subscriber_count < 0 {
            return Err(Error::InvalidArgument(
                "max_subscriber_count must not be negative".to_string(),
            ));
        }
        if self.read_batch_size <= 0 || self.live_buffer_size <= 0 || self.history_buffer_size <= 0
        {
            return Err(Error::InvalidArgument(
                "buffer and batch sizes must be positive".to_string(),
            ));
        }
        if self.min_checkpoint_count > self.max_checkpoint_count {
            return Err(Error::InvalidArgument(
                "min_checkpoint_count must not exceed max_checkpoint_count".to_string(),
            ));
        }
        Ok(())
    }
}
