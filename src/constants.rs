//! Centralized protocol and configuration constants.
//!
//! # Categories
//!
//! - **Protocol Constants**: framing sizes and wire limits
//! - **Read Constants**: page size limits
//! - **Connection Defaults**: timing and retry defaults used by [`ConnectionSettings`]
//!
//! [`ConnectionSettings`]: crate::settings::ConnectionSettings

// =============================================================================
// Protocol Constants
// =============================================================================

/// Size of the length prefix in front of every frame.
pub const FRAME_LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed header of a package: command (1) + flags (1) + correlation id (16).
pub const PACKAGE_HEADER_SIZE: usize = 18;

/// Maximum allowed frame size (64 MB).
///
/// Frames larger than this are rejected and the connection is closed.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum length of a login or password in an authenticated package header.
pub const MAX_CREDENTIAL_LENGTH: usize = 255;

/// Maximum number of elements accepted in a protocol array.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

/// Protocol version sent during client identification.
pub const CLIENT_VERSION: i32 = 1;

// =============================================================================
// Read Constants
// =============================================================================

/// Largest page a single read request may ask for.
pub const MAX_READ_SIZE: i32 = 4096;

/// Default page size used by catch-up subscriptions.
pub const DEFAULT_READ_BATCH_SIZE: i32 = 500;

/// Default bound on live events queued by a catch-up subscription.
pub const DEFAULT_MAX_LIVE_QUEUE_SIZE: usize = 10_000;

/// Default in-flight window of a persistent subscription.
pub const DEFAULT_PERSISTENT_BUFFER_SIZE: usize = 10;

// =============================================================================
// Connection Defaults
// =============================================================================

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 5000;
pub const DEFAULT_MAX_CONCURRENT_ITEMS: usize = 5000;
pub const DEFAULT_MAX_OPERATION_RETRIES: u32 = 10;
pub const DEFAULT_MAX_RECONNECTIONS: u32 = 10;
pub const DEFAULT_RECONNECTION_DELAY_MS: u64 = 100;
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 7000;
pub const DEFAULT_OPERATION_TIMEOUT_CHECK_PERIOD_MS: u64 = 1000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 750;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 1500;
pub const DEFAULT_CLIENT_CONNECTION_TIMEOUT_MS: u64 = 1000;

/// Tick period of the connection actor's timer.
pub const TIMER_PERIOD_MS: u64 = 200;

// =============================================================================
// Cluster Discovery Defaults
// =============================================================================

pub const DEFAULT_GOSSIP_PORT: u16 = 2113;
pub const DEFAULT_MAX_DISCOVER_ATTEMPTS: u32 = 10;
pub const DEFAULT_GOSSIP_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_DISCOVER_DELAY_MS: u64 = 500;

/// Upper bound on a gossip HTTP response body.
pub const MAX_GOSSIP_RESPONSE_SIZE: usize = 1024 * 1024;
