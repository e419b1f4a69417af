//! Type-safe wrappers for event store primitives.
//!
//! These types keep the reserved sentinel values of the protocol (expected
//! versions, read positions) out of raw integers at API boundaries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_READ_SIZE;
use crate::error::{Error, Result};

/// Optimistic-concurrency precondition supplied on a write.
///
/// # Special Values
///
/// - `Any` (`-2`): no check is performed.
/// - `NoStream` (`-1`): the stream must not exist yet.
/// - `StreamExists` (`-4`): the stream must exist (it may be empty).
/// - `Exact(n)`: the last event of the stream must have number `n`.
///
/// The protocol also names `-1` "empty stream" in write semantics. Both names
/// collapse onto the same wire value, so [`ExpectedVersion::EMPTY_STREAM`] is an
/// alias of [`ExpectedVersion::NoStream`] rather than a separate variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    Any,
    NoStream,
    StreamExists,
    Exact(u64),
}

impl ExpectedVersion {
    /// Alias of `NoStream`; `-1` on the wire.
    pub const EMPTY_STREAM: Self = ExpectedVersion::NoStream;

    const ANY_WIRE: i64 = -2;
    const NO_STREAM_WIRE: i64 = -1;
    const STREAM_EXISTS_WIRE: i64 = -4;

    /// Wire representation of this expected version.
    pub const fn to_wire(self) -> i64 {
        match self {
            ExpectedVersion::Any => Self::ANY_WIRE,
            ExpectedVersion::NoStream => Self::NO_STREAM_WIRE,
            ExpectedVersion::StreamExists => Self::STREAM_EXISTS_WIRE,
            ExpectedVersion::Exact(n) => n as i64,
        }
    }

    /// Parse a wire value. Returns `None` for undefined negative values.
    pub const fn from_wire(value: i64) -> Option<Self> {
        match value {
            Self::ANY_WIRE => Some(ExpectedVersion::Any),
            Self::NO_STREAM_WIRE => Some(ExpectedVersion::NoStream),
            Self::STREAM_EXISTS_WIRE => Some(ExpectedVersion::StreamExists),
            n if n >= 0 => Some(ExpectedVersion::Exact(n as u64)),
            _ => None,
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        ExpectedVersion::Exact(value)
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "Any"),
            ExpectedVersion::NoStream => write!(f, "NoStream"),
            ExpectedVersion::StreamExists => write!(f, "StreamExists"),
            ExpectedVersion::Exact(n) => write!(f, "{}", n),
        }
    }
}

/// Read cursors within a single stream.
pub struct StreamPosition;

impl StreamPosition {
    /// First event of a stream.
    pub const START: i64 = 0;
    /// Last event of a stream (backward reads, `read_event`).
    pub const END: i64 = -1;
}

/// A point in the global log, ordered by commit then prepare position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Position {
    pub commit: i64,
    pub prepare: i64,
}

impl Position {
    /// Beginning of the log.
    pub const START: Self = Position {
        commit: 0,
        prepare: 0,
    };

    /// End of the log (used for backward reads).
    pub const END: Self = Position {
        commit: -1,
        prepare: -1,
    };

    #[inline]
    pub const fn new(commit: i64, prepare: i64) -> Self {
        Position { commit, prepare }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit, self.prepare)
    }
}

/// Credentials attached to a package.
#[derive(Clone, PartialEq, Eq)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Bound on a retrying activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    Limited(u32),
    Unlimited,
}

impl Attempts {
    /// Whether `used` attempts exhaust the bound.
    #[inline]
    pub fn is_exhausted(self, used: u32) -> bool {
        match self {
            Attempts::Limited(max) => used >= max,
            Attempts::Unlimited => false,
        }
    }
}

impl FromStr for Attempts {
    type Err = String;

    /// `-1` and `unlimited` mean retry forever.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "-1" | "unlimited" | "infinite" => Ok(Attempts::Unlimited),
            other => other
                .parse::<u32>()
                .map(Attempts::Limited)
                .map_err(|_| format!("invalid attempt count '{}'", s)),
        }
    }
}

/// Which cluster member a client prefers to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodePreference {
    #[default]
    Leader,
    Follower,
    Random,
    ReadOnlyReplica,
}

impl FromStr for NodePreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leader" | "master" => Ok(NodePreference::Leader),
            "follower" | "slave" => Ok(NodePreference::Follower),
            "random" => Ok(NodePreference::Random),
            "readonlyreplica" | "read-only-replica" | "read_only_replica" => {
                Ok(NodePreference::ReadOnlyReplica)
            }
            _ => Err(format!(
                "Unknown node preference '{}'. Valid values: leader, follower, random, read-only-replica",
                s
            )),
        }
    }
}

/// Reject empty stream names.
pub fn validate_stream(stream: &str) -> Result<()> {
    if stream.is_empty() {
        return Err(Error::InvalidArgument("stream must not be empty".to_string()));
    }
    Ok(())
}

/// Reject page sizes outside `1..=MAX_READ_SIZE`.
pub fn validate_count(count: i32) -> Result<()> {
    if count <= 0 {
        return Err(Error::InvalidArgument(format!(
            "count must be positive, got {}",
            count
        )));
    }
    if count > MAX_READ_SIZE {
        return Err(Error::InvalidArgument(format!(
            "count should be less than {}, got {}",
            MAX_READ_SIZE, count
        )));
    }
    Ok(())
}

/// Reject event numbers below `-1`.
pub fn validate_event_number(event_number: i64) -> Result<()> {
    if event_number < StreamPosition::END {
        return Err(Error::InvalidArgument(format!(
            "event number must be >= -1, got {}",
            event_number
        )));
    }
    Ok(())
}
