//! Crate & protocol level errors.
//!
//! Every public operation either resolves with a typed result or fails with
//! one [`Error`]. The variants fall into three groups:
//!
//! ## Client-side validation
//!
//! - [`Error::InvalidArgument`]: malformed input caught before any network round trip
//! - [`Error::InvalidOperation`]: misuse of the API, e.g. calling into a closed connection
//!
//! ## Terminal server answers
//!
//! - [`Error::WrongExpectedVersion`], [`Error::StreamDeleted`], [`Error::AccessDenied`],
//!   [`Error::NotAuthenticated`] and the persistent-subscription errors.
//!   These are never retried.
//!
//! ## Dispatcher and transport failures
//!
//! - [`Error::OperationTimedOut`], [`Error::RetryLimitExceeded`],
//!   [`Error::ConnectionClosed`], [`Error::CannotEstablishConnection`] and the
//!   low-level I/O and parsing errors raised while talking to a node.

use std::time::Duration;
use std::{io, result};

use bytes::Bytes;
use thiserror::Error as ThisError;

use crate::types::ExpectedVersion;

pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced by the client driver.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// Input rejected before it reached the network.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Optimistic concurrency check failed on the server.
    #[error("Wrong expected version {expected} for stream '{stream}'")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedVersion,
    },

    /// Target stream (or its metadata stream) was hard-deleted.
    #[error("Stream '{0}' is deleted")]
    StreamDeleted(String),

    /// The server refused the operation for the supplied credentials.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The server could not authenticate the supplied credentials.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// The API was used in a state that does not allow the call.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// No definitive server answer before the operation timeout elapsed.
    #[error("Operation {operation} timed out after {elapsed:?}")]
    OperationTimedOut {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The operation was retried as many times as the settings allow.
    #[error("Retry limit reached for operation {operation} after {retries} retries")]
    RetryLimitExceeded {
        operation: &'static str,
        retries: u32,
    },

    /// Too many consumers are already connected to a persistent subscription group.
    #[error("Maximum subscribers reached for group '{group}' on stream '{stream}'")]
    MaximumSubscribersReached { stream: String, group: String },

    /// The persistent subscription group does not exist.
    #[error("Persistent subscription group '{group}' on stream '{stream}' does not exist")]
    PersistentSubscriptionNotFound { stream: String, group: String },

    /// The persistent subscription group already exists.
    #[error("Persistent subscription group '{group}' on stream '{stream}' already exists")]
    PersistentSubscriptionExists { stream: String, group: String },

    /// Endpoint discovery ran out of attempts.
    #[error("Cannot establish connection: {0}")]
    CannotEstablishConnection(String),

    /// The connection was closed while the operation was pending.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Too many operations are queued on the connection.
    #[error("Operation queue is full ({0} operations)")]
    OperationQueueFull(usize),

    /// The server reported an internal failure or rejected the request.
    #[error("Server error: {0}")]
    ServerError(String),

    /// The server answered with a command the operation does not understand.
    #[error("Unexpected command: expected {expected}, got {actual}")]
    UnexpectedCommand {
        expected: &'static str,
        actual: String,
    },

    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    ParsingError(Bytes),

    /// Missing data or connection closed mid-frame.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A subscription handler returned an error or panicked.
    #[error("Subscription handler failed: {0}")]
    HandlerFailed(String),
}

impl Error {
    /// Whether the failure came from the transport rather than from a
    /// definitive server answer.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::IoError(_) | Error::MissingData(_) | Error::OperationTimedOut { .. }
        )
    }

    /// Short label used in log fields.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::WrongExpectedVersion { .. } => "wrong_expected_version",
            Error::StreamDeleted(_) => "stream_deleted",
            Error::AccessDenied(_) => "access_denied",
            Error::NotAuthenticated(_) => "not_authenticated",
            Error::InvalidOperation(_) => "invalid_operation",
            Error::OperationTimedOut { .. } => "operation_timed_out",
            Error::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            Error::MaximumSubscribersReached { .. } => "maximum_subscribers_reached",
            Error::PersistentSubscriptionNotFound { .. } => "persistent_subscription_not_found",
            Error::PersistentSubscriptionExists { .. } => "persistent_subscription_exists",
            Error::CannotEstablishConnection(_) => "cannot_establish_connection",
            Error::ConnectionClosed(_) => "connection_closed",
            Error::OperationQueueFull(_) => "operation_queue_full",
            Error::ServerError(_) => "server_error",
            Error::UnexpectedCommand { .. } => "unexpected_command",
            Error::IoError(_) => "io",
            Error::ParsingError(_) => "parsing",
            Error::MissingData(_) => "missing_data",
            Error::Config(_) => "config",
            Error::HandlerFailed(_) => "handler_failed",
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use Error::*;
        match (self, other) {
            (InvalidArgument(a), InvalidArgument(b)) => a == b,
            (
                WrongExpectedVersion {
                    stream: s1,
                    expected: e1,
                },
                WrongExpectedVersion {
                    stream: s2,
                    expected: e2,
                },
            ) => s1 == s2 && e1 == e2,
            (StreamDeleted(a), StreamDeleted(b)) => a == b,
            (AccessDenied(a), AccessDenied(b)) => a == b,
            (NotAuthenticated(a), NotAuthenticated(b)) => a == b,
            (InvalidOperation(a), InvalidOperation(b)) => a == b,
            (OperationTimedOut { operation: a, .. }, OperationTimedOut { operation: b, .. }) => {
                a == b
            }
            (
                RetryLimitExceeded {
                    operation: a,
                    retries: r1,
                },
                RetryLimitExceeded {
                    operation: b,
                    retries: r2,
                },
            ) => a == b && r1 == r2,
            (
                MaximumSubscribersReached {
                    stream: s1,
                    group: g1,
                },
                MaximumSubscribersReached {
                    stream: s2,
                    group: g2,
                },
            )
            | (
                PersistentSubscriptionNotFound {
                    stream: s1,
                    group: g1,
                },
                PersistentSubscriptionNotFound {
                    stream: s2,
                    group: g2,
                },
            )
            | (
                PersistentSubscriptionExists {
                    stream: s1,
                    group: g1,
                },
                PersistentSubscriptionExists {
                    stream: s2,
                    group: g2,
                },
            ) => s1 == s2 && g1 == g2,
            (CannotEstablishConnection(a), CannotEstablishConnection(b)) => a == b,
            (ConnectionClosed(a), ConnectionClosed(b)) => a == b,
            (OperationQueueFull(a), OperationQueueFull(b)) => a == b,
            (ServerError(a), ServerError(b)) => a == b,
            (
                UnexpectedCommand {
                    expected: e1,
                    actual: a1,
                },
                UnexpectedCommand {
                    expected: e2,
                    actual: a2,
                },
            ) => e1 == e2 && a1 == a2,
            (IoError(a), IoError(b)) => a == b,
            (ParsingError(a), ParsingError(b)) => a == b,
            (MissingData(a), MissingData(b)) => a == b,
            (Config(a), Config(b)) => a == b,
            (HandlerFailed(a), HandlerFailed(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MissingData(format!("invalid gossip payload: {}", e))
    }
}
