//! Writes: appends, deletes and the three transaction steps.

use uuid::Uuid;

use super::{OperationPolicy, ResponseOutcome};
use crate::error::{Error, Result};
use crate::event::{DeleteResult, EventData, WriteResult};
use crate::protocol::messages::{
    DeleteStreamCompleted, OperationResult, TransactionCommit, TransactionCommitCompleted,
    TransactionCompleted, TransactionStart, TransactionWrite, WriteEvents, WriteEventsCompleted,
};
use crate::protocol::{Package, TcpCommand};
use crate::types::{ExpectedVersion, Position};

/// Map the non-success write results shared by every write command.
fn write_failure<T>(
    result: OperationResult,
    stream: &str,
    expected: ExpectedVersion,
    message: Option<String>,
) -> ResponseOutcome<T> {
    match result {
        OperationResult::Success => {
            ResponseOutcome::Failure(Error::ServerError("unhandled success result".to_string()))
        }
        OperationResult::PrepareTimeout
        | OperationResult::CommitTimeout
        | OperationResult::ForwardTimeout => ResponseOutcome::Retry(format!("{:?}", result)),
        OperationResult::WrongExpectedVersion => {
            ResponseOutcome::Failure(Error::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
            })
        }
        OperationResult::StreamDeleted => {
            ResponseOutcome::Failure(Error::StreamDeleted(stream.to_string()))
        }
        OperationResult::InvalidTransaction => ResponseOutcome::Failure(Error::InvalidOperation(
            message.unwrap_or_else(|| "invalid transaction".to_string()),
        )),
        OperationResult::AccessDenied => ResponseOutcome::Failure(Error::AccessDenied(format!(
            "write access denied for stream '{}'",
            stream
        ))),
    }
}

// =============================================================================
// Append
// =============================================================================

/// Append events to a stream.
///
/// The request is built once; every retry re-sends the same event ids so the
/// server can deduplicate a write whose first answer was lost.
pub(crate) struct AppendToStream {
    request: WriteEvents,
    expected: ExpectedVersion,
}

impl AppendToStream {
    pub(crate) fn new(
        stream: impl Into<String>,
        expected: ExpectedVersion,
        events: Vec<EventData>,
        require_leader: bool,
    ) -> Self {
        AppendToStream {
            request: WriteEvents {
                event_stream_id: stream.into(),
                expected_version: expected.to_wire(),
                events,
                require_leader,
            },
            expected,
        }
    }
}

impl OperationPolicy for AppendToStream {
    type Response = WriteEventsCompleted;
    type Output = WriteResult;

    fn name(&self) -> &'static str {
        "AppendToStream"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::WriteEventsCompleted
    }

    fn inspect_response(&mut self, response: WriteEventsCompleted) -> ResponseOutcome<WriteResult> {
        match response.result {
            OperationResult::Success => ResponseOutcome::Success(WriteResult {
                next_expected_version: response.last_event_number,
                log_position: Position::new(response.commit_position, response.prepare_position),
            }),
            other => write_failure(
                other,
                &self.request.event_stream_id,
                self.expected,
                response.message,
            ),
        }
    }
}

// =============================================================================
// Delete
// =============================================================================

pub(crate) struct DeleteStream {
    request: crate::protocol::messages::DeleteStream,
    expected: ExpectedVersion,
}

impl DeleteStream {
    pub(crate) fn new(
        stream: impl Into<String>,
        expected: ExpectedVersion,
        hard_delete: bool,
        require_leader: bool,
    ) -> Self {
        DeleteStream {
            request: crate::protocol::messages::DeleteStream {
                event_stream_id: stream.into(),
                expected_version: expected.to_wire(),
                require_leader,
                hard_delete,
            },
            expected,
        }
    }
}

impl OperationPolicy for DeleteStream {
    type Response = DeleteStreamCompleted;
    type Output = DeleteResult;

    fn name(&self) -> &'static str {
        "DeleteStream"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::DeleteStreamCompleted
    }

    fn inspect_response(
        &mut self,
        response: DeleteStreamCompleted,
    ) -> ResponseOutcome<DeleteResult> {
        match response.result {
            OperationResult::Success => ResponseOutcome::Success(DeleteResult {
                log_position: Position::new(response.commit_position, response.prepare_position),
            }),
            other => write_failure(
                other,
                &self.request.event_stream_id,
                self.expected,
                response.message,
            ),
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Open a transaction; resolves with the server-assigned transaction id.
pub(crate) struct StartTransaction {
    request: TransactionStart,
    expected: ExpectedVersion,
}

impl StartTransaction {
    pub(crate) fn new(
        stream: impl Into<String>,
        expected: ExpectedVersion,
        require_leader: bool,
    ) -> Self {
        StartTransaction {
            request: TransactionStart {
                event_stream_id: stream.into(),
                expected_version: expected.to_wire(),
                require_leader,
            },
            expected,
        }
    }
}

impl OperationPolicy for StartTransaction {
    type Response = TransactionCompleted;
    type Output = i64;

    fn name(&self) -> &'static str {
        "StartTransaction"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::TransactionStartCompleted
    }

    fn inspect_response(&mut self, response: TransactionCompleted) -> ResponseOutcome<i64> {
        match response.result {
            OperationResult::Success => ResponseOutcome::Success(response.transaction_id),
            other => write_failure(
                other,
                &self.request.event_stream_id,
                self.expected,
                response.message,
            ),
        }
    }
}

/// Add events to an open transaction.
pub(crate) struct TransactionalWrite {
    request: TransactionWrite,
}

impl TransactionalWrite {
    pub(crate) fn new(transaction_id: i64, events: Vec<EventData>, require_leader: bool) -> Self {
        TransactionalWrite {
            request: TransactionWrite {
                transaction_id,
                events,
                require_leader,
            },
        }
    }
}

impl OperationPolicy for TransactionalWrite {
    type Response = TransactionCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "TransactionalWrite"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::TransactionWriteCompleted
    }

    fn inspect_response(&mut self, response: TransactionCompleted) -> ResponseOutcome<()> {
        match response.result {
            OperationResult::Success => ResponseOutcome::Success(()),
            other => write_failure(
                other,
                &format!("$transaction-{}", self.request.transaction_id),
                ExpectedVersion::Any,
                response.message,
            ),
        }
    }
}

/// Commit a transaction. A transaction the server no longer knows fails
/// with `InvalidOperation`.
pub(crate) struct CommitTransaction {
    request: TransactionCommit,
}

impl CommitTransaction {
    pub(crate) fn new(transaction_id: i64, require_leader: bool) -> Self {
        CommitTransaction {
            request: TransactionCommit {
                transaction_id,
                require_leader,
            },
        }
    }
}

impl OperationPolicy for CommitTransaction {
    type Response = TransactionCommitCompleted;
    type Output = WriteResult;

    fn name(&self) -> &'static str {
        "CommitTransaction"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::TransactionCommitCompleted
    }

    fn inspect_response(
        &mut self,
        response: TransactionCommitCompleted,
    ) -> ResponseOutcome<WriteResult> {
        match response.result {
            OperationResult::Success => ResponseOutcome::Success(WriteResult {
                next_expected_version: response.last_event_number,
                log_position: Position::new(response.commit_position, response.prepare_position),
            }),
            OperationResult::InvalidTransaction => {
                ResponseOutcome::Failure(Error::InvalidOperation(format!(
                    "transaction {} is no longer known to the server",
                    self.request.transaction_id
                )))
            }
            other => write_failure(
                other,
                &format!("$transaction-{}", self.request.transaction_id),
                ExpectedVersion::Any,
                response.message,
            ),
        }
    }
}
