//! Request/response operations and their dispatcher.
//!
//! Every call that expects exactly one answer from the server (appends,
//! reads, deletes, transactions, persistent subscription administration) is a
//! [`ClientOperation`]. The connection actor hands the operation a fresh
//! correlation id, sends the package it builds, and feeds every package that
//! comes back with the same id into [`ClientOperation::inspect_package`]. The
//! returned [`InspectionDecision`] tells the dispatcher what to do next.
//!
//! # Layout
//!
//! | Module | Operations |
//! |--------|------------|
//! | `write` | `AppendToStream`, `DeleteStream`, `StartTransaction`, `TransactionalWrite`, `CommitTransaction` |
//! | `read` | `ReadEvent`, `ReadStreamEvents`, `ReadAllEvents` |
//! | `persistent` | `CreatePersistentSubscription`, `UpdatePersistentSubscription`, `DeletePersistentSubscription` |
//! | `manager` | [`OperationsManager`], the correlation table |
//!
//! # Shared handling
//!
//! Each concrete operation only knows its own response body. The generic
//! [`Operation`] wrapper answers the commands any request can receive:
//!
//! | Command | Result |
//! |---------|--------|
//! | `NotAuthenticated` | fail with `NotAuthenticated` |
//! | `BadRequest` | fail with `ServerError` |
//! | `NotHandled(NotReady \| TooBusy)` | retry |
//! | `NotHandled(NotLeader \| IsReadOnly)` | reconnect to the advertised leader, else retry |
//! | anything else | fail with `UnexpectedCommand` |

mod manager;
mod persistent;
mod read;
mod write;

use std::net::SocketAddr;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::discovery::NodeEndpoints;
use crate::error::{Error, Result};
use crate::protocol::messages::{Message, NotHandled, NotHandledReason};
use crate::protocol::{Package, TcpCommand};
use crate::types::UserCredentials;

pub(crate) use manager::{OperationItem, OperationsManager};
pub(crate) use persistent::{
    CreatePersistentSubscription, DeletePersistentSubscription, UpdatePersistentSubscription,
};
pub(crate) use read::{ReadAllEvents, ReadEvent, ReadStreamEvents};
pub(crate) use write::{
    AppendToStream, CommitTransaction, DeleteStream, StartTransaction, TransactionalWrite,
};

// =============================================================================
// Dispatcher Contract
// =============================================================================

/// What the dispatcher should do after a package was inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectionDecision {
    /// Keep waiting for more packages.
    DoNothing,
    /// The operation completed (successfully or not); forget it.
    EndOperation,
    /// Re-send with a fresh correlation id.
    Retry,
    /// Drop the current socket and connect to these endpoints.
    Reconnect(NodeEndpoints),
    /// A subscription was confirmed by the server.
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionResult {
    pub decision: InspectionDecision,
    pub description: String,
}

impl InspectionResult {
    pub fn new(decision: InspectionDecision, description: impl Into<String>) -> Self {
        InspectionResult {
            decision,
            description: description.into(),
        }
    }

    pub fn end(description: impl Into<String>) -> Self {
        Self::new(InspectionDecision::EndOperation, description)
    }

    pub fn retry(description: impl Into<String>) -> Self {
        Self::new(InspectionDecision::Retry, description)
    }
}

/// An operation tracked by the dispatcher.
///
/// Implementations complete their caller exactly once: either from
/// `inspect_package` when a definitive answer arrives, or from `fail`.
pub trait ClientOperation: Send {
    fn name(&self) -> &'static str;

    fn create_network_package(&self, correlation_id: Uuid) -> Result<Package>;

    fn inspect_package(&mut self, package: &Package) -> InspectionResult;

    fn fail(&mut self, error: Error);
}

// =============================================================================
// Response Policies
// =============================================================================

/// How one operation interprets its own response body.
pub(crate) enum ResponseOutcome<T> {
    Success(T),
    Failure(Error),
    Retry(String),
}

/// The operation-specific half of a request.
pub(crate) trait OperationPolicy: Send + 'static {
    type Response: Message;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn request(&self, correlation_id: Uuid) -> Result<Package>;

    fn response_command(&self) -> TcpCommand;

    fn inspect_response(&mut self, response: Self::Response) -> ResponseOutcome<Self::Output>;
}

/// Binds an [`OperationPolicy`] to credentials and a completion channel.
pub(crate) struct Operation<P: OperationPolicy> {
    policy: P,
    credentials: Option<UserCredentials>,
    require_leader: bool,
    completion: Option<oneshot::Sender<Result<P::Output>>>,
}

impl<P: OperationPolicy> Operation<P> {
    pub(crate) fn new(
        policy: P,
        credentials: Option<UserCredentials>,
        require_leader: bool,
    ) -> (Self, oneshot::Receiver<Result<P::Output>>) {
        let (tx, rx) = oneshot::channel();
        (
            Operation {
                policy,
                credentials,
                require_leader,
                completion: Some(tx),
            },
            rx,
        )
    }

    fn complete(&mut self, result: Result<P::Output>) {
        if let Some(tx) = self.completion.take() {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        }
    }

    fn failed(&mut self, error: Error) -> InspectionResult {
        let description = error.to_string();
        self.complete(Err(error));
        InspectionResult::end(description)
    }
}

impl<P: OperationPolicy> ClientOperation for Operation<P> {
    fn name(&self) -> &'static str {
        self.policy.name()
    }

    fn create_network_package(&self, correlation_id: Uuid) -> Result<Package> {
        Ok(self
            .policy
            .request(correlation_id)?
            .with_credentials(self.credentials.clone()))
    }

    fn inspect_package(&mut self, package: &Package) -> InspectionResult {
        if package.command == self.policy.response_command() {
            let response = match package.message::<P::Response>() {
                Ok(response) => response,
                Err(e) => return self.failed(e),
            };
            return match self.policy.inspect_response(response) {
                ResponseOutcome::Success(output) => {
                    self.complete(Ok(output));
                    InspectionResult::end("Success")
                }
                ResponseOutcome::Failure(error) => self.failed(error),
                ResponseOutcome::Retry(reason) => InspectionResult::retry(reason),
            };
        }

        match package.command {
            TcpCommand::NotAuthenticated => {
                self.failed(Error::NotAuthenticated(package.data_as_text()))
            }
            TcpCommand::BadRequest => self.failed(Error::ServerError(format!(
                "bad request: {}",
                package.data_as_text()
            ))),
            TcpCommand::NotHandled => match inspect_not_handled(package, self.require_leader) {
                Ok(result) => result,
                Err(e) => self.failed(e),
            },
            other => self.failed(Error::UnexpectedCommand {
                expected: self.policy.response_command().name(),
                actual: format!("{:?}", other),
            }),
        }
    }

    fn fail(&mut self, error: Error) {
        self.complete(Err(error));
    }
}

/// Decide how to react to a `NotHandled` answer.
pub(crate) fn inspect_not_handled(
    package: &Package,
    require_leader: bool,
) -> Result<InspectionResult> {
    let not_handled = package.message::<NotHandled>()?;
    let result = match not_handled.reason {
        NotHandledReason::NotReady => InspectionResult::retry("NotHandled - NotReady"),
        NotHandledReason::TooBusy => InspectionResult::retry("NotHandled - TooBusy"),
        NotHandledReason::NotLeader | NotHandledReason::IsReadOnly => {
            let leader = not_handled.leader.as_ref().and_then(|leader| {
                let port = u16::try_from(leader.external_tcp_port).ok()?;
                format!("{}:{}", leader.external_tcp_address, port)
                    .parse::<SocketAddr>()
                    .ok()
            });
            match leader {
                Some(endpoint) if require_leader => InspectionResult::new(
                    InspectionDecision::Reconnect(NodeEndpoints::new(endpoint)),
                    format!("NotHandled - {:?}, leader at {}", not_handled.reason, endpoint),
                ),
                _ => InspectionResult::retry(format!("NotHandled - {:?}", not_handled.reason)),
            }
        }
    };
    Ok(result)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use uuid::Uuid;

    use crate::error::Result;
    use crate::protocol::Package;
    use crate::transport::PackageSink;

    /// Records sent packages instead of writing them to a socket.
    #[derive(Clone)]
    pub(crate) struct RecordingSink {
        pub(crate) connection_id: Uuid,
        pub(crate) sent: Arc<Mutex<Vec<Package>>>,
    }

    impl RecordingSink {
        pub(crate) fn new() -> Self {
            RecordingSink {
                connection_id: Uuid::new_v4(),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn sent(&self) -> Vec<Package> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn last(&self) -> Package {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl PackageSink for RecordingSink {
        fn connection_id(&self) -> Uuid {
            self.connection_id
        }

        fn send(&self, package: Package) -> Result<()> {
            self.sent.lock().unwrap().push(package);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::LeaderInfo;

    fn not_handled(reason: NotHandledReason, leader: Option<LeaderInfo>) -> Package {
        Package::from_message(&NotHandled { reason, leader }, Uuid::new_v4()).unwrap()
    }

    fn leader_info(port: i32) -> LeaderInfo {
        LeaderInfo {
            external_tcp_address: "10.0.0.7".to_string(),
            external_tcp_port: port,
            http_address: "10.0.0.7".to_string(),
            http_port: 2113,
        }
    }

    #[test]
    fn test_not_ready_and_too_busy_retry() {
        for reason in [NotHandledReason::NotReady, NotHandledReason::TooBusy] {
            let result = inspect_not_handled(&not_handled(reason, None), true).unwrap();
            assert_eq!(result.decision, InspectionDecision::Retry);
        }
    }

    #[test]
    fn test_not_leader_reconnects_when_leader_required() {
        let package = not_handled(NotHandledReason::NotLeader, Some(leader_info(1113)));
        let result = inspect_not_handled(&package, true).unwrap();
        assert_eq!(
            result.decision,
            InspectionDecision::Reconnect(NodeEndpoints::new("10.0.0.7:1113".parse().unwrap()))
        );

        let result = inspect_not_handled(&package, false).unwrap();
        assert_eq!(result.decision, InspectionDecision::Retry);
    }

    #[test]
    fn test_not_leader_without_usable_address_retries() {
        let package = not_handled(NotHandledReason::NotLeader, None);
        assert_eq!(
            inspect_not_handled(&package, true).unwrap().decision,
            InspectionDecision::Retry
        );

        let package = not_handled(NotHandledReason::IsReadOnly, Some(leader_info(-1)));
        assert_eq!(
            inspect_not_handled(&package, true).unwrap().decision,
            InspectionDecision::Retry
        );
    }
}
