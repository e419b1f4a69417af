//! Persistent subscription group administration.

use uuid::Uuid;

use super::{OperationPolicy, ResponseOutcome};
use crate::error::{Error, Result};
use crate::protocol::messages::{
    self as msg, CreatePersistentSubscriptionCompleted, CreatePersistentSubscriptionResult,
    DeletePersistentSubscriptionCompleted, DeletePersistentSubscriptionResult,
    PersistentSubscriptionDefinition, UpdatePersistentSubscriptionCompleted,
    UpdatePersistentSubscriptionResult,
};
use crate::protocol::{Package, TcpCommand};
use crate::settings::PersistentSubscriptionSettings;

fn group_denied(stream: &str, group: &str) -> Error {
    Error::AccessDenied(format!(
        "write access denied for group '{}' on stream '{}'",
        group, stream
    ))
}

fn group_failed(stream: &str, group: &str, reason: Option<String>) -> Error {
    Error::InvalidOperation(format!(
        "subscription group '{}' on stream '{}' failed: {}",
        group,
        stream,
        reason.unwrap_or_default()
    ))
}

pub(crate) struct CreatePersistentSubscription {
    request: PersistentSubscriptionDefinition,
}

impl CreatePersistentSubscription {
    pub(crate) fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        settings: PersistentSubscriptionSettings,
    ) -> Self {
        CreatePersistentSubscription {
            request: PersistentSubscriptionDefinition {
                command: TcpCommand::CreatePersistentSubscription,
                group_name: group.into(),
                event_stream_id: stream.into(),
                settings,
            },
        }
    }
}

impl OperationPolicy for CreatePersistentSubscription {
    type Response = CreatePersistentSubscriptionCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "CreatePersistentSubscription"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::CreatePersistentSubscriptionCompleted
    }

    fn inspect_response(
        &mut self,
        response: CreatePersistentSubscriptionCompleted,
    ) -> ResponseOutcome<()> {
        let stream = &self.request.event_stream_id;
        let group = &self.request.group_name;
        match response.result {
            CreatePersistentSubscriptionResult::Success => ResponseOutcome::Success(()),
            CreatePersistentSubscriptionResult::AlreadyExists => {
                ResponseOutcome::Failure(Error::PersistentSubscriptionExists {
                    stream: stream.clone(),
                    group: group.clone(),
                })
            }
            CreatePersistentSubscriptionResult::Fail => {
                ResponseOutcome::Failure(group_failed(stream, group, response.reason))
            }
            CreatePersistentSubscriptionResult::AccessDenied => {
                ResponseOutcome::Failure(group_denied(stream, group))
            }
        }
    }
}

pub(crate) struct UpdatePersistentSubscription {
    request: PersistentSubscriptionDefinition,
}

impl UpdatePersistentSubscription {
    pub(crate) fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        settings: PersistentSubscriptionSettings,
    ) -> Self {
        UpdatePersistentSubscription {
            request: PersistentSubscriptionDefinition {
                command: TcpCommand::UpdatePersistentSubscription,
                group_name: group.into(),
                event_stream_id: stream.into(),
                settings,
            },
        }
    }
}

impl OperationPolicy for UpdatePersistentSubscription {
    type Response = UpdatePersistentSubscriptionCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "UpdatePersistentSubscription"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::UpdatePersistentSubscriptionCompleted
    }

    fn inspect_response(
        &mut self,
        response: UpdatePersistentSubscriptionCompleted,
    ) -> ResponseOutcome<()> {
        let stream = &self.request.event_stream_id;
        let group = &self.request.group_name;
        match response.result {
            UpdatePersistentSubscriptionResult::Success => ResponseOutcome::Success(()),
            UpdatePersistentSubscriptionResult::DoesNotExist => {
                ResponseOutcome::Failure(Error::PersistentSubscriptionNotFound {
                    stream: stream.clone(),
                    group: group.clone(),
                })
            }
            UpdatePersistentSubscriptionResult::Fail => {
                ResponseOutcome::Failure(group_failed(stream, group, response.reason))
            }
            UpdatePersistentSubscriptionResult::AccessDenied => {
                ResponseOutcome::Failure(group_denied(stream, group))
            }
        }
    }
}

pub(crate) struct DeletePersistentSubscription {
    request: msg::DeletePersistentSubscription,
}

impl DeletePersistentSubscription {
    pub(crate) fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        DeletePersistentSubscription {
            request: msg::DeletePersistentSubscription {
                group_name: group.into(),
                event_stream_id: stream.into(),
            },
        }
    }
}

impl OperationPolicy for DeletePersistentSubscription {
    type Response = DeletePersistentSubscriptionCompleted;
    type Output = ();

    fn name(&self) -> &'static str {
        "DeletePersistentSubscription"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::DeletePersistentSubscriptionCompleted
    }

    fn inspect_response(
        &mut self,
        response: DeletePersistentSubscriptionCompleted,
    ) -> ResponseOutcome<()> {
        let stream = &self.request.event_stream_id;
        let group = &self.request.group_name;
        match response.result {
            DeletePersistentSubscriptionResult::Success => ResponseOutcome::Success(()),
            DeletePersistentSubscriptionResult::DoesNotExist => {
                ResponseOutcome::Failure(Error::PersistentSubscriptionNotFound {
                    stream: stream.clone(),
                    group: group.clone(),
                })
            }
            DeletePersistentSubscriptionResult::Fail => {
                ResponseOutcome::Failure(group_failed(stream, group, response.reason))
            }
            DeletePersistentSubscriptionResult::AccessDenied => {
                ResponseOutcome::Failure(group_denied(stream, group))
            }
        }
    }
}
