//! Reads: a single event, a page of one stream, a page of `$all`.

use uuid::Uuid;

use super::{OperationPolicy, ResponseOutcome};
use crate::error::{Error, Result};
use crate::event::{
    AllEventsSlice, EventReadResult, EventReadStatus, ReadDirection, SliceReadStatus,
    StreamEventsSlice,
};
use crate::protocol::messages::{
    self as msg, ReadAllEventsCompleted, ReadAllResult, ReadEventCompleted, ReadEventResult,
    ReadStreamEventsCompleted, ReadStreamResult,
};
use crate::protocol::{Package, TcpCommand};
use crate::types::Position;

fn read_denied(stream: &str) -> Error {
    Error::AccessDenied(format!("read access denied for stream '{}'", stream))
}

fn server_error(error: Option<String>) -> Error {
    Error::ServerError(error.unwrap_or_else(|| "<no message>".to_string()))
}

// =============================================================================
// Single Event
// =============================================================================

pub(crate) struct ReadEvent {
    request: msg::ReadEvent,
}

impl ReadEvent {
    pub(crate) fn new(
        stream: impl Into<String>,
        event_number: i64,
        resolve_link_tos: bool,
        require_leader: bool,
    ) -> Self {
        ReadEvent {
            request: msg::ReadEvent {
                event_stream_id: stream.into(),
                event_number,
                resolve_link_tos,
                require_leader,
            },
        }
    }
}

impl OperationPolicy for ReadEvent {
    type Response = ReadEventCompleted;
    type Output = EventReadResult;

    fn name(&self) -> &'static str {
        "ReadEvent"
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        TcpCommand::ReadEventCompleted
    }

    fn inspect_response(
        &mut self,
        response: ReadEventCompleted,
    ) -> ResponseOutcome<EventReadResult> {
        let status = match response.result {
            ReadEventResult::Success => EventReadStatus::Success,
            ReadEventResult::NotFound => EventReadStatus::NotFound,
            ReadEventResult::NoStream => EventReadStatus::NoStream,
            ReadEventResult::StreamDeleted => EventReadStatus::StreamDeleted,
            ReadEventResult::Error => {
                return ResponseOutcome::Failure(server_error(response.error));
            }
            ReadEventResult::AccessDenied => {
                return ResponseOutcome::Failure(read_denied(&self.request.event_stream_id));
            }
        };
        let event = match status {
            EventReadStatus::Success => response.event,
            _ => None,
        };
        ResponseOutcome::Success(EventReadResult {
            status,
            stream: self.request.event_stream_id.clone(),
            event_number: self.request.event_number,
            event,
        })
    }
}

// =============================================================================
// Stream Pages
// =============================================================================

pub(crate) struct ReadStreamEvents {
    request: msg::ReadStreamEvents,
}

impl ReadStreamEvents {
    pub(crate) fn new(
        direction: ReadDirection,
        stream: impl Into<String>,
        from_event_number: i64,
        max_count: i32,
        resolve_link_tos: bool,
        require_leader: bool,
    ) -> Self {
        ReadStreamEvents {
            request: msg::ReadStreamEvents {
                direction,
                event_stream_id: stream.into(),
                from_event_number,
                max_count,
                resolve_link_tos,
                require_leader,
            },
        }
    }
}

impl OperationPolicy for ReadStreamEvents {
    type Response = ReadStreamEventsCompleted;
    type Output = StreamEventsSlice;

    fn name(&self) -> &'static str {
        match self.request.direction {
            ReadDirection::Forward => "ReadStreamEventsForward",
            ReadDirection::Backward => "ReadStreamEventsBackward",
        }
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        match self.request.direction {
            ReadDirection::Forward => TcpCommand::ReadStreamEventsForwardCompleted,
            ReadDirection::Backward => TcpCommand::ReadStreamEventsBackwardCompleted,
        }
    }

    fn inspect_response(
        &mut self,
        response: ReadStreamEventsCompleted,
    ) -> ResponseOutcome<StreamEventsSlice> {
        let status = match response.result {
            ReadStreamResult::Success | ReadStreamResult::NotModified => SliceReadStatus::Success,
            ReadStreamResult::NoStream => SliceReadStatus::StreamNotFound,
            ReadStreamResult::StreamDeleted => SliceReadStatus::StreamDeleted,
            ReadStreamResult::Error => {
                return ResponseOutcome::Failure(server_error(response.error));
            }
            ReadStreamResult::AccessDenied => {
                return ResponseOutcome::Failure(read_denied(&self.request.event_stream_id));
            }
        };
        let events = match status {
            SliceReadStatus::Success => response.events,
            _ => Vec::new(),
        };
        ResponseOutcome::Success(StreamEventsSlice {
            status,
            stream: self.request.event_stream_id.clone(),
            from_event_number: self.request.from_event_number,
            direction: self.request.direction,
            events,
            next_event_number: response.next_event_number,
            last_event_number: response.last_event_number,
            is_end_of_stream: response.is_end_of_stream,
        })
    }
}

// =============================================================================
// $all Pages
// =============================================================================

pub(crate) struct ReadAllEvents {
    request: msg::ReadAllEvents,
}

impl ReadAllEvents {
    pub(crate) fn new(
        direction: ReadDirection,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
        require_leader: bool,
    ) -> Self {
        ReadAllEvents {
            request: msg::ReadAllEvents {
                direction,
                commit_position: position.commit,
                prepare_position: position.prepare,
                max_count,
                resolve_link_tos,
                require_leader,
            },
        }
    }
}

impl OperationPolicy for ReadAllEvents {
    type Response = ReadAllEventsCompleted;
    type Output = AllEventsSlice;

    fn name(&self) -> &'static str {
        match self.request.direction {
            ReadDirection::Forward => "ReadAllEventsForward",
            ReadDirection::Backward => "ReadAllEventsBackward",
        }
    }

    fn request(&self, correlation_id: Uuid) -> Result<Package> {
        Package::from_message(&self.request, correlation_id)
    }

    fn response_command(&self) -> TcpCommand {
        match self.request.direction {
            ReadDirection::Forward => TcpCommand::ReadAllEventsForwardCompleted,
            ReadDirection::Backward => TcpCommand::ReadAllEventsBackwardCompleted,
        }
    }

    fn inspect_response(
        &mut self,
        response: ReadAllEventsCompleted,
    ) -> ResponseOutcome<AllEventsSlice> {
        match response.result {
            ReadAllResult::Success | ReadAllResult::NotModified => {}
            ReadAllResult::Error => return ResponseOutcome::Failure(server_error(response.error)),
            ReadAllResult::AccessDenied => {
                return ResponseOutcome::Failure(read_denied("$all"));
            }
        }
        // A short page means the reader caught up with the end of the log.
        let max_count = usize::try_from(self.request.max_count).unwrap_or(0);
        let is_end_of_stream = response.events.len() < max_count || response.events.is_empty();
        ResponseOutcome::Success(AllEventsSlice {
            direction: self.request.direction,
            from_position: Position::new(response.commit_position, response.prepare_position),
            next_position: Position::new(
                response.next_commit_position,
                response.next_prepare_position,
            ),
            events: response.events,
            is_end_of_stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::event::{RecordedEvent, ResolvedEvent};
    use crate::operations::{ClientOperation, InspectionDecision, Operation};

    fn resolved(number: i64) -> ResolvedEvent {
        ResolvedEvent {
            event: Some(RecordedEvent {
                stream_id: "orders-1".to_string(),
                event_id: Uuid::new_v4(),
                event_number: number,
                event_type: "OrderPlaced".to_string(),
                data: Bytes::from_static(b"{}"),
                metadata: Bytes::new(),
                is_json: true,
                created_epoch_ms: 0,
            }),
            link: None,
            original_position: None,
        }
    }

    fn stream_reply(direction: ReadDirection, result: ReadStreamResult) -> Package {
        Package::from_message(
            &ReadStreamEventsCompleted {
                direction,
                result,
                events: vec![resolved(0), resolved(1)],
                next_event_number: 2,
                last_event_number: 1,
                is_end_of_stream: true,
                last_commit_position: 10,
                error: None,
            },
            Uuid::new_v4(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_stream_forward() {
        let (mut op, rx) = Operation::new(
            ReadStreamEvents::new(ReadDirection::Forward, "orders-1", 0, 10, false, true),
            None,
            true,
        );
        let package = op.create_network_package(Uuid::new_v4()).unwrap();
        assert_eq!(package.command, TcpCommand::ReadStreamEventsForward);

        let reply = stream_reply(ReadDirection::Forward, ReadStreamResult::Success);
        assert_eq!(
            op.inspect_package(&reply).decision,
            InspectionDecision::EndOperation
        );
        let slice = rx.await.unwrap().unwrap();
        assert_eq!(slice.status, SliceReadStatus::Success);
        assert_eq!(slice.events.len(), 2);
        assert_eq!(slice.next_event_number, 2);
        assert!(slice.is_end_of_stream);
    }

    #[tokio::test]
    async fn test_read_stream_not_found_is_a_status() {
        let (mut op, rx) = Operation::new(
            ReadStreamEvents::new(ReadDirection::Backward, "orders-1", -1, 10, false, true),
            None,
            true,
        );
        let reply = stream_reply(ReadDirection::Backward, ReadStreamResult::NoStream);
        op.inspect_package(&reply);

        let slice = rx.await.unwrap().unwrap();
        assert_eq!(slice.status, SliceReadStatus::StreamNotFound);
        assert!(slice.events.is_empty());
    }

    #[tokio::test]
    async fn test_read_stream_direction_mismatch_is_unexpected() {
        let (mut op, rx) = Operation::new(
            ReadStreamEvents::new(ReadDirection::Forward, "orders-1", 0, 10, false, true),
            None,
            true,
        );
        let reply = stream_reply(ReadDirection::Backward, ReadStreamResult::Success);
        op.inspect_package(&reply);
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::UnexpectedCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_event_access_denied() {
        let (mut op, rx) = Operation::new(ReadEvent::new("secret", 0, false, true), None, true);
        let reply = Package::from_message(
            &ReadEventCompleted {
                result: ReadEventResult::AccessDenied,
                event: None,
                error: None,
            },
            Uuid::new_v4(),
        )
        .unwrap();
        op.inspect_package(&reply);
        assert!(matches!(rx.await.unwrap(), Err(Error::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_read_all_short_page_is_end() {
        let (mut op, rx) = Operation::new(
            ReadAllEvents::new(ReadDirection::Forward, Position::START, 5, false, true),
            None,
            true,
        );
        let reply = Package::from_message(
            &ReadAllEventsCompleted {
                direction: ReadDirection::Forward,
                commit_position: 0,
                prepare_position: 0,
                events: vec![resolved(0)],
                next_commit_position: 200,
                next_prepare_position: 200,
                result: ReadAllResult::Success,
                error: None,
            },
            Uuid::new_v4(),
        )
        .unwrap();
        op.inspect_package(&reply);

        let slice = rx.await.unwrap().unwrap();
        assert!(slice.is_end_of_stream);
        assert_eq!(slice.next_position, Position::new(200, 200));
    }
}
