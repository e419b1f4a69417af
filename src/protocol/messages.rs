//! Typed message bodies.
//!
//! Each body implements [`Message`], which ties it to its [`TcpCommand`] and
//! moves it in and out of the raw package payload. Result codes are closed
//! `#[repr(u8)]` enums decoded with `num_traits::FromPrimitive`; an unknown code
//! is a parsing error, never a silent default.

use std::time::Duration;

use bytes::{BufMut, Bytes};
use nom::IResult;
use nom::number::complete::{be_i32, be_i64, be_u8};
use nombytes::NomBytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use uuid::Uuid;

use super::TcpCommand;
use crate::encode::{ToByte, encode_as_array};
use crate::error::{Error, Result};
use crate::event::{EventData, ReadDirection, RecordedEvent, ResolvedEvent};
use crate::parser::{
    parse_array, parse_bool, parse_bytes, parse_complete, parse_nullable_str, parse_str,
    parse_uuid,
};
use crate::settings::{ConsumerStrategy, PersistentSubscriptionSettings};
use crate::types::Position;

/// A package body with a fixed command.
pub trait Message: Sized {
    fn command(&self) -> TcpCommand;

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()>;

    /// `command` disambiguates bodies shared by forward and backward reads.
    fn decode_body(command: TcpCommand, body: Bytes) -> Result<Self>;
}

// =============================================================================
// Result Codes
// =============================================================================

/// Outcome of a write, delete or transaction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum OperationResult {
    Success = 0,
    PrepareTimeout = 1,
    CommitTimeout = 2,
    ForwardTimeout = 3,
    WrongExpectedVersion = 4,
    StreamDeleted = 5,
    InvalidTransaction = 6,
    AccessDenied = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ReadEventResult {
    Success = 0,
    NotFound = 1,
    NoStream = 2,
    StreamDeleted = 3,
    Error = 4,
    AccessDenied = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ReadStreamResult {
    Success = 0,
    NoStream = 1,
    StreamDeleted = 2,
    NotModified = 3,
    Error = 4,
    AccessDenied = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ReadAllResult {
    Success = 0,
    NotModified = 1,
    Error = 2,
    AccessDenied = 3,
}

/// Reason carried by a server-side `SubscriptionDropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SubscriptionDropWireReason {
    Unsubscribed = 0,
    AccessDenied = 1,
    NotFound = 2,
    PersistentSubscriptionDeleted = 3,
    SubscriberMaxCountReached = 4,
}

/// What the server should do with a negatively acknowledged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PersistentSubscriptionNakEventAction {
    Unknown = 0,
    /// Move the event to the parked-messages stream.
    Park = 1,
    /// Redeliver the event with an incremented retry count.
    Retry = 2,
    Skip = 3,
    /// Stop the subscription.
    Stop = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum CreatePersistentSubscriptionResult {
    Success = 0,
    AlreadyExists = 1,
    Fail = 2,
    AccessDenied = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum UpdatePersistentSubscriptionResult {
    Success = 0,
    DoesNotExist = 1,
    Fail = 2,
    AccessDenied = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum DeletePersistentSubscriptionResult {
    Success = 0,
    DoesNotExist = 1,
    Fail = 2,
    AccessDenied = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum NotHandledReason {
    NotReady = 0,
    TooBusy = 1,
    NotLeader = 2,
    IsReadOnly = 3,
}

fn parse_code<T: FromPrimitive>(s: NomBytes) -> IResult<NomBytes, T> {
    let (rest, code) = be_u8(s.clone())?;
    match T::from_u8(code) {
        Some(value) => Ok((rest, value)),
        None => Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Alt,
        ))),
    }
}

// =============================================================================
// Shared Fragments
// =============================================================================

fn encode_opt_i64<W: BufMut>(buffer: &mut W, value: Option<i64>) -> Result<()> {
    value.is_some().encode(buffer)?;
    value.unwrap_or(-1).encode(buffer)
}

fn parse_opt_i64(s: NomBytes) -> IResult<NomBytes, Option<i64>> {
    let (s, present) = parse_bool(s)?;
    let (s, value) = be_i64(s)?;
    Ok((s, present.then_some(value)))
}

fn encode_new_event<W: BufMut>(buffer: &mut W, event: &EventData) -> Result<()> {
    event.event_id().encode(buffer)?;
    event.event_type().encode(buffer)?;
    event.is_json().encode(buffer)?;
    event.data().encode(buffer)?;
    event.metadata().encode(buffer)
}

fn parse_new_event(s: NomBytes) -> IResult<NomBytes, EventData> {
    let (s, event_id) = parse_uuid(s)?;
    let (s, event_type) = parse_str(s)?;
    let (s, is_json) = parse_bool(s)?;
    let (s, data) = parse_bytes(s)?;
    let (s, metadata) = parse_bytes(s)?;
    let event = if is_json {
        EventData::json(event_type, data)
    } else {
        EventData::binary(event_type, data)
    };
    Ok((s, event.with_id(event_id).with_metadata(metadata)))
}

fn encode_recorded<W: BufMut>(buffer: &mut W, event: &RecordedEvent) -> Result<()> {
    event.stream_id.encode(buffer)?;
    event.event_number.encode(buffer)?;
    event.event_id.encode(buffer)?;
    event.event_type.encode(buffer)?;
    event.is_json.encode(buffer)?;
    event.data.encode(buffer)?;
    event.metadata.encode(buffer)?;
    event.created_epoch_ms.encode(buffer)
}

fn parse_recorded(s: NomBytes) -> IResult<NomBytes, RecordedEvent> {
    let (s, stream_id) = parse_str(s)?;
    let (s, event_number) = be_i64(s)?;
    let (s, event_id) = parse_uuid(s)?;
    let (s, event_type) = parse_str(s)?;
    let (s, is_json) = parse_bool(s)?;
    let (s, data) = parse_bytes(s)?;
    let (s, metadata) = parse_bytes(s)?;
    let (s, created_epoch_ms) = be_i64(s)?;
    Ok((
        s,
        RecordedEvent {
            stream_id,
            event_id,
            event_number,
            event_type,
            data,
            metadata,
            is_json,
            created_epoch_ms,
        },
    ))
}

fn encode_opt_recorded<W: BufMut>(buffer: &mut W, event: Option<&RecordedEvent>) -> Result<()> {
    match event {
        Some(event) => {
            true.encode(buffer)?;
            encode_recorded(buffer, event)
        }
        None => false.encode(buffer),
    }
}

fn parse_opt_recorded(s: NomBytes) -> IResult<NomBytes, Option<RecordedEvent>> {
    let (s, present) = parse_bool(s)?;
    if !present {
        return Ok((s, None));
    }
    let (s, event) = parse_recorded(s)?;
    Ok((s, Some(event)))
}

/// Event plus optional link, without a global position.
fn encode_resolved_indexed<W: BufMut>(buffer: &mut W, event: &ResolvedEvent) -> Result<()> {
    encode_opt_recorded(buffer, event.event.as_ref())?;
    encode_opt_recorded(buffer, event.link.as_ref())
}

fn parse_resolved_indexed(s: NomBytes) -> IResult<NomBytes, ResolvedEvent> {
    let (s, event) = parse_opt_recorded(s)?;
    let (s, link) = parse_opt_recorded(s)?;
    Ok((
        s,
        ResolvedEvent {
            event,
            link,
            original_position: None,
        },
    ))
}

/// Event plus optional link and its position in the global log.
fn encode_resolved_positioned<W: BufMut>(buffer: &mut W, event: &ResolvedEvent) -> Result<()> {
    encode_resolved_indexed(buffer, event)?;
    let position = event.original_position.unwrap_or(Position::END);
    position.commit.encode(buffer)?;
    position.prepare.encode(buffer)
}

fn parse_resolved_positioned(s: NomBytes) -> IResult<NomBytes, ResolvedEvent> {
    let (s, mut resolved) = parse_resolved_indexed(s)?;
    let (s, commit) = be_i64(s)?;
    let (s, prepare) = be_i64(s)?;
    resolved.original_position = Some(Position::new(commit, prepare));
    Ok((s, resolved))
}

fn encode_persistent_settings<W: BufMut>(
    buffer: &mut W,
    settings: &PersistentSubscriptionSettings,
) -> Result<()> {
    settings.resolve_link_tos.encode(buffer)?;
    settings.start_from.encode(buffer)?;
    settings.extra_statistics.encode(buffer)?;
    duration_ms(settings.message_timeout).encode(buffer)?;
    settings.max_retry_count.encode(buffer)?;
    settings.live_buffer_size.encode(buffer)?;
    settings.read_batch_size.encode(buffer)?;
    settings.history_buffer_size.encode(buffer)?;
    duration_ms(settings.checkpoint_after).encode(buffer)?;
    settings.min_checkpoint_count.encode(buffer)?;
    settings.max_checkpoint_count.encode(buffer)?;
    settings.max_subscriber_count.encode(buffer)?;
    settings.named_consumer_strategy.as_str().encode(buffer)
}

fn parse_persistent_settings(s: NomBytes) -> IResult<NomBytes, PersistentSubscriptionSettings> {
    let (s, resolve_link_tos) = parse_bool(s)?;
    let (s, start_from) = be_i64(s)?;
    let (s, extra_statistics) = parse_bool(s)?;
    let (s, message_timeout) = be_i32(s)?;
    let (s, max_retry_count) = be_i32(s)?;
    let (s, live_buffer_size) = be_i32(s)?;
    let (s, read_batch_size) = be_i32(s)?;
    let (s, history_buffer_size) = be_i32(s)?;
    let (s, checkpoint_after) = be_i32(s)?;
    let (s, min_checkpoint_count) = be_i32(s)?;
    let (s, max_checkpoint_count) = be_i32(s)?;
    let (s, max_subscriber_count) = be_i32(s)?;
    let (rest, strategy) = parse_str(s.clone())?;
    let named_consumer_strategy = strategy.parse::<ConsumerStrategy>().map_err(|_| {
        nom::Err::Failure(nom::error::Error::new(s, nom::error::ErrorKind::Verify))
    })?;
    Ok((
        rest,
        PersistentSubscriptionSettings {
            resolve_link_tos,
            start_from,
            extra_statistics,
            message_timeout: Duration::from_millis(message_timeout.max(0) as u64),
            max_retry_count,
            live_buffer_size,
            read_batch_size,
            history_buffer_size,
            checkpoint_after: Duration::from_millis(checkpoint_after.max(0) as u64),
            min_checkpoint_count,
            max_checkpoint_count,
            max_subscriber_count,
            named_consumer_strategy,
        },
    ))
}

fn duration_ms(d: Duration) -> i32 {
    i32::try_from(d.as_millis()).unwrap_or(i32::MAX)
}

fn unexpected(command: TcpCommand, expected: &'static str) -> Error {
    Error::UnexpectedCommand {
        expected,
        actual: format!("{:?}", command),
    }
}

// =============================================================================
// Writes, Deletes and Transactions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEvents {
    pub event_stream_id: String,
    pub expected_version: i64,
    pub events: Vec<EventData>,
    pub require_leader: bool,
}

impl Message for WriteEvents {
    fn command(&self) -> TcpCommand {
        TcpCommand::WriteEvents
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.event_stream_id.encode(buffer)?;
        self.expected_version.encode(buffer)?;
        encode_as_array(buffer, &self.events, encode_new_event)?;
        self.require_leader.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, event_stream_id) = parse_str(s)?;
            let (s, expected_version) = be_i64(s)?;
            let (s, events) = parse_array(parse_new_event)(s)?;
            let (s, require_leader) = parse_bool(s)?;
            Ok((
                s,
                WriteEvents {
                    event_stream_id,
                    expected_version,
                    events,
                    require_leader,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEventsCompleted {
    pub result: OperationResult,
    pub message: Option<String>,
    pub first_event_number: i64,
    pub last_event_number: i64,
    pub prepare_position: i64,
    pub commit_position: i64,
    /// Current stream version, reported on `WrongExpectedVersion`.
    pub current_version: i64,
}

impl Message for WriteEventsCompleted {
    fn command(&self) -> TcpCommand {
        TcpCommand::WriteEventsCompleted
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.result as u8).encode(buffer)?;
        self.message.encode(buffer)?;
        self.first_event_number.encode(buffer)?;
        self.last_event_number.encode(buffer)?;
        self.prepare_position.encode(buffer)?;
        self.commit_position.encode(buffer)?;
        self.current_version.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, result) = parse_code(s)?;
            let (s, message) = parse_nullable_str(s)?;
            let (s, first_event_number) = be_i64(s)?;
            let (s, last_event_number) = be_i64(s)?;
            let (s, prepare_position) = be_i64(s)?;
            let (s, commit_position) = be_i64(s)?;
            let (s, current_version) = be_i64(s)?;
            Ok((
                s,
                WriteEventsCompleted {
                    result,
                    message,
                    first_event_number,
                    last_event_number,
                    prepare_position,
                    commit_position,
                    current_version,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStream {
    pub event_stream_id: String,
    pub expected_version: i64,
    pub require_leader: bool,
    pub hard_delete: bool,
}

impl Message for DeleteStream {
    fn command(&self) -> TcpCommand {
        TcpCommand::DeleteStream
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.event_stream_id.encode(buffer)?;
        self.expected_version.encode(buffer)?;
        self.require_leader.encode(buffer)?;
        self.hard_delete.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, event_stream_id) = parse_str(s)?;
            let (s, expected_version) = be_i64(s)?;
            let (s, require_leader) = parse_bool(s)?;
            let (s, hard_delete) = parse_bool(s)?;
            Ok((
                s,
                DeleteStream {
                    event_stream_id,
                    expected_version,
                    require_leader,
                    hard_delete,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStreamCompleted {
    pub result: OperationResult,
    pub message: Option<String>,
    pub prepare_position: i64,
    pub commit_position: i64,
}

impl Message for DeleteStreamCompleted {
    fn command(&self) -> TcpCommand {
        TcpCommand::DeleteStreamCompleted
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.result as u8).encode(buffer)?;
        self.message.encode(buffer)?;
        self.prepare_position.encode(buffer)?;
        self.commit_position.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, result) = parse_code(s)?;
            let (s, message) = parse_nullable_str(s)?;
            let (s, prepare_position) = be_i64(s)?;
            let (s, commit_position) = be_i64(s)?;
            Ok((
                s,
                DeleteStreamCompleted {
                    result,
                    message,
                    prepare_position,
                    commit_position,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStart {
    pub event_stream_id: String,
    pub expected_version: i64,
    pub require_leader: bool,
}

impl Message for TransactionStart {
    fn command(&self) -> TcpCommand {
        TcpCommand::TransactionStart
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.event_stream_id.encode(buffer)?;
        self.expected_version.encode(buffer)?;
        self.require_leader.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, event_stream_id) = parse_str(s)?;
            let (s, expected_version) = be_i64(s)?;
            let (s, require_leader) = parse_bool(s)?;
            Ok((
                s,
                TransactionStart {
                    event_stream_id,
                    expected_version,
                    require_leader,
                },
            ))
        })
    }
}

/// Completion of `TransactionStart` and `TransactionWrite`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCompleted {
    pub command: TcpCommand,
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: Option<String>,
}

impl Message for TransactionCompleted {
    fn command(&self) -> TcpCommand {
        self.command
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.transaction_id.encode(buffer)?;
        (self.result as u8).encode(buffer)?;
        self.message.encode(buffer)
    }

    fn decode_body(command: TcpCommand, body: Bytes) -> Result<Self> {
        if !matches!(
            command,
            TcpCommand::TransactionStartCompleted | TcpCommand::TransactionWriteCompleted
        ) {
            return Err(unexpected(command, "TransactionStartCompleted"));
        }
        parse_complete(body, |s| {
            let (s, transaction_id) = be_i64(s)?;
            let (s, result) = parse_code(s)?;
            let (s, message) = parse_nullable_str(s)?;
            Ok((
                s,
                TransactionCompleted {
                    command,
                    transaction_id,
                    result,
                    message,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionWrite {
    pub transaction_id: i64,
    pub events: Vec<EventData>,
    pub require_leader: bool,
}

impl Message for TransactionWrite {
    fn command(&self) -> TcpCommand {
        TcpCommand::TransactionWrite
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.transaction_id.encode(buffer)?;
        encode_as_array(buffer, &self.events, encode_new_event)?;
        self.require_leader.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, transaction_id) = be_i64(s)?;
            let (s, events) = parse_array(parse_new_event)(s)?;
            let (s, require_leader) = parse_bool(s)?;
            Ok((
                s,
                TransactionWrite {
                    transaction_id,
                    events,
                    require_leader,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCommit {
    pub transaction_id: i64,
    pub require_leader: bool,
}

impl Message for TransactionCommit {
    fn command(&self) -> TcpCommand {
        TcpCommand::TransactionCommit
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.transaction_id.encode(buffer)?;
        self.require_leader.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, transaction_id) = be_i64(s)?;
            let (s, require_leader) = parse_bool(s)?;
            Ok((
                s,
                TransactionCommit {
                    transaction_id,
                    require_leader,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCommitCompleted {
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: Option<String>,
    pub first_event_number: i64,
    pub last_event_number: i64,
    pub prepare_position: i64,
    pub commit_position: i64,
}

impl Message for TransactionCommitCompleted {
    fn command(&self) -> TcpCommand {
        TcpCommand::TransactionCommitCompleted
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.transaction_id.encode(buffer)?;
        (self.result as u8).encode(buffer)?;
        self.message.encode(buffer)?;
        self.first_event_number.encode(buffer)?;
        self.last_event_number.encode(buffer)?;
        self.prepare_position.encode(buffer)?;
        self.commit_position.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, transaction_id) = be_i64(s)?;
            let (s, result) = parse_code(s)?;
            let (s, message) = parse_nullable_str(s)?;
            let (s, first_event_number) = be_i64(s)?;
            let (s, last_event_number) = be_i64(s)?;
            let (s, prepare_position) = be_i64(s)?;
            let (s, commit_position) = be_i64(s)?;
            Ok((
                s,
                TransactionCommitCompleted {
                    transaction_id,
                    result,
                    message,
                    first_event_number,
                    last_event_number,
                    prepare_position,
                    commit_position,
                },
            ))
        })
    }
}

// =============================================================================
// Reads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    pub event_stream_id: String,
    pub event_number: i64,
    pub resolve_link_tos: bool,
    pub require_leader: bool,
}

impl Message for ReadEvent {
    fn command(&self) -> TcpCommand {
        TcpCommand::ReadEvent
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.event_stream_id.encode(buffer)?;
        self.event_number.encode(buffer)?;
        self.resolve_link_tos.encode(buffer)?;
        self.require_leader.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, event_stream_id) = parse_str(s)?;
            let (s, event_number) = be_i64(s)?;
            let (s, resolve_link_tos) = parse_bool(s)?;
            let (s, require_leader) = parse_bool(s)?;
            Ok((
                s,
                ReadEvent {
                    event_stream_id,
                    event_number,
                    resolve_link_tos,
                    require_leader,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEventCompleted {
    pub result: ReadEventResult,
    pub event: Option<ResolvedEvent>,
    pub error: Option<String>,
}

impl Message for ReadEventCompleted {
    fn command(&self) -> TcpCommand {
        TcpCommand::ReadEventCompleted
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.result as u8).encode(buffer)?;
        match &self.event {
            Some(event) => {
                true.encode(buffer)?;
                encode_resolved_indexed(buffer, event)?;
            }
            None => false.encode(buffer)?,
        }
        self.error.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, result) = parse_code(s)?;
            let (s, present) = parse_bool(s)?;
            let (s, event) = if present {
                let (s, event) = parse_resolved_indexed(s)?;
                (s, Some(event))
            } else {
                (s, None)
            };
            let (s, error) = parse_nullable_str(s)?;
            Ok((
                s,
                ReadEventCompleted {
                    result,
                    event,
                    error,
                },
            ))
        })
    }
}

fn read_stream_command(direction: ReadDirection) -> TcpCommand {
    match direction {
        ReadDirection::Forward => TcpCommand::ReadStreamEventsForward,
        ReadDirection::Backward => TcpCommand::ReadStreamEventsBackward,
    }
}

fn read_all_command(direction: ReadDirection) -> TcpCommand {
    match direction {
        ReadDirection::Forward => TcpCommand::ReadAllEventsForward,
        ReadDirection::Backward => TcpCommand::ReadAllEventsBackward,
    }
}

/// Request for a page of one stream; the command carries the direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamEvents {
    pub direction: ReadDirection,
    pub event_stream_id: String,
    pub from_event_number: i64,
    pub max_count: i32,
    pub resolve_link_tos: bool,
    pub require_leader: bool,
}

impl Message for ReadStreamEvents {
    fn command(&self) -> TcpCommand {
        read_stream_command(self.direction)
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.event_stream_id.encode(buffer)?;
        self.from_event_number.encode(buffer)?;
        self.max_count.encode(buffer)?;
        self.resolve_link_tos.encode(buffer)?;
        self.require_leader.encode(buffer)
    }

    fn decode_body(command: TcpCommand, body: Bytes) -> Result<Self> {
        let direction = match command {
            TcpCommand::ReadStreamEventsForward => ReadDirection::Forward,
            TcpCommand::ReadStreamEventsBackward => ReadDirection::Backward,
            other => return Err(unexpected(other, "ReadStreamEvents")),
        };
        parse_complete(body, |s| {
            let (s, event_stream_id) = parse_str(s)?;
            let (s, from_event_number) = be_i64(s)?;
            let (s, max_count) = be_i32(s)?;
            let (s, resolve_link_tos) = parse_bool(s)?;
            let (s, require_leader) = parse_bool(s)?;
            Ok((
                s,
                ReadStreamEvents {
                    direction,
                    event_stream_id,
                    from_event_number,
                    max_count,
                    resolve_link_tos,
                    require_leader,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamEventsCompleted {
    pub direction: ReadDirection,
    pub result: ReadStreamResult,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
    pub last_commit_position: i64,
    pub error: Option<String>,
}

impl Message for ReadStreamEventsCompleted {
    fn command(&self) -> TcpCommand {
        match self.direction {
            ReadDirection::Forward => TcpCommand::ReadStreamEventsForwardCompleted,
            ReadDirection::Backward => TcpCommand::ReadStreamEventsBackwardCompleted,
        }
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.result as u8).encode(buffer)?;
        encode_as_array(buffer, &self.events, encode_resolved_indexed)?;
        self.next_event_number.encode(buffer)?;
        self.last_event_number.encode(buffer)?;
        self.is_end_of_stream.encode(buffer)?;
        self.last_commit_position.encode(buffer)?;
        self.error.encode(buffer)
    }

    fn decode_body(command: TcpCommand, body: Bytes) -> Result<Self> {
        let direction = match command {
            TcpCommand::ReadStreamEventsForwardCompleted => ReadDirection::Forward,
            TcpCommand::ReadStreamEventsBackwardCompleted => ReadDirection::Backward,
            other => return Err(unexpected(other, "ReadStreamEventsCompleted")),
        };
        parse_complete(body, |s| {
            let (s, result) = parse_code(s)?;
            let (s, events) = parse_array(parse_resolved_indexed)(s)?;
            let (s, next_event_number) = be_i64(s)?;
            let (s, last_event_number) = be_i64(s)?;
            let (s, is_end_of_stream) = parse_bool(s)?;
            let (s, last_commit_position) = be_i64(s)?;
            let (s, error) = parse_nullable_str(s)?;
            Ok((
                s,
                ReadStreamEventsCompleted {
                    direction,
                    result,
                    events,
                    next_event_number,
                    last_event_number,
                    is_end_of_stream,
                    last_commit_position,
                    error,
                },
            ))
        })
    }
}

/// Request for a page of the global log; the command carries the direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAllEvents {
    pub direction: ReadDirection,
    pub commit_position: i64,
    pub prepare_position: i64,
    pub max_count: i32,
    pub resolve_link_tos: bool,
    pub require_leader: bool,
}

impl Message for ReadAllEvents {
    fn command(&self) -> TcpCommand {
        read_all_command(self.direction)
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.commit_position.encode(buffer)?;
        self.prepare_position.encode(buffer)?;
        self.max_count.encode(buffer)?;
        self.resolve_link_tos.encode(buffer)?;
        self.require_leader.encode(buffer)
    }

    fn decode_body(command: TcpCommand, body: Bytes) -> Result<Self> {
        let direction = match command {
            TcpCommand::ReadAllEventsForward => ReadDirection::Forward,
            TcpCommand::ReadAllEventsBackward => ReadDirection::Backward,
            other => return Err(unexpected(other, "ReadAllEvents")),
        };
        parse_complete(body, |s| {
            let (s, commit_position) = be_i64(s)?;
            let (s, prepare_position) = be_i64(s)?;
            let (s, max_count) = be_i32(s)?;
            let (s, resolve_link_tos) = parse_bool(s)?;
            let (s, require_leader) = parse_bool(s)?;
            Ok((
                s,
                ReadAllEvents {
                    direction,
                    commit_position,
                    prepare_position,
                    max_count,
                    resolve_link_tos,
                    require_leader,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAllEventsCompleted {
    pub direction: ReadDirection,
    pub commit_position: i64,
    pub prepare_position: i64,
    pub events: Vec<ResolvedEvent>,
    pub next_commit_position: i64,
    pub next_prepare_position: i64,
    pub result: ReadAllResult,
    pub error: Option<String>,
}

impl Message for ReadAllEventsCompleted {
    fn command(&self) -> TcpCommand {
        match self.direction {
            ReadDirection::Forward => TcpCommand::ReadAllEventsForwardCompleted,
            ReadDirection::Backward => TcpCommand::ReadAllEventsBackwardCompleted,
        }
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.commit_position.encode(buffer)?;
        self.prepare_position.encode(buffer)?;
        encode_as_array(buffer, &self.events, encode_resolved_positioned)?;
        self.next_commit_position.encode(buffer)?;
        self.next_prepare_position.encode(buffer)?;
        (self.result as u8).encode(buffer)?;
        self.error.encode(buffer)
    }

    fn decode_body(command: TcpCommand, body: Bytes) -> Result<Self> {
        let direction = match command {
            TcpCommand::ReadAllEventsForwardCompleted => ReadDirection::Forward,
            TcpCommand::ReadAllEventsBackwardCompleted => ReadDirection::Backward,
            other => return Err(unexpected(other, "ReadAllEventsCompleted")),
        };
        parse_complete(body, |s| {
            let (s, commit_position) = be_i64(s)?;
            let (s, prepare_position) = be_i64(s)?;
            let (s, events) = parse_array(parse_resolved_positioned)(s)?;
            let (s, next_commit_position) = be_i64(s)?;
            let (s, next_prepare_position) = be_i64(s)?;
            let (s, result) = parse_code(s)?;
            let (s, error) = parse_nullable_str(s)?;
            Ok((
                s,
                ReadAllEventsCompleted {
                    direction,
                    commit_position,
                    prepare_position,
                    events,
                    next_commit_position,
                    next_prepare_position,
                    result,
                    error,
                },
            ))
        })
    }
}

// =============================================================================
// Volatile Subscriptions
// =============================================================================

/// An empty stream id subscribes to the global log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeToStream {
    pub event_stream_id: String,
    pub resolve_link_tos: bool,
}

impl Message for SubscribeToStream {
    fn command(&self) -> TcpCommand {
        TcpCommand::SubscribeToStream
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.event_stream_id.encode(buffer)?;
        self.resolve_link_tos.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, event_stream_id) = parse_str(s)?;
            let (s, resolve_link_tos) = parse_bool(s)?;
            Ok((
                s,
                SubscribeToStream {
                    event_stream_id,
                    resolve_link_tos,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfirmation {
    pub last_commit_position: i64,
    /// `None` for subscriptions to the global log or a stream with no events.
    pub last_event_number: Option<i64>,
}

impl Message for SubscriptionConfirmation {
    fn command(&self) -> TcpCommand {
        TcpCommand::SubscriptionConfirmation
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.last_commit_position.encode(buffer)?;
        encode_opt_i64(buffer, self.last_event_number)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, last_commit_position) = be_i64(s)?;
            let (s, last_event_number) = parse_opt_i64(s)?;
            Ok((
                s,
                SubscriptionConfirmation {
                    last_commit_position,
                    last_event_number,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventAppeared {
    pub event: ResolvedEvent,
}

impl Message for StreamEventAppeared {
    fn command(&self) -> TcpCommand {
        TcpCommand::StreamEventAppeared
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_resolved_positioned(buffer, &self.event)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, event) = parse_resolved_positioned(s)?;
            Ok((s, StreamEventAppeared { event }))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionDropped {
    pub reason: SubscriptionDropWireReason,
}

impl Message for SubscriptionDropped {
    fn command(&self) -> TcpCommand {
        TcpCommand::SubscriptionDropped
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.reason as u8).encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        // An empty body means a plain unsubscribe.
        if body.is_empty() {
            return Ok(SubscriptionDropped {
                reason: SubscriptionDropWireReason::Unsubscribed,
            });
        }
        parse_complete(body, |s| {
            let (s, reason) = parse_code(s)?;
            Ok((s, SubscriptionDropped { reason }))
        })
    }
}

// =============================================================================
// Persistent Subscriptions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToPersistentSubscription {
    pub subscription_id: String,
    pub event_stream_id: String,
    pub allowed_in_flight_messages: i32,
}

impl Message for ConnectToPersistentSubscription {
    fn command(&self) -> TcpCommand {
        TcpCommand::ConnectToPersistentSubscription
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.subscription_id.encode(buffer)?;
        self.event_stream_id.encode(buffer)?;
        self.allowed_in_flight_messages.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, subscription_id) = parse_str(s)?;
            let (s, event_stream_id) = parse_str(s)?;
            let (s, allowed_in_flight_messages) = be_i32(s)?;
            Ok((
                s,
                ConnectToPersistentSubscription {
                    subscription_id,
                    event_stream_id,
                    allowed_in_flight_messages,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionConfirmation {
    pub last_commit_position: i64,
    pub subscription_id: String,
    pub last_event_number: Option<i64>,
}

impl Message for PersistentSubscriptionConfirmation {
    fn command(&self) -> TcpCommand {
        TcpCommand::PersistentSubscriptionConfirmation
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.last_commit_position.encode(buffer)?;
        self.subscription_id.encode(buffer)?;
        encode_opt_i64(buffer, self.last_event_number)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, last_commit_position) = be_i64(s)?;
            let (s, subscription_id) = parse_str(s)?;
            let (s, last_event_number) = parse_opt_i64(s)?;
            Ok((
                s,
                PersistentSubscriptionConfirmation {
                    last_commit_position,
                    subscription_id,
                    last_event_number,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionStreamEventAppeared {
    pub event: ResolvedEvent,
    pub retry_count: i32,
}

impl Message for PersistentSubscriptionStreamEventAppeared {
    fn command(&self) -> TcpCommand {
        TcpCommand::PersistentSubscriptionStreamEventAppeared
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_resolved_indexed(buffer, &self.event)?;
        self.retry_count.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, event) = parse_resolved_indexed(s)?;
            let (s, retry_count) = be_i32(s)?;
            Ok((
                s,
                PersistentSubscriptionStreamEventAppeared { event, retry_count },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionAckEvents {
    pub subscription_id: String,
    pub processed_event_ids: Vec<Uuid>,
}

impl Message for PersistentSubscriptionAckEvents {
    fn command(&self) -> TcpCommand {
        TcpCommand::PersistentSubscriptionAckEvents
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.subscription_id.encode(buffer)?;
        self.processed_event_ids.as_slice().encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, subscription_id) = parse_str(s)?;
            let (s, processed_event_ids) = parse_array(parse_uuid)(s)?;
            Ok((
                s,
                PersistentSubscriptionAckEvents {
                    subscription_id,
                    processed_event_ids,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionNakEvents {
    pub subscription_id: String,
    pub processed_event_ids: Vec<Uuid>,
    pub message: Option<String>,
    pub action: PersistentSubscriptionNakEventAction,
}

impl Message for PersistentSubscriptionNakEvents {
    fn command(&self) -> TcpCommand {
        TcpCommand::PersistentSubscriptionNakEvents
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.subscription_id.encode(buffer)?;
        self.processed_event_ids.as_slice().encode(buffer)?;
        self.message.encode(buffer)?;
        (self.action as u8).encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, subscription_id) = parse_str(s)?;
            let (s, processed_event_ids) = parse_array(parse_uuid)(s)?;
            let (s, message) = parse_nullable_str(s)?;
            let (s, action) = parse_code(s)?;
            Ok((
                s,
                PersistentSubscriptionNakEvents {
                    subscription_id,
                    processed_event_ids,
                    message,
                    action,
                },
            ))
        })
    }
}

/// Create or update request; the command tells which.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionDefinition {
    pub command: TcpCommand,
    pub group_name: String,
    pub event_stream_id: String,
    pub settings: PersistentSubscriptionSettings,
}

impl Message for PersistentSubscriptionDefinition {
    fn command(&self) -> TcpCommand {
        self.command
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_name.encode(buffer)?;
        self.event_stream_id.encode(buffer)?;
        encode_persistent_settings(buffer, &self.settings)
    }

    fn decode_body(command: TcpCommand, body: Bytes) -> Result<Self> {
        if !matches!(
            command,
            TcpCommand::CreatePersistentSubscription | TcpCommand::UpdatePersistentSubscription
        ) {
            return Err(unexpected(command, "CreatePersistentSubscription"));
        }
        parse_complete(body, |s| {
            let (s, group_name) = parse_str(s)?;
            let (s, event_stream_id) = parse_str(s)?;
            let (s, settings) = parse_persistent_settings(s)?;
            Ok((
                s,
                PersistentSubscriptionDefinition {
                    command,
                    group_name,
                    event_stream_id,
                    settings,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePersistentSubscriptionCompleted {
    pub result: CreatePersistentSubscriptionResult,
    pub reason: Option<String>,
}

impl Message for CreatePersistentSubscriptionCompleted {
    fn command(&self) -> TcpCommand {
        TcpCommand::CreatePersistentSubscriptionCompleted
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.result as u8).encode(buffer)?;
        self.reason.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, result) = parse_code(s)?;
            let (s, reason) = parse_nullable_str(s)?;
            Ok((s, CreatePersistentSubscriptionCompleted { result, reason }))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePersistentSubscriptionCompleted {
    pub result: UpdatePersistentSubscriptionResult,
    pub reason: Option<String>,
}

impl Message for UpdatePersistentSubscriptionCompleted {
    fn command(&self) -> TcpCommand {
        TcpCommand::UpdatePersistentSubscriptionCompleted
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.result as u8).encode(buffer)?;
        self.reason.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, result) = parse_code(s)?;
            let (s, reason) = parse_nullable_str(s)?;
            Ok((s, UpdatePersistentSubscriptionCompleted { result, reason }))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePersistentSubscription {
    pub group_name: String,
    pub event_stream_id: String,
}

impl Message for DeletePersistentSubscription {
    fn command(&self) -> TcpCommand {
        TcpCommand::DeletePersistentSubscription
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_name.encode(buffer)?;
        self.event_stream_id.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, group_name) = parse_str(s)?;
            let (s, event_stream_id) = parse_str(s)?;
            Ok((
                s,
                DeletePersistentSubscription {
                    group_name,
                    event_stream_id,
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePersistentSubscriptionCompleted {
    pub result: DeletePersistentSubscriptionResult,
    pub reason: Option<String>,
}

impl Message for DeletePersistentSubscriptionCompleted {
    fn command(&self) -> TcpCommand {
        TcpCommand::DeletePersistentSubscriptionCompleted
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.result as u8).encode(buffer)?;
        self.reason.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, result) = parse_code(s)?;
            let (s, reason) = parse_nullable_str(s)?;
            Ok((s, DeletePersistentSubscriptionCompleted { result, reason }))
        })
    }
}

// =============================================================================
// Session Control
// =============================================================================

/// Where the current leader can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub external_tcp_address: String,
    pub external_tcp_port: i32,
    pub http_address: String,
    pub http_port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotHandled {
    pub reason: NotHandledReason,
    /// Present when `reason` is `NotLeader`.
    pub leader: Option<LeaderInfo>,
}

impl Message for NotHandled {
    fn command(&self) -> TcpCommand {
        TcpCommand::NotHandled
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (self.reason as u8).encode(buffer)?;
        match &self.leader {
            Some(leader) => {
                true.encode(buffer)?;
                leader.external_tcp_address.encode(buffer)?;
                leader.external_tcp_port.encode(buffer)?;
                leader.http_address.encode(buffer)?;
                leader.http_port.encode(buffer)
            }
            None => false.encode(buffer),
        }
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, reason) = parse_code(s)?;
            let (s, present) = parse_bool(s)?;
            if !present {
                return Ok((
                    s,
                    NotHandled {
                        reason,
                        leader: None,
                    },
                ));
            }
            let (s, external_tcp_address) = parse_str(s)?;
            let (s, external_tcp_port) = be_i32(s)?;
            let (s, http_address) = parse_str(s)?;
            let (s, http_port) = be_i32(s)?;
            Ok((
                s,
                NotHandled {
                    reason,
                    leader: Some(LeaderInfo {
                        external_tcp_address,
                        external_tcp_port,
                        http_address,
                        http_port,
                    }),
                },
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyClient {
    pub version: i32,
    pub connection_name: Option<String>,
}

impl Message for IdentifyClient {
    fn command(&self) -> TcpCommand {
        TcpCommand::IdentifyClient
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.version.encode(buffer)?;
        self.connection_name.encode(buffer)
    }

    fn decode_body(_: TcpCommand, body: Bytes) -> Result<Self> {
        parse_complete(body, |s| {
            let (s, version) = be_i32(s)?;
            let (s, connection_name) = parse_nullable_str(s)?;
            Ok((
                s,
                IdentifyClient {
                    version,
                    connection_name,
                },
            ))
        })
    }
}
