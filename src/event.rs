//! Events and read/write results.
//!
//! [`EventData`] is the write-side payload. Its [`EventId`] is generated once,
//! when the value is constructed, so a retried append re-sends exactly the same
//! identities and the server can deduplicate it.
//!
//! [`RecordedEvent`] and [`ResolvedEvent`] are the server-assigned view
//! returned by reads and pushed by subscriptions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use uuid::Uuid;

use crate::types::Position;

/// 16-byte identity used by the server for idempotent appends.
pub type EventId = Uuid;

/// Event type of link events pointing at another event.
pub const LINK_EVENT_TYPE: &str = "$>";

/// Write-side payload. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    event_id: EventId,
    event_type: String,
    is_json: bool,
    data: Bytes,
    metadata: Bytes,
}

impl EventData {
    /// Binary event with a freshly generated id.
    pub fn binary(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: false,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    /// JSON event with a freshly generated id.
    pub fn json(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            is_json: true,
            ..Self::binary(event_type, data)
        }
    }

    /// Replace the generated id with a caller-supplied one.
    pub fn with_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_json(&self) -> bool {
        self.is_json
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub event_id: EventId,
    /// Monotonic per stream, 0-based.
    pub event_number: i64,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub is_json: bool,
    /// Milliseconds since the Unix epoch.
    pub created_epoch_ms: i64,
}

impl RecordedEvent {
    pub fn created(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_epoch_ms.max(0) as u64)
    }

    pub fn is_link(&self) -> bool {
        self.event_type == LINK_EVENT_TYPE
    }
}

/// A recorded event together with the link that pointed at it, if any.
///
/// A link whose target could not be fetched keeps `event` empty while `link`
/// is populated. That is an observable state, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub event: Option<RecordedEvent>,
    pub link: Option<RecordedEvent>,
    /// Position in the global log, present for `$all` reads and subscriptions.
    pub original_position: Option<Position>,
}

impl ResolvedEvent {
    /// The event that was read or pushed: the link when there is one.
    pub fn original_event(&self) -> Option<&RecordedEvent> {
        self.link.as_ref().or(self.event.as_ref())
    }

    /// True only when a link was present and its target was resolved.
    pub fn is_resolved(&self) -> bool {
        self.link.is_some() && self.event.is_some()
    }

    pub fn original_stream_id(&self) -> Option<&str> {
        self.original_event().map(|e| e.stream_id.as_str())
    }

    pub fn original_event_number(&self) -> Option<i64> {
        self.original_event().map(|e| e.event_number)
    }

    /// Id of the original event; persistent subscriptions ack by this id.
    pub fn original_event_id(&self) -> Option<EventId> {
        self.original_event().map(|e| e.event_id)
    }
}

/// Outcome of a successful append or transaction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Expected version to use for the next append; `-1` when nothing was written
    /// to a stream that does not exist.
    pub next_expected_version: i64,
    pub log_position: Position,
}

/// Outcome of a successful delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub log_position: Position,
}

/// Direction of a paginated read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// Status of a stream slice read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// Status of a single event read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

/// Result of reading a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReadResult {
    pub status: EventReadStatus,
    pub stream: String,
    pub event_number: i64,
    pub event: Option<ResolvedEvent>,
}

/// A bounded page of events from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventsSlice {
    pub status: SliceReadStatus,
    pub stream: String,
    pub from_event_number: i64,
    pub direction: ReadDirection,
    pub events: Vec<ResolvedEvent>,
    /// Cursor for the next page in the same direction.
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

/// A bounded page of events from the global log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllEventsSlice {
    pub direction: ReadDirection,
    pub from_position: Position,
    /// Cursor for the next page in the same direction.
    pub next_position: Position,
    pub events: Vec<ResolvedEvent>,
    pub is_end_of_stream: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(stream: &str, number: i64, event_type: &str) -> RecordedEvent {
        RecordedEvent {
            stream_id: stream.to_string(),
            event_id: Uuid::new_v4(),
            event_number: number,
            event_type: event_type.to_string(),
            data: Bytes::from_static(b"{}"),
            metadata: Bytes::new(),
            is_json: true,
            created_epoch_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_event_data_id_is_stable() {
        let event = EventData::json("OrderPlaced", "{}");
        let cloned = event.clone();
        assert_eq!(event.event_id(), cloned.event_id());
        assert!(event.is_json());
        assert!(event.metadata().is_empty());
    }

    #[test]
    fn test_event_data_with_id() {
        let id = Uuid::new_v4();
        let event = EventData::binary("Blob", vec![1u8, 2, 3]).with_id(id);
        assert_eq!(event.event_id(), id);
        assert!(!event.is_json());
        assert_eq!(event.data().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_resolved_event_without_link() {
        let resolved = ResolvedEvent {
            event: Some(recorded("s", 3, "Test")),
            link: None,
            original_position: None,
        };
        assert!(!resolved.is_resolved());
        assert_eq!(resolved.original_event_number(), Some(3));
        assert_eq!(resolved.original_stream_id(), Some("s"));
    }

    #[test]
    fn test_resolved_link() {
        let resolved = ResolvedEvent {
            event: Some(recorded("target", 0, "Test")),
            link: Some(recorded("links", 7, LINK_EVENT_TYPE)),
            original_position: None,
        };
        assert!(resolved.is_resolved());
        assert_eq!(resolved.original_event_number(), Some(7));
        assert_eq!(resolved.original_stream_id(), Some("links"));
    }

    #[test]
    fn test_unresolved_link_is_observable() {
        let resolved = ResolvedEvent {
            event: None,
            link: Some(recorded("links", 1, LINK_EVENT_TYPE)),
            original_position: None,
        };
        assert!(!resolved.is_resolved());
        assert!(resolved.event.is_none());
        assert!(resolved.original_event().is_some_and(|e| e.is_link()));
    }

    #[test]
    fn test_created_timestamp() {
        let event = recorded("s", 0, "T");
        let since_epoch = event.created().duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(since_epoch.as_millis(), 1_700_000_000_000);
    }
}
