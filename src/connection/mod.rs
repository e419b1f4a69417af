//! The public connection handle.
//!
//! [`EventStoreConnection`] is a cheap, cloneable handle. All state lives in
//! one actor task ([`logic::ConnectionLogic`]) that owns the socket, the
//! heartbeat monitor and both correlation tables. Public calls build an
//! operation, hand it to the actor over a channel and await its completion.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventesque::prelude::*;
//!
//! let settings = ConnectionSettings::builder()
//!     .single_node("127.0.0.1:1113".parse()?)
//!     .build()?;
//! let connection = EventStoreConnection::create(settings)?;
//! connection.connect().await?;
//!
//! let event = EventData::json("OrderPlaced", r#"{"id":1}"#);
//! let result = connection
//!     .append_to_stream("orders-1", ExpectedVersion::NoStream, vec![event])
//!     .await?;
//! ```
//!
//! # States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Init` | created, `connect` not called yet; operations are rejected |
//! | `Connecting` | discovering, opening the socket, authenticating, identifying |
//! | `Connected` | operations flow |
//! | `Reconnecting` | the socket was lost; operations queue until the next connection |
//! | `Closed` | terminal |

mod events;
mod logic;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::discovery::{EndpointDiscoverer, discoverer_for};
use crate::error::{Error, Result};
use crate::event::{
    AllEventsSlice, DeleteResult, EventData, EventReadResult, ReadDirection, StreamEventsSlice,
    WriteResult,
};
use crate::operations::{
    AppendToStream, ClientOperation, CommitTransaction, CreatePersistentSubscription,
    DeletePersistentSubscription, DeleteStream, Operation, OperationPolicy, ReadAllEvents,
    ReadEvent, ReadStreamEvents, StartTransaction, TransactionalWrite,
    UpdatePersistentSubscription,
};
use crate::settings::{
    CatchUpSubscriptionSettings, ConnectionSettings, PersistentSubscriptionSettings,
};
use crate::subscription::{
    CatchUpHandler, CatchUpSubscription, Checkpoint, DropState, PersistentSubscription,
    PersistentSubscriptionHandler, SubscriptionHandler, SubscriptionOperation,
    SubscriptionRequest, VolatileSubscription, spawn_catch_up, start_persistent, start_volatile,
};
use crate::types::{
    ExpectedVersion, Position, UserCredentials, validate_count, validate_event_number,
    validate_stream,
};

pub use events::{ConnectionEvent, ConnectionEventKind, ConnectionEvents, ListenerHandle};

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Init => write!(f, "init"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Requests from handles to the actor.
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    StartOperation(Box<dyn ClientOperation>),
    StartSubscription(Box<dyn SubscriptionOperation>),
    /// Shares the command queue with `StartSubscription` so it never overtakes it.
    Unsubscribe(Uuid),
    Close {
        reason: String,
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    name: String,
    settings: ConnectionSettings,
    commands: mpsc::UnboundedSender<Command>,
    subscription_requests: mpsc::UnboundedSender<SubscriptionRequest>,
    state: watch::Receiver<ConnectionState>,
    events: Arc<ConnectionEvents>,
}

/// Handle to one logical connection.
///
/// Clones share the connection. The actor stops when [`close`] is called or
/// the last handle is dropped.
///
/// [`close`]: EventStoreConnection::close
#[derive(Clone)]
pub struct EventStoreConnection {
    shared: Arc<Shared>,
    credentials: Option<UserCredentials>,
}

impl std::fmt::Debug for EventStoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStoreConnection")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl EventStoreConnection {
    /// Validate `settings` and start the connection actor. Must be called
    /// inside a tokio runtime. The connection is not opened until [`connect`].
    ///
    /// [`connect`]: EventStoreConnection::connect
    pub fn create(settings: ConnectionSettings) -> Result<Self> {
        let discoverer: Arc<dyn EndpointDiscoverer> =
            Arc::from(discoverer_for(&settings.target)?);
        Self::create_with_discoverer(settings, discoverer)
    }

    /// Like [`create`](Self::create) with a custom node discoverer.
    pub fn create_with_discoverer(
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndpointDiscoverer>,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;

        let name = settings
            .connection_name
            .clone()
            .unwrap_or_else(|| format!("ES-{}", uuid::Uuid::new_v4()));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (subscription_requests, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Init);
        let events = Arc::new(ConnectionEvents::default());

        let logic = logic::ConnectionLogic::new(
            name.clone(),
            settings.clone(),
            discoverer,
            events.clone(),
            state_tx,
        );
        tokio::spawn(logic.run(commands_rx, requests_rx));

        Ok(EventStoreConnection {
            shared: Arc::new(Shared {
                name,
                settings,
                commands,
                subscription_requests,
                state,
                events,
            }),
            credentials: None,
        })
    }

    /// A handle that sends `credentials` with every request instead of the
    /// connection defaults.
    pub fn with_credentials(&self, credentials: UserCredentials) -> Self {
        EventStoreConnection {
            shared: self.shared.clone(),
            credentials: Some(credentials),
        }
    }

    pub fn connection_name(&self) -> &str {
        &self.shared.name
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Lifecycle observers of this connection.
    pub fn events(&self) -> &ConnectionEvents {
        &self.shared.events
    }

    /// Open the connection. Resolves once the server identified the client.
    /// A no-op while connecting or connected.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Connect(tx))?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Close the connection; pending operations fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        let command = Command::Close {
            reason: "Connection close requested by client".to_string(),
            done,
        };
        if self.shared.commands.send(command).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append events; retries re-send the same event ids, so a retried
    /// append is idempotent on the server.
    pub async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult> {
        validate_stream(stream)?;
        self.submit(AppendToStream::new(
            stream,
            expected,
            events,
            self.require_leader(),
        ))
        .await
    }

    pub async fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<DeleteResult> {
        validate_stream(stream)?;
        self.submit(DeleteStream::new(
            stream,
            expected,
            hard_delete,
            self.require_leader(),
        ))
        .await
    }

    /// Start a multi-request write to one stream.
    pub async fn start_transaction(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<EventStoreTransaction> {
        validate_stream(stream)?;
        let transaction_id = self
            .submit(StartTransaction::new(stream, expected, self.require_leader()))
            .await?;
        Ok(EventStoreTransaction::new(transaction_id, self.clone()))
    }

    /// Resume a transaction started elsewhere. Does not contact the server.
    pub fn continue_transaction(&self, transaction_id: i64) -> EventStoreTransaction {
        EventStoreTransaction::new(transaction_id, self.clone())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn read_event(
        &self,
        stream: &str,
        event_number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult> {
        validate_stream(stream)?;
        validate_event_number(event_number)?;
        self.submit(ReadEvent::new(
            stream,
            event_number,
            resolve_link_tos,
            self.require_leader(),
        ))
        .await
    }

    pub async fn read_stream_events_forward(
        &self,
        stream: &str,
        start: i64,
        count: i32,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice> {
        validate_stream(stream)?;
        validate_count(count)?;
        if start < 0 {
            return Err(Error::InvalidArgument(format!(
                "start must be >= 0 for forward reads, got {}",
                start
            )));
        }
        self.submit(ReadStreamEvents::new(
            ReadDirection::Forward,
            stream,
            start,
            count,
            resolve_link_tos,
            self.require_leader(),
        ))
        .await
    }

    /// `start` may be [`StreamPosition::END`](crate::types::StreamPosition::END).
    pub async fn read_stream_events_backward(
        &self,
        stream: &str,
        start: i64,
        count: i32,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice> {
        validate_stream(stream)?;
        validate_count(count)?;
        validate_event_number(start)?;
        self.submit(ReadStreamEvents::new(
            ReadDirection::Backward,
            stream,
            start,
            count,
            resolve_link_tos,
            self.require_leader(),
        ))
        .await
    }

    pub async fn read_all_events_forward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice> {
        validate_count(max_count)?;
        self.submit(ReadAllEvents::new(
            ReadDirection::Forward,
            position,
            max_count,
            resolve_link_tos,
            self.require_leader(),
        ))
        .await
    }

    pub async fn read_all_events_backward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice> {
        validate_count(max_count)?;
        self.submit(ReadAllEvents::new(
            ReadDirection::Backward,
            position,
            max_count,
            resolve_link_tos,
            self.require_leader(),
        ))
        .await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Live events of `stream` from now on. Resolves once the server confirmed.
    pub async fn subscribe_to_stream<H: SubscriptionHandler>(
        &self,
        stream: &str,
        resolve_link_tos: bool,
        handler: H,
    ) -> Result<VolatileSubscription> {
        validate_stream(stream)?;
        self.volatile(stream.to_string(), resolve_link_tos, handler)
            .await
    }

    /// Live events of every stream from now on.
    pub async fn subscribe_to_all<H: SubscriptionHandler>(
        &self,
        resolve_link_tos: bool,
        handler: H,
    ) -> Result<VolatileSubscription> {
        self.volatile(String::new(), resolve_link_tos, handler).await
    }

    /// Events of `stream` after `last_checkpoint` (from the start when
    /// `None`), then live events. Returns immediately; failures reach the
    /// handler's `subscription_dropped`.
    pub fn subscribe_to_stream_from<H: CatchUpHandler>(
        &self,
        stream: &str,
        last_checkpoint: Option<i64>,
        settings: CatchUpSubscriptionSettings,
        handler: H,
    ) -> Result<CatchUpSubscription> {
        validate_stream(stream)?;
        settings.validate()?;
        if let Some(checkpoint) = last_checkpoint {
            validate_event_number(checkpoint)?;
        }
        Ok(spawn_catch_up(
            self.clone(),
            stream.to_string(),
            Checkpoint::Stream(last_checkpoint),
            settings,
            handler,
        ))
    }

    /// Events of `$all` after `last_checkpoint`, then live events.
    pub fn subscribe_to_all_from<H: CatchUpHandler>(
        &self,
        last_checkpoint: Option<Position>,
        settings: CatchUpSubscriptionSettings,
        handler: H,
    ) -> Result<CatchUpSubscription> {
        settings.validate()?;
        Ok(spawn_catch_up(
            self.clone(),
            String::new(),
            Checkpoint::All(last_checkpoint),
            settings,
            handler,
        ))
    }

    /// Join the consumer group `group` on `stream`.
    pub async fn connect_to_persistent_subscription<H: PersistentSubscriptionHandler>(
        &self,
        stream: &str,
        group: &str,
        handler: H,
        buffer_size: usize,
        auto_ack: bool,
    ) -> Result<PersistentSubscription> {
        validate_stream(stream)?;
        if group.is_empty() {
            return Err(Error::InvalidArgument("group must not be empty".to_string()));
        }
        let buffer_size = i32::try_from(buffer_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "buffer_size must be between 1 and {}, got {}",
                    i32::MAX,
                    buffer_size
                ))
            })?;

        let (operation, subscription, confirmed) = start_persistent(
            stream.to_string(),
            group.to_string(),
            buffer_size,
            auto_ack,
            self.effective_credentials(),
            self.require_leader(),
            self.shared.subscription_requests.clone(),
            handler,
        );
        self.send_command(Command::StartSubscription(Box::new(operation)))?;
        let pending = PendingConfirmation::new(
            &self.shared.commands,
            subscription.correlation_id(),
            subscription.drop_state(),
        );
        let confirmed = confirmed.await;
        pending.settle();
        confirmed.map_err(|_| self.gone())??;
        Ok(subscription)
    }

    pub async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> Result<()> {
        validate_stream(stream)?;
        settings.validate()?;
        self.submit(CreatePersistentSubscription::new(stream, group, settings))
            .await
    }

    pub async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> Result<()> {
        validate_stream(stream)?;
        settings.validate()?;
        self.submit(UpdatePersistentSubscription::new(stream, group, settings))
            .await
    }

    pub async fn delete_persistent_subscription(&self, stream: &str, group: &str) -> Result<()> {
        validate_stream(stream)?;
        self.submit(DeletePersistentSubscription::new(stream, group))
            .await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    async fn volatile<H: SubscriptionHandler>(
        &self,
        stream: String,
        resolve_link_tos: bool,
        handler: H,
    ) -> Result<VolatileSubscription> {
        let (operation, subscription, confirmed) = start_volatile(
            stream,
            resolve_link_tos,
            self.effective_credentials(),
            self.require_leader(),
            self.shared.subscription_requests.clone(),
            handler,
        );
        self.send_command(Command::StartSubscription(Box::new(operation)))?;
        let pending = PendingConfirmation::new(
            &self.shared.commands,
            subscription.correlation_id(),
            subscription.drop_state(),
        );
        let confirmed = confirmed.await;
        pending.settle();
        confirmed.map_err(|_| self.gone())??;
        Ok(subscription)
    }

    async fn submit<P: OperationPolicy>(&self, policy: P) -> Result<P::Output> {
        let (operation, completion) =
            Operation::new(policy, self.effective_credentials(), self.require_leader());
        self.send_command(Command::StartOperation(Box::new(operation)))?;
        completion.await.map_err(|_| self.gone())?
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.shared.commands.send(command).map_err(|_| {
            Error::InvalidOperation(format!("connection '{}' is closed", self.shared.name))
        })
    }

    fn gone(&self) -> Error {
        Error::ConnectionClosed(format!("connection '{}' was closed", self.shared.name))
    }

    fn effective_credentials(&self) -> Option<UserCredentials> {
        self.credentials
            .clone()
            .or_else(|| self.shared.settings.default_user_credentials.clone())
    }

    fn require_leader(&self) -> bool {
        self.shared.settings.require_leader
    }
}

/// Unsubscribes a subscription whose caller stopped waiting for the server's
/// confirmation, so the server does not keep feeding a handle nobody holds.
struct PendingConfirmation<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
    correlation_id: Uuid,
    state: &'a DropState,
    settled: bool,
}

impl<'a> PendingConfirmation<'a> {
    fn new(
        commands: &'a mpsc::UnboundedSender<Command>,
        correlation_id: Uuid,
        state: &'a DropState,
    ) -> Self {
        PendingConfirmation {
            commands,
            correlation_id,
            state,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingConfirmation<'_> {
    fn drop(&mut self) {
        if self.settled || self.state.is_dropped() || !self.state.request_unsubscribe() {
            return;
        }
        debug!(correlation_id = %self.correlation_id, "Subscribe abandoned, unsubscribing");
        let _ = self.commands.send(Command::Unsubscribe(self.correlation_id));
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// A transaction opened with [`EventStoreConnection::start_transaction`].
///
/// Rollback only forgets the transaction on the client; the server discards
/// uncommitted transactions on its own.
#[derive(Debug)]
pub struct EventStoreTransaction {
    transaction_id: i64,
    connection: EventStoreConnection,
    finished: AtomicBool,
}

impl EventStoreTransaction {
    fn new(transaction_id: i64, connection: EventStoreConnection) -> Self {
        EventStoreTransaction {
            transaction_id,
            connection,
            finished: AtomicBool::new(false),
        }
    }

    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    pub async fn write(&self, events: Vec<EventData>) -> Result<()> {
        self.ensure_open()?;
        self.connection
            .submit(TransactionalWrite::new(
                self.transaction_id,
                events,
                self.connection.require_leader(),
            ))
            .await
    }

    pub async fn commit(&self) -> Result<WriteResult> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(self.finished_error());
        }
        self.connection
            .submit(CommitTransaction::new(
                self.transaction_id,
                self.connection.require_leader(),
            ))
            .await
    }

    pub fn rollback(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(self.finished_error());
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(self.finished_error());
        }
        Ok(())
    }

    fn finished_error(&self) -> Error {
        Error::InvalidOperation(format!(
            "transaction {} is already committed or rolled back",
            self.transaction_id
        ))
    }
}
