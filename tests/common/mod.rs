//! In-process fake event store used by the integration tests.
//!
//! Speaks just enough of the binary protocol to drive the client: the
//! identification handshake, heartbeats, idempotent appends, forward and
//! backward stream reads, forward `$all` reads, volatile subscriptions and
//! persistent subscriptions with ack/nak.
//!
//! Knobs let a test misbehave on purpose:
//!
//! | Knob | Effect |
//! |------|--------|
//! | `swallow_next_write_replies(n)` | commit the next `n` writes but never answer |
//! | `set_silent(true)` | ignore every inbound package, heartbeats included |
//! | `kill_connections()` | drop every open socket |
//! | `hold_subscription_confirmations(true)` | park volatile subscribes until released |

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use eventesque::event::{EventData, ReadDirection, RecordedEvent, ResolvedEvent};
use eventesque::protocol::{
    ConnectToPersistentSubscription, CreatePersistentSubscriptionCompleted,
    CreatePersistentSubscriptionResult, OperationResult, Package,
    PersistentSubscriptionAckEvents, PersistentSubscriptionConfirmation,
    PersistentSubscriptionDefinition, PersistentSubscriptionNakEventAction,
    PersistentSubscriptionNakEvents, PersistentSubscriptionStreamEventAppeared, ReadAllEvents,
    ReadAllEventsCompleted, ReadAllResult, ReadStreamEvents, ReadStreamEventsCompleted,
    ReadStreamResult, SubscribeToStream, SubscriptionConfirmation, SubscriptionDropWireReason,
    SubscriptionDropped, StreamEventAppeared, TcpCommand, UpdatePersistentSubscriptionCompleted,
    UpdatePersistentSubscriptionResult, WriteEvents, WriteEventsCompleted, read_frame,
    write_frame,
};
use eventesque::settings::ConnectionSettings;
use eventesque::types::{Attempts, Position};

type Outbound = mpsc::UnboundedSender<Package>;

struct VolatileSubscriber {
    connection: u64,
    correlation_id: Uuid,
    /// Empty for `$all`.
    stream: String,
    outbound: Outbound,
}

struct PersistentSubscriber {
    connection: u64,
    correlation_id: Uuid,
    stream: String,
    group: String,
    outbound: Outbound,
    /// Retry count per unacknowledged event.
    pending: HashMap<Uuid, i32>,
}

#[derive(Default)]
struct Store {
    hold_confirmations: bool,
    /// Volatile subscribes received but neither confirmed nor registered.
    held: Vec<VolatileSubscriber>,
    unsubscribes: usize,
    streams: HashMap<String, Vec<RecordedEvent>>,
    /// Global log; the index is both commit and prepare position.
    log: Vec<RecordedEvent>,
    groups: HashSet<(String, String)>,
    volatile: Vec<VolatileSubscriber>,
    persistent: Vec<PersistentSubscriber>,
    acked: Vec<Uuid>,
    naks: Vec<(Uuid, PersistentSubscriptionNakEventAction)>,
    /// Deliveries per event id, across retries.
    deliveries: HashMap<Uuid, Vec<i32>>,
    swallow_write_replies: usize,
}

pub struct FakeServer {
    addr: SocketAddr,
    store: Arc<Mutex<Store>>,
    silent: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    kill: watch::Sender<u64>,
    listener_task: tokio::task::JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.listener_task.abort();
        self.kill.send_modify(|generation| *generation += 1);
    }
}

impl FakeServer {
    pub async fn start() -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Mutex::new(Store::default()));
        let silent = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));
        let (kill, _) = watch::channel(0u64);

        let listener_task = {
            let store = store.clone();
            let silent = silent.clone();
            let accepted = accepted.clone();
            let writes = writes.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let connection = accepted.fetch_add(1, Ordering::SeqCst) as u64;
                    let session = Session {
                        connection,
                        store: store.clone(),
                        silent: silent.clone(),
                        writes: writes.clone(),
                    };
                    tokio::spawn(session.run(socket, kill.subscribe()));
                }
            })
        };

        FakeServer {
            addr,
            store,
            silent,
            accepted,
            writes,
            kill,
            listener_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Settings tuned for fast tests against this server.
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings::builder()
            .single_node(self.addr)
            .operation_timeout(Duration::from_millis(400))
            .operation_timeout_check_period(Duration::from_millis(100))
            .fail_on_no_server_response(false)
            .reconnection_delay(Duration::from_millis(100))
            .heartbeat_interval(Duration::from_millis(200))
            .heartbeat_timeout(Duration::from_millis(400))
            .max_reconnections(Attempts::Unlimited)
            .build()
            .unwrap()
    }

    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn writes_received(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn kill_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    pub fn swallow_next_write_replies(&self, count: usize) {
        self.store.lock().unwrap().swallow_write_replies = count;
    }

    pub fn create_group(&self, stream: &str, group: &str) {
        self.store
            .lock()
            .unwrap()
            .groups
            .insert((stream.to_string(), group.to_string()));
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.store
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map_or(0, Vec::len)
    }

    pub fn acked(&self) -> Vec<Uuid> {
        self.store.lock().unwrap().acked.clone()
    }

    pub fn naks(&self) -> Vec<(Uuid, PersistentSubscriptionNakEventAction)> {
        self.store.lock().unwrap().naks.clone()
    }

    pub fn deliveries(&self, event_id: Uuid) -> Vec<i32> {
        self.store
            .lock()
            .unwrap()
            .deliveries
            .get(&event_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn volatile_subscribers(&self) -> usize {
        self.store.lock().unwrap().volatile.len()
    }

    pub fn persistent_subscribers(&self) -> usize {
        self.store.lock().unwrap().persistent.len()
    }

    pub fn unsubscribes_received(&self) -> usize {
        self.store.lock().unwrap().unsubscribes
    }

    pub fn hold_subscription_confirmations(&self, hold: bool) {
        self.store.lock().unwrap().hold_confirmations = hold;
    }

    pub fn held_subscriptions(&self) -> usize {
        self.store.lock().unwrap().held.len()
    }

    /// Confirm and register every held subscribe as of now.
    pub fn release_subscription_confirmations(&self) {
        let mut store = self.store.lock().unwrap();
        store.hold_confirmations = false;
        for subscriber in std::mem::take(&mut store.held) {
            store.confirm(&subscriber);
            store.volatile.push(subscriber);
        }
    }

    /// Append directly, as another client would.
    pub fn append(&self, stream: &str, events: Vec<EventData>) {
        let mut store = self.store.lock().unwrap();
        store.append(stream, events);
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn json_event(event_type: &str, body: &str) -> EventData {
    EventData::json(event_type.to_string(), Bytes::from(body.to_string()))
}

// ============================================================================
// Store
// ============================================================================

impl Store {
    fn append(&mut self, stream: &str, events: Vec<EventData>) -> (i64, i64, i64) {
        let first = self.streams.get(stream).map_or(0, |s| s.len() as i64);
        let mut recorded = Vec::with_capacity(events.len());
        for (offset, data) in events.into_iter().enumerate() {
            let position = self.log.len() as i64;
            let event = RecordedEvent {
                stream_id: stream.to_string(),
                event_id: data.event_id(),
                event_number: first + offset as i64,
                event_type: data.event_type().to_string(),
                data: data.data().clone(),
                metadata: data.metadata().clone(),
                is_json: data.is_json(),
                created_epoch_ms: 0,
            };
            self.log.push(event.clone());
            recorded.push((event, position));
        }
        let stream_events = self.streams.entry(stream.to_string()).or_default();
        for (event, _) in &recorded {
            stream_events.push(event.clone());
        }
        let last = stream_events.len() as i64 - 1;
        let position = recorded.last().map_or(-1, |(_, p)| *p);

        for (event, position) in recorded {
            self.publish(event, position);
        }
        (first, last, position)
    }

    fn publish(&mut self, event: RecordedEvent, position: i64) {
        let resolved = ResolvedEvent {
            event: Some(event.clone()),
            link: None,
            original_position: Some(Position::new(position, position)),
        };
        self.volatile.retain(|subscriber| {
            if !subscriber.stream.is_empty() && subscriber.stream != event.stream_id {
                return true;
            }
            let appeared = StreamEventAppeared {
                event: resolved.clone(),
            };
            let package = Package::from_message(&appeared, subscriber.correlation_id).unwrap();
            subscriber.outbound.send(package).is_ok()
        });

        let mut deliveries = Vec::new();
        for subscriber in &mut self.persistent {
            if subscriber.stream == event.stream_id {
                subscriber.pending.insert(event.event_id, 0);
                deliveries.push((subscriber.correlation_id, subscriber.outbound.clone()));
            }
        }
        for (correlation_id, outbound) in deliveries {
            self.deliver_persistent(&outbound, correlation_id, &resolved, 0);
        }
    }

    fn deliver_persistent(
        &mut self,
        outbound: &Outbound,
        correlation_id: Uuid,
        event: &ResolvedEvent,
        retry_count: i32,
    ) {
        if let Some(id) = event.original_event_id() {
            self.deliveries.entry(id).or_default().push(retry_count);
        }
        let appeared = PersistentSubscriptionStreamEventAppeared {
            event: event.clone(),
            retry_count,
        };
        let _ = outbound.send(Package::from_message(&appeared, correlation_id).unwrap());
    }

    fn find(&self, event_id: Uuid) -> Option<(RecordedEvent, i64)> {
        self.log
            .iter()
            .position(|e| e.event_id == event_id)
            .map(|p| (self.log[p].clone(), p as i64))
    }

    /// Same ids already stored by an earlier append made with the same
    /// expected version.
    fn replayed(
        &self,
        stream: &str,
        expected_version: i64,
        events: &[EventData],
    ) -> Option<(i64, i64)> {
        let first_id = events.first()?.event_id();
        let stored = self.streams.get(stream)?;
        let start = stored.iter().position(|e| e.event_id == first_id)?;
        let consistent = match expected_version {
            -2 | -4 => true,
            -1 => start == 0,
            n => start as i64 == n + 1,
        };
        let matches = events.iter().enumerate().all(|(i, e)| {
            stored
                .get(start + i)
                .is_some_and(|s| s.event_id == e.event_id())
        });
        (consistent && matches).then(|| (start as i64, (start + events.len()) as i64 - 1))
    }

    fn confirm(&self, subscriber: &VolatileSubscriber) {
        let last_event_number = if subscriber.stream.is_empty() {
            None
        } else {
            self.streams
                .get(&subscriber.stream)
                .map(|s| s.len() as i64 - 1)
        };
        let confirmation = SubscriptionConfirmation {
            last_commit_position: self.log.len() as i64 - 1,
            last_event_number,
        };
        let _ = subscriber
            .outbound
            .send(Package::from_message(&confirmation, subscriber.correlation_id).unwrap());
    }
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    connection: u64,
    store: Arc<Mutex<Store>>,
    silent: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl Session {
    async fn run(self, socket: TcpStream, mut kill: watch::Receiver<u64>) {
        let (mut reader, mut writer) = socket.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Package>();

        let writer_task = tokio::spawn(async move {
            while let Some(package) = outbound_rx.recv().await {
                if write_frame(&mut writer, &package).await.is_err() {
                    return;
                }
            }
        });

        loop {
            tokio::select! {
                _ = kill.changed() => break,
                frame = read_frame(&mut reader) => {
                    let Ok(frame) = frame else { break };
                    let Ok(package) = Package::decode(frame) else { break };
                    if self.silent.load(Ordering::SeqCst) {
                        continue;
                    }
                    self.handle(package, &outbound);
                }
            }
        }

        let mut store = self.store.lock().unwrap();
        store.volatile.retain(|s| s.connection != self.connection);
        store.held.retain(|s| s.connection != self.connection);
        store.persistent.retain(|s| s.connection != self.connection);
        drop(store);
        writer_task.abort();
    }

    fn handle(&self, package: Package, outbound: &Outbound) {
        let correlation_id = package.correlation_id;
        let reply = |package: Package| {
            let _ = outbound.send(package);
        };

        match package.command {
            TcpCommand::HeartbeatRequest => {
                reply(Package::new(TcpCommand::HeartbeatResponse, correlation_id))
            }
            TcpCommand::Authenticate => {
                reply(Package::new(TcpCommand::Authenticated, correlation_id))
            }
            TcpCommand::IdentifyClient => {
                reply(Package::new(TcpCommand::ClientIdentified, correlation_id))
            }
            TcpCommand::WriteEvents => {
                let request: WriteEvents = package.message().unwrap();
                if let Some(response) = self.write(request) {
                    reply(Package::from_message(&response, correlation_id).unwrap());
                }
            }
            TcpCommand::ReadStreamEventsForward | TcpCommand::ReadStreamEventsBackward => {
                let request: ReadStreamEvents = package.message().unwrap();
                let response = self.read_stream(request);
                reply(Package::from_message(&response, correlation_id).unwrap());
            }
            TcpCommand::ReadAllEventsForward => {
                let request: ReadAllEvents = package.message().unwrap();
                let response = self.read_all(request);
                reply(Package::from_message(&response, correlation_id).unwrap());
            }
            TcpCommand::SubscribeToStream => {
                let request: SubscribeToStream = package.message().unwrap();
                self.subscribe(request, correlation_id, outbound);
            }
            TcpCommand::UnsubscribeFromStream => {
                let mut store = self.store.lock().unwrap();
                store.unsubscribes += 1;
                // A held subscribe was still processed first.
                if let Some(index) = store
                    .held
                    .iter()
                    .position(|s| s.correlation_id == correlation_id)
                {
                    let subscriber = store.held.remove(index);
                    store.confirm(&subscriber);
                }
                store.volatile.retain(|s| s.correlation_id != correlation_id);
                store.persistent.retain(|s| s.correlation_id != correlation_id);
                drop(store);
                let dropped = SubscriptionDropped {
                    reason: SubscriptionDropWireReason::Unsubscribed,
                };
                reply(Package::from_message(&dropped, correlation_id).unwrap());
            }
            TcpCommand::CreatePersistentSubscription => {
                let request: PersistentSubscriptionDefinition = package.message().unwrap();
                let inserted = self
                    .store
                    .lock()
                    .unwrap()
                    .groups
                    .insert((request.event_stream_id, request.group_name));
                let response = CreatePersistentSubscriptionCompleted {
                    result: if inserted {
                        CreatePersistentSubscriptionResult::Success
                    } else {
                        CreatePersistentSubscriptionResult::AlreadyExists
                    },
                    reason: None,
                };
                reply(Package::from_message(&response, correlation_id).unwrap());
            }
            TcpCommand::UpdatePersistentSubscription => {
                let request: PersistentSubscriptionDefinition = package.message().unwrap();
                let response = UpdatePersistentSubscriptionCompleted {
                    result: self.update_group(request),
                    reason: None,
                };
                reply(Package::from_message(&response, correlation_id).unwrap());
            }
            TcpCommand::ConnectToPersistentSubscription => {
                let request: ConnectToPersistentSubscription = package.message().unwrap();
                self.connect_persistent(request, correlation_id, outbound);
            }
            TcpCommand::PersistentSubscriptionAckEvents => {
                let request: PersistentSubscriptionAckEvents = package.message().unwrap();
                let mut store = self.store.lock().unwrap();
                for subscriber in &mut store.persistent {
                    for id in &request.processed_event_ids {
                        subscriber.pending.remove(id);
                    }
                }
                store.acked.extend(request.processed_event_ids);
            }
            TcpCommand::PersistentSubscriptionNakEvents => {
                let request: PersistentSubscriptionNakEvents = package.message().unwrap();
                self.nak(request, correlation_id);
            }
            _ => {}
        }
    }

    fn write(&self, request: WriteEvents) -> Option<WriteEventsCompleted> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock().unwrap();
        let stream = request.event_stream_id.clone();

        if let Some((first, last)) =
            store.replayed(&stream, request.expected_version, &request.events)
        {
            let position = store
                .find(request.events[request.events.len() - 1].event_id())
                .map_or(-1, |(_, p)| p);
            return Some(completed(OperationResult::Success, first, last, position, last));
        }

        let current = store.streams.get(&stream).map_or(-1, |s| s.len() as i64 - 1);
        let accepted = match request.expected_version {
            -2 => true,
            -1 => current == -1,
            -4 => current >= 0,
            n => n == current,
        };
        if !accepted {
            return Some(WriteEventsCompleted {
                message: Some(format!("expected {} but was {}", request.expected_version, current)),
                ..completed(OperationResult::WrongExpectedVersion, -1, -1, -1, current)
            });
        }
        if request.events.is_empty() {
            return Some(completed(OperationResult::Success, current + 1, current, -1, current));
        }

        let (first, last, position) = store.append(&stream, request.events);
        if store.swallow_write_replies > 0 {
            store.swallow_write_replies -= 1;
            return None;
        }
        Some(completed(OperationResult::Success, first, last, position, last))
    }

    fn read_stream(&self, request: ReadStreamEvents) -> ReadStreamEventsCompleted {
        let store = self.store.lock().unwrap();
        let Some(events) = store.streams.get(&request.event_stream_id) else {
            return ReadStreamEventsCompleted {
                direction: request.direction,
                result: ReadStreamResult::NoStream,
                events: Vec::new(),
                next_event_number: -1,
                last_event_number: -1,
                is_end_of_stream: true,
                last_commit_position: -1,
                error: None,
            };
        };
        let last = events.len() as i64 - 1;
        let count = request.max_count.max(0) as i64;

        let (page, next, is_end) = match request.direction {
            ReadDirection::Forward => {
                let from = request.from_event_number.max(0);
                let to = (from + count).min(last + 1);
                let page: Vec<RecordedEvent> = (from..to)
                    .map(|n| events[n as usize].clone())
                    .collect();
                (page, to, to > last)
            }
            ReadDirection::Backward => {
                let from = if request.from_event_number < 0 || request.from_event_number > last {
                    last
                } else {
                    request.from_event_number
                };
                let to = (from - count + 1).max(0);
                let page: Vec<RecordedEvent> = (to..=from)
                    .rev()
                    .map(|n| events[n as usize].clone())
                    .collect();
                (page, to - 1, to == 0)
            }
        };

        ReadStreamEventsCompleted {
            direction: request.direction,
            result: ReadStreamResult::Success,
            events: page
                .into_iter()
                .map(|event| ResolvedEvent {
                    event: Some(event),
                    link: None,
                    original_position: None,
                })
                .collect(),
            next_event_number: next,
            last_event_number: last,
            is_end_of_stream: is_end,
            last_commit_position: store.log.len() as i64 - 1,
            error: None,
        }
    }

    fn read_all(&self, request: ReadAllEvents) -> ReadAllEventsCompleted {
        let store = self.store.lock().unwrap();
        let from = request.commit_position.max(0) as usize;
        let to = (from + request.max_count.max(0) as usize).min(store.log.len());
        let events = (from..to)
            .map(|p| ResolvedEvent {
                event: Some(store.log[p].clone()),
                link: None,
                original_position: Some(Position::new(p as i64, p as i64)),
            })
            .collect();
        ReadAllEventsCompleted {
            direction: ReadDirection::Forward,
            commit_position: from as i64,
            prepare_position: from as i64,
            events,
            next_commit_position: to as i64,
            next_prepare_position: to as i64,
            result: ReadAllResult::Success,
            error: None,
        }
    }

    fn subscribe(&self, request: SubscribeToStream, correlation_id: Uuid, outbound: &Outbound) {
        let mut store = self.store.lock().unwrap();
        let subscriber = VolatileSubscriber {
            connection: self.connection,
            correlation_id,
            stream: request.event_stream_id,
            outbound: outbound.clone(),
        };
        if store.hold_confirmations {
            store.held.push(subscriber);
            return;
        }
        store.confirm(&subscriber);
        store.volatile.push(subscriber);
    }

    /// Changing a group's definition disconnects all of its members.
    fn update_group(
        &self,
        request: PersistentSubscriptionDefinition,
    ) -> UpdatePersistentSubscriptionResult {
        let mut store = self.store.lock().unwrap();
        let key = (request.event_stream_id, request.group_name);
        if !store.groups.contains(&key) {
            return UpdatePersistentSubscriptionResult::DoesNotExist;
        }
        let dropped = SubscriptionDropped {
            reason: SubscriptionDropWireReason::Unsubscribed,
        };
        store.persistent.retain(|subscriber| {
            if subscriber.stream != key.0 || subscriber.group != key.1 {
                return true;
            }
            let package = Package::from_message(&dropped, subscriber.correlation_id).unwrap();
            let _ = subscriber.outbound.send(package);
            false
        });
        UpdatePersistentSubscriptionResult::Success
    }

    fn connect_persistent(
        &self,
        request: ConnectToPersistentSubscription,
        correlation_id: Uuid,
        outbound: &Outbound,
    ) {
        let mut store = self.store.lock().unwrap();
        let key = (
            request.event_stream_id.clone(),
            request.subscription_id.clone(),
        );
        if !store.groups.contains(&key) {
            let dropped = SubscriptionDropped {
                reason: SubscriptionDropWireReason::NotFound,
            };
            let _ = outbound.send(Package::from_message(&dropped, correlation_id).unwrap());
            return;
        }

        let history: Vec<(RecordedEvent, i64)> = store
            .streams
            .get(&request.event_stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter_map(|e| store.find(e.event_id))
                    .collect()
            })
            .unwrap_or_default();
        let confirmation = PersistentSubscriptionConfirmation {
            last_commit_position: store.log.len() as i64 - 1,
            subscription_id: format!("{}::{}", request.event_stream_id, request.subscription_id),
            last_event_number: history.last().map(|(e, _)| e.event_number),
        };
        let _ = outbound.send(Package::from_message(&confirmation, correlation_id).unwrap());

        let mut pending = HashMap::new();
        for (event, _) in &history {
            pending.insert(event.event_id, 0);
        }
        store.persistent.push(PersistentSubscriber {
            connection: self.connection,
            correlation_id,
            stream: request.event_stream_id,
            group: request.subscription_id,
            outbound: outbound.clone(),
            pending,
        });
        for (event, position) in history {
            let resolved = ResolvedEvent {
                event: Some(event),
                link: None,
                original_position: Some(Position::new(position, position)),
            };
            store.deliver_persistent(outbound, correlation_id, &resolved, 0);
        }
    }

    fn nak(&self, request: PersistentSubscriptionNakEvents, correlation_id: Uuid) {
        let mut store = self.store.lock().unwrap();
        for id in &request.processed_event_ids {
            store.naks.push((*id, request.action));
        }
        if request.action != PersistentSubscriptionNakEventAction::Retry {
            for subscriber in &mut store.persistent {
                for id in &request.processed_event_ids {
                    subscriber.pending.remove(id);
                }
            }
            return;
        }

        let mut redeliveries = Vec::new();
        if let Some(subscriber) = store
            .persistent
            .iter_mut()
            .find(|s| s.correlation_id == correlation_id)
        {
            for id in &request.processed_event_ids {
                let retries = subscriber.pending.entry(*id).or_insert(0);
                *retries += 1;
                redeliveries.push((*id, *retries, subscriber.outbound.clone()));
            }
        }
        for (id, retry_count, outbound) in redeliveries {
            if let Some((event, position)) = store.find(id) {
                let resolved = ResolvedEvent {
                    event: Some(event),
                    link: None,
                    original_position: Some(Position::new(position, position)),
                };
                store.deliver_persistent(&outbound, correlation_id, &resolved, retry_count);
            }
        }
    }
}

fn completed(
    result: OperationResult,
    first: i64,
    last: i64,
    position: i64,
    current: i64,
) -> WriteEventsCompleted {
    WriteEventsCompleted {
        result,
        message: None,
        first_event_number: first,
        last_event_number: last,
        prepare_position: position,
        commit_position: position,
        current_version: current,
    }
}
