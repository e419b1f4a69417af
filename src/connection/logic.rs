//! The connection actor.
//!
//! One task per connection owns everything mutable: the phase, the current
//! transport, the heartbeat monitor and both correlation tables. It reacts to
//! five inputs:
//!
//! | Input | Source |
//! |-------|--------|
//! | `Command` | public API calls |
//! | `SubscriptionRequest` | subscription handles (acks, naks, unsubscribe) |
//! | `TransportEvent` | the socket's reader and writer tasks |
//! | `Internal` | discovery and connect tasks spawned by the actor |
//! | timer tick | every `TIMER_PERIOD_MS` |
//!
//! Discovery and TCP connects run on spawned tasks and report back with the
//! attempt number they were started for; results of an older attempt are
//! discarded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Command, ConnectionEvent, ConnectionEvents, ConnectionState};
use crate::constants::{CLIENT_VERSION, TIMER_PERIOD_MS};
use crate::discovery::{EndpointDiscoverer, NodeEndpoints};
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::operations::{InspectionDecision, OperationsManager};
use crate::protocol::messages::IdentifyClient;
use crate::protocol::{Package, TcpCommand};
use crate::settings::ConnectionSettings;
use crate::subscription::{SubscriptionDropReason, SubscriptionRequest, SubscriptionsManager};
use crate::transport::{PackageSink, TcpTransport, TransportEvent};

/// Actor clock. Follows tokio's clock so paused-time tests drive timeouts.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    /// Waiting `reconnection_delay` before discovering again.
    Reconnecting {
        since: Instant,
    },
    EndpointDiscovery,
    ConnectionEstablishing,
    Authentication {
        correlation_id: Uuid,
        started: Instant,
    },
    Identification {
        correlation_id: Uuid,
        started: Instant,
    },
    Connected,
    Closed,
}

impl Phase {
    fn public_state(self) -> ConnectionState {
        match self {
            Phase::Init => ConnectionState::Init,
            Phase::Reconnecting { .. } => ConnectionState::Reconnecting,
            Phase::EndpointDiscovery
            | Phase::ConnectionEstablishing
            | Phase::Authentication { .. }
            | Phase::Identification { .. } => ConnectionState::Connecting,
            Phase::Connected => ConnectionState::Connected,
            Phase::Closed => ConnectionState::Closed,
        }
    }
}

/// Results of work the actor spawned.
enum Internal {
    EndpointDiscovered {
        attempt: u64,
        result: Result<NodeEndpoints>,
    },
    TransportConnected {
        attempt: u64,
        endpoints: NodeEndpoints,
        result: Result<TcpTransport>,
    },
}

pub(crate) struct ConnectionLogic {
    name: String,
    settings: ConnectionSettings,
    discoverer: Arc<dyn EndpointDiscoverer>,
    events: Arc<ConnectionEvents>,
    state: watch::Sender<ConnectionState>,
    phase: Phase,
    transport: Option<TcpTransport>,
    heartbeat: HeartbeatMonitor,
    operations: OperationsManager,
    subscriptions: SubscriptionsManager,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    attempt: u64,
    reconnections: u32,
    last_endpoint: Option<SocketAddr>,
    last_timeout_check: Instant,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    transport_events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
}

impl ConnectionLogic {
    pub(crate) fn new(
        name: String,
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndpointDiscoverer>,
        events: Arc<ConnectionEvents>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let now = now();
        let (transport_events, transport_events_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();
        ConnectionLogic {
            heartbeat: HeartbeatMonitor::new(settings.heartbeat_config(), now),
            operations: OperationsManager::new(name.clone(), &settings),
            subscriptions: SubscriptionsManager::new(name.clone(), &settings),
            name,
            settings,
            discoverer,
            events,
            state,
            phase: Phase::Init,
            transport: None,
            connect_waiters: Vec::new(),
            attempt: 0,
            reconnections: 0,
            last_endpoint: None,
            last_timeout_check: now,
            transport_events,
            internal,
            transport_events_rx: Some(transport_events_rx),
            internal_rx: Some(internal_rx),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut requests: mpsc::UnboundedReceiver<SubscriptionRequest>,
    ) {
        let (Some(mut transport_events), Some(mut internal)) =
            (self.transport_events_rx.take(), self.internal_rx.take())
        else {
            return;
        };
        let mut timer = tokio::time::interval(Duration::from_millis(TIMER_PERIOD_MS));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(connection = %self.name, "Connection actor started");

        while self.phase != Phase::Closed {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.close_connection("All connection handles were dropped", None),
                },
                Some(request) = requests.recv() => self.handle_subscription_request(request),
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = timer.tick() => self.on_timer_tick(),
            }
        }

        // Anything submitted after the close races the shutdown; reject it.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.reject(command);
        }
        debug!(connection = %self.name, "Connection actor stopped");
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        let state = phase.public_state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => match self.phase {
                Phase::Init => {
                    info!(connection = %self.name, "Connecting");
                    self.connect_waiters.push(reply);
                    self.discover();
                }
                Phase::Connected => {
                    let _ = reply.send(Ok(()));
                }
                Phase::Closed => {
                    let _ = reply.send(Err(self.closed_error()));
                }
                _ => self.connect_waiters.push(reply),
            },
            Command::StartOperation(mut operation) => match self.phase {
                Phase::Init => operation.fail(Error::InvalidOperation(format!(
                    "connection '{}' is not active",
                    self.name
                ))),
                Phase::Closed => operation.fail(self.closed_error()),
                _ => {
                    let now = now();
                    self.operations.enqueue_operation(operation, now);
                    if let (Phase::Connected, Some(transport)) = (self.phase, &self.transport) {
                        self.operations.schedule_waiting_operations(transport, now);
                    }
                }
            },
            Command::StartSubscription(mut subscription) => match self.phase {
                Phase::Init => subscription.drop_subscription(
                    SubscriptionDropReason::SubscribingError,
                    Some(Error::InvalidOperation(format!(
                        "connection '{}' is not active",
                        self.name
                    ))),
                ),
                Phase::Closed => subscription.drop_subscription(
                    SubscriptionDropReason::ConnectionClosed,
                    Some(self.closed_error()),
                ),
                _ => {
                    let now = now();
                    self.subscriptions.enqueue_subscription(subscription, now);
                    if let (Phase::Connected, Some(transport)) = (self.phase, &self.transport) {
                        self.subscriptions.start_waiting(transport, now);
                    }
                }
            },
            Command::Unsubscribe(correlation_id) => self.unsubscribe(correlation_id),
            Command::Close { reason, done } => {
                self.close_connection(&reason, None);
                let _ = done.send(());
            }
        }
    }

    fn reject(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(Err(self.closed_error()));
            }
            Command::StartOperation(mut operation) => operation.fail(self.closed_error()),
            Command::StartSubscription(mut subscription) => subscription.drop_subscription(
                SubscriptionDropReason::ConnectionClosed,
                Some(self.closed_error()),
            ),
            Command::Unsubscribe(_) => {}
            Command::Close { done, .. } => {
                let _ = done.send(());
            }
        }
    }

    fn closed_error(&self) -> Error {
        Error::InvalidOperation(format!("connection '{}' is closed", self.name))
    }

    fn handle_subscription_request(&mut self, request: SubscriptionRequest) {
        match request {
            SubscriptionRequest::Send(package) => match (&self.phase, &self.transport) {
                (Phase::Connected, Some(transport)) => {
                    if let Err(e) = transport.send(package) {
                        debug!(connection = %self.name, error = %e, "Subscription package not sent");
                    }
                }
                _ => debug!(
                    connection = %self.name,
                    command = ?package.command,
                    "Not connected, dropping subscription package"
                ),
            },
            SubscriptionRequest::Unsubscribe { correlation_id } => {
                self.unsubscribe(correlation_id);
            }
        }
    }

    fn unsubscribe(&mut self, correlation_id: Uuid) {
        if let Some(mut item) = self.subscriptions.remove_waiting(correlation_id) {
            item.operation
                .drop_subscription(SubscriptionDropReason::Unsubscribed, None);
            return;
        }

        let connected = self.phase == Phase::Connected;
        let Some(item) = self.subscriptions.get_active(correlation_id) else {
            debug!(connection = %self.name, %correlation_id, "Unsubscribe for unknown subscription");
            return;
        };
        let sent = match (&self.transport, connected) {
            (Some(transport), true) => transport.send(item.operation.unsubscribe_package()).is_ok(),
            _ => false,
        };
        // The server confirms with SubscriptionDropped. Without a socket, or
        // when nobody waits for that answer, finish here.
        if !sent || item.operation.is_dropped() {
            if let Some(mut item) = self.subscriptions.remove_subscription(correlation_id) {
                item.operation
                    .drop_subscription(SubscriptionDropReason::Unsubscribed, None);
            }
        }
    }

    // =========================================================================
    // Connect Sequence
    // =========================================================================

    fn discover(&mut self) {
        self.attempt += 1;
        self.set_phase(Phase::EndpointDiscovery);

        let attempt = self.attempt;
        let discoverer = self.discoverer.clone();
        let failed_endpoint = self.last_endpoint;
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = discoverer.discover(failed_endpoint).await;
            let _ = internal.send(Internal::EndpointDiscovered { attempt, result });
        });
    }

    fn establish(&mut self, endpoints: NodeEndpoints) {
        self.attempt += 1;
        self.set_phase(Phase::ConnectionEstablishing);
        debug!(connection = %self.name, endpoint = %endpoints, "Opening TCP connection");

        let attempt = self.attempt;
        let timeout = self.settings.client_connection_timeout;
        let events = self.transport_events.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = TcpTransport::connect(endpoints.tcp, timeout, events).await;
            let _ = internal.send(Internal::TransportConnected {
                attempt,
                endpoints,
                result,
            });
        });
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::EndpointDiscovered { attempt, result } => {
                if attempt != self.attempt || self.phase != Phase::EndpointDiscovery {
                    return;
                }
                match result {
                    Ok(endpoints) => self.establish(endpoints),
                    Err(e) => {
                        warn!(connection = %self.name, error = %e, "Endpoint discovery failed");
                        self.events.emit(ConnectionEvent::ErrorOccurred(e.clone()));
                        self.close_connection("Failed to discover a node", Some(e));
                    }
                }
            }
            Internal::TransportConnected {
                attempt,
                endpoints,
                result,
            } => {
                if attempt != self.attempt || self.phase != Phase::ConnectionEstablishing {
                    if let Ok(transport) = result {
                        transport.close("Stale connection attempt");
                    }
                    return;
                }
                self.last_endpoint = Some(endpoints.tcp);
                match result {
                    Ok(transport) => self.on_transport_established(transport),
                    Err(e) => {
                        info!(
                            connection = %self.name,
                            endpoint = %endpoints,
                            error = %e,
                            "TCP connection failed"
                        );
                        self.goto_reconnecting();
                    }
                }
            }
        }
    }

    fn on_transport_established(&mut self, transport: TcpTransport) {
        let now = now();
        self.heartbeat.reset(now);
        let credentials = self.settings.default_user_credentials.clone();
        self.transport = Some(transport);

        match credentials {
            Some(credentials) => {
                let correlation_id = Uuid::new_v4();
                self.set_phase(Phase::Authentication {
                    correlation_id,
                    started: now,
                });
                self.send(
                    Package::new(TcpCommand::Authenticate, correlation_id)
                        .with_credentials(Some(credentials)),
                );
            }
            None => self.goto_identification(now),
        }
    }

    fn goto_identification(&mut self, now: Instant) {
        let correlation_id = Uuid::new_v4();
        self.set_phase(Phase::Identification {
            correlation_id,
            started: now,
        });
        let identify = IdentifyClient {
            version: CLIENT_VERSION,
            connection_name: Some(self.name.clone()),
        };
        match Package::from_message(&identify, correlation_id) {
            Ok(package) => self.send(package),
            Err(e) => self.close_connection("Cannot encode client identification", Some(e)),
        }
    }

    fn goto_connected(&mut self, now: Instant) {
        let Some(transport) = &self.transport else {
            return;
        };
        let remote = transport.remote_addr();
        info!(
            connection = %self.name,
            %remote,
            stall_detection_ms = self.settings.heartbeat_config().detection_time().as_millis() as u64,
            "Connected"
        );

        self.set_phase(Phase::Connected);
        self.reconnections = 0;
        self.last_timeout_check = now;
        self.events.emit(ConnectionEvent::Connected(remote));
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if let Some(transport) = &self.transport {
            self.operations.check_timeouts_and_retry(transport, now);
            self.subscriptions.check_timeouts_and_retry(transport, now);
        }
    }

    fn goto_reconnecting(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.set_phase(Phase::Reconnecting { since: now() });
    }

    fn send(&self, package: Package) {
        let Some(transport) = &self.transport else {
            return;
        };
        if let Err(e) = transport.send(package) {
            debug!(connection = %self.name, error = %e, "Send failed");
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let current = self.transport.as_ref().map(|t| t.connection_id());
        match event {
            TransportEvent::Package {
                connection_id,
                package,
            } if Some(connection_id) == current => self.handle_package(package),
            TransportEvent::Closed {
                connection_id,
                error,
            } if Some(connection_id) == current => {
                info!(
                    connection = %self.name,
                    error = %error,
                    heartbeat = %self.heartbeat.state(),
                    "Connection to server lost"
                );
                self.events.emit(ConnectionEvent::ErrorOccurred(error));
                self.close_tcp("Socket closed");
            }
            TransportEvent::Package { connection_id, .. }
            | TransportEvent::Closed { connection_id, .. } => {
                debug!(connection = %self.name, %connection_id, "Event from a replaced socket ignored");
            }
        }
    }

    fn handle_package(&mut self, package: Package) {
        let now = now();
        self.heartbeat.on_package_received(now);

        match package.command {
            TcpCommand::HeartbeatRequest => {
                self.send(Package::new(
                    TcpCommand::HeartbeatResponse,
                    package.correlation_id,
                ));
                return;
            }
            TcpCommand::HeartbeatResponse => {
                self.heartbeat.on_response(package.correlation_id, now);
                return;
            }
            TcpCommand::Ping => {
                self.send(Package::new(TcpCommand::Pong, package.correlation_id));
                return;
            }
            _ => {}
        }

        match self.phase {
            Phase::Authentication { correlation_id, .. }
                if correlation_id == package.correlation_id =>
            {
                if package.command == TcpCommand::NotAuthenticated {
                    let reason = package.data_as_text();
                    warn!(connection = %self.name, %reason, "Authentication failed");
                    self.events
                        .emit(ConnectionEvent::AuthenticationFailed(reason));
                } else if package.command != TcpCommand::Authenticated {
                    debug!(command = ?package.command, "Unexpected answer to Authenticate");
                }
                self.goto_identification(now);
                return;
            }
            Phase::Identification { correlation_id, .. }
                if correlation_id == package.correlation_id =>
            {
                if package.command == TcpCommand::ClientIdentified {
                    self.goto_connected(now);
                } else {
                    warn!(command = ?package.command, "Client identification refused");
                    self.close_tcp("Client identification refused");
                }
                return;
            }
            Phase::Connected => {}
            _ => {
                debug!(
                    connection = %self.name,
                    command = ?package.command,
                    "Package received before the handshake completed"
                );
                return;
            }
        }

        self.dispatch(package, now);
    }

    fn dispatch(&mut self, package: Package, now: Instant) {
        let correlation_id = package.correlation_id;

        if let Some(item) = self.operations.get_active(correlation_id) {
            let result = item.operation.inspect_package(&package);
            debug!(
                connection = %self.name,
                operation = item.operation.name(),
                %correlation_id,
                decision = ?result.decision,
                description = %result.description,
                "Operation package inspected"
            );
            match result.decision {
                InspectionDecision::DoNothing | InspectionDecision::Subscribed => {}
                InspectionDecision::EndOperation => {
                    self.operations.remove_operation(correlation_id);
                }
                InspectionDecision::Retry => {
                    if let Some(item) = self.operations.remove_operation(correlation_id) {
                        self.operations.schedule_operation_retry(item);
                    }
                }
                InspectionDecision::Reconnect(endpoints) => {
                    if let Some(item) = self.operations.remove_operation(correlation_id) {
                        self.operations.schedule_operation_retry(item);
                    }
                    self.reconnect_to(endpoints);
                }
            }
            if let (Phase::Connected, Some(transport)) = (self.phase, &self.transport) {
                self.operations.send_pending_retries(transport, now);
                self.operations.schedule_waiting_operations(transport, now);
            }
            return;
        }

        if let Some(item) = self.subscriptions.get_active(correlation_id) {
            let result = item.operation.inspect_package(&package);
            if package.command != TcpCommand::StreamEventAppeared
                && package.command != TcpCommand::PersistentSubscriptionStreamEventAppeared
            {
                debug!(
                    connection = %self.name,
                    subscription = item.operation.name(),
                    %correlation_id,
                    decision = ?result.decision,
                    description = %result.description,
                    "Subscription package inspected"
                );
            }
            match result.decision {
                InspectionDecision::DoNothing => {}
                InspectionDecision::Subscribed => self.subscriptions.mark_subscribed(correlation_id),
                InspectionDecision::EndOperation => {
                    self.subscriptions.remove_subscription(correlation_id);
                }
                InspectionDecision::Retry => {
                    if let Some(item) = self.subscriptions.remove_subscription(correlation_id) {
                        self.subscriptions.schedule_subscription_retry(item);
                    }
                    if let Some(transport) = &self.transport {
                        self.subscriptions.send_pending_retries(transport, now);
                    }
                }
                InspectionDecision::Reconnect(endpoints) => {
                    if let Some(item) = self.subscriptions.remove_subscription(correlation_id) {
                        self.subscriptions.schedule_subscription_retry(item);
                    }
                    self.reconnect_to(endpoints);
                }
            }
            return;
        }

        debug!(
            connection = %self.name,
            %correlation_id,
            command = ?package.command,
            "No operation for correlation id, package dropped"
        );
    }

    /// Move to the node a `NotHandled` answer pointed at.
    fn reconnect_to(&mut self, endpoints: NodeEndpoints) {
        if self
            .transport
            .as_ref()
            .is_some_and(|t| t.remote_addr() == endpoints.tcp)
        {
            return;
        }
        info!(connection = %self.name, endpoint = %endpoints, "Reconnecting to leader");
        self.close_tcp("Reconnecting to leader");
        if self.phase != Phase::Closed {
            self.establish(endpoints);
        }
    }

    // =========================================================================
    // Timer
    // =========================================================================

    fn on_timer_tick(&mut self) {
        let now = now();
        match self.phase {
            Phase::Init | Phase::Closed => return,
            Phase::Reconnecting { since } => {
                if now.saturating_duration_since(since) >= self.settings.reconnection_delay {
                    if self.settings.max_reconnections.is_exhausted(self.reconnections) {
                        self.close_connection(
                            "Reconnection limit reached",
                            Some(Error::CannotEstablishConnection(format!(
                                "reconnection limit reached after {} attempts",
                                self.reconnections
                            ))),
                        );
                        return;
                    }
                    self.reconnections += 1;
                    info!(
                        connection = %self.name,
                        attempt = self.reconnections,
                        "Reconnecting"
                    );
                    self.events.emit(ConnectionEvent::Reconnecting);
                    self.discover();
                }
                return;
            }
            Phase::EndpointDiscovery | Phase::ConnectionEstablishing => return,
            Phase::Authentication { started, .. } => {
                if now.saturating_duration_since(started) >= self.settings.operation_timeout {
                    warn!(connection = %self.name, "Authentication timed out");
                    self.goto_identification(now);
                }
            }
            Phase::Identification { started, .. } => {
                if now.saturating_duration_since(started) >= self.settings.operation_timeout {
                    warn!(connection = %self.name, "Client identification timed out");
                    self.close_tcp("Timed out waiting for client to be identified");
                    return;
                }
            }
            Phase::Connected => {
                if now.saturating_duration_since(self.last_timeout_check)
                    >= self.settings.operation_timeout_check_period
                {
                    self.last_timeout_check = now;
                    if let Some(transport) = &self.transport {
                        self.operations.check_timeouts_and_retry(transport, now);
                        self.subscriptions.check_timeouts_and_retry(transport, now);
                    }
                }
            }
        }

        match self.heartbeat.tick(now) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendRequest(correlation_id) => {
                self.send(Package::new(TcpCommand::HeartbeatRequest, correlation_id));
            }
            HeartbeatAction::Stalled { silence } => {
                warn!(
                    connection = %self.name,
                    silence_ms = silence.as_millis() as u64,
                    "No traffic from server, closing connection"
                );
                self.close_tcp("Heartbeat timeout");
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Drop the current socket and go through the reconnect path.
    fn close_tcp(&mut self, reason: &str) {
        self.release_transport(reason);
        self.goto_reconnecting();
    }

    fn release_transport(&mut self, reason: &str) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        transport.close(reason);
        self.subscriptions
            .purge_subscribed_and_dropped(transport.connection_id());
        self.events
            .emit(ConnectionEvent::Disconnected(transport.remote_addr()));
    }

    fn close_connection(&mut self, reason: &str, error: Option<Error>) {
        if self.phase == Phase::Closed {
            return;
        }
        info!(connection = %self.name, reason, "Closing connection");

        self.release_transport(reason);
        self.set_phase(Phase::Closed);

        let closed = Error::ConnectionClosed(format!("connection '{}': {}", self.name, reason));
        self.operations.cleanup(closed.clone());
        self.subscriptions.cleanup(closed.clone());

        let waiter_error = error.unwrap_or(closed);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(waiter_error.clone()));
        }
        self.events.emit(ConnectionEvent::Closed(reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::connection::{ConnectionEventKind, EventStoreConnection};
    use crate::types::Attempts;

    struct FailingDiscoverer;

    #[async_trait]
    impl EndpointDiscoverer for FailingDiscoverer {
        async fn discover(&self, _failed_endpoint: Option<SocketAddr>) -> Result<NodeEndpoints> {
            Err(Error::CannotEstablishConnection("no nodes".to_string()))
        }
    }

    #[test]
    fn test_handshake_phases_report_connecting() {
        let now = Instant::now();
        let id = Uuid::new_v4();
        let phases = [
            Phase::EndpointDiscovery,
            Phase::ConnectionEstablishing,
            Phase::Authentication {
                correlation_id: id,
                started: now,
            },
            Phase::Identification {
                correlation_id: id,
                started: now,
            },
        ];
        for phase in phases {
            assert_eq!(phase.public_state(), ConnectionState::Connecting);
        }
        assert_eq!(
            Phase::Reconnecting { since: now }.public_state(),
            ConnectionState::Reconnecting
        );
        assert_eq!(Phase::Closed.public_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_discovery_failure_closes_connection() {
        let connection = EventStoreConnection::create_with_discoverer(
            ConnectionSettings::default(),
            Arc::new(FailingDiscoverer),
        )
        .unwrap();

        let result = connection.connect().await;
        assert!(matches!(result, Err(Error::CannotEstablishConnection(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_reconnection_limit_closes_connection() {
        // Bind then release a port so nothing listens on it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = ConnectionSettings::builder()
            .single_node(addr)
            .max_reconnections(Attempts::Limited(2))
            .reconnection_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        let connection = EventStoreConnection::create(settings).unwrap();

        let reconnects = Arc::new(AtomicUsize::new(0));
        let counter = reconnects.clone();
        connection
            .events()
            .add_listener(ConnectionEventKind::Reconnecting, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let result = tokio::time::timeout(Duration::from_secs(5), connection.connect())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::CannotEstablishConnection(_))));
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
