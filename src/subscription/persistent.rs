//! Competing-consumer subscriptions to a server-side group.
//!
//! The server pushes up to `buffer_size` unacknowledged events. The client
//! mirrors that bound with a semaphore: the worker takes a permit before
//! handing an event to the handler and the permit is released when the event
//! is acknowledged or nacked.
//!
//! | Mode | Handler `Ok` | Handler `Err` or panic |
//! |------|--------------|------------------------|
//! | `auto_ack` | ack | nak with `Park`, keep going |
//! | manual | nothing; the handler acks | drop with `EventHandlerException` |

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Delivery, DropState, PersistentSubscriptionHandler, SessionInspection,
    SubscriptionDropReason, SubscriptionOperation, SubscriptionRequest, classify_server_drop,
    guarded, guarded_drop, inspect_session_package,
};
use crate::error::{Error, Result};
use crate::event::{EventId, ResolvedEvent};
use crate::operations::{InspectionDecision, InspectionResult};
use crate::protocol::messages::{
    ConnectToPersistentSubscription, PersistentSubscriptionAckEvents,
    PersistentSubscriptionConfirmation, PersistentSubscriptionNakEventAction,
    PersistentSubscriptionNakEvents, PersistentSubscriptionStreamEventAppeared,
    SubscriptionDropped,
};
use crate::protocol::{Package, TcpCommand};
use crate::types::UserCredentials;

/// An event delivered to a persistent subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentEvent {
    pub event: ResolvedEvent,
    /// Deliveries of this event before this one.
    pub retry_count: i32,
}

impl PersistentEvent {
    /// Id the server expects in acks and naks.
    pub fn event_id(&self) -> Option<EventId> {
        self.event.original_event_id()
    }
}

pub(crate) struct PersistentInner {
    stream: String,
    group: String,
    correlation_id: Uuid,
    subscription_id: OnceLock<String>,
    credentials: Option<UserCredentials>,
    in_flight: DashMap<EventId, OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
    state: DropState,
    requests: mpsc::UnboundedSender<SubscriptionRequest>,
}

impl PersistentInner {
    /// Mark the subscription dropped and unblock a worker waiting for a permit.
    fn begin_drop(&self) -> bool {
        if !self.state.try_begin() {
            return false;
        }
        self.semaphore.close();
        self.in_flight.clear();
        true
    }
}

/// Handle to a connected persistent subscription.
#[derive(Clone)]
pub struct PersistentSubscription {
    inner: Arc<PersistentInner>,
}

impl std::fmt::Debug for PersistentSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSubscription")
            .field("stream", &self.inner.stream)
            .field("group", &self.inner.group)
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

impl PersistentSubscription {
    pub fn stream_id(&self) -> &str {
        &self.inner.stream
    }

    pub fn group_name(&self) -> &str {
        &self.inner.group
    }

    /// Events handed to the handler and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.state.is_dropped()
    }

    pub fn acknowledge(&self, event: &PersistentEvent) -> Result<()> {
        let id = event
            .event_id()
            .ok_or_else(|| Error::InvalidArgument("event has no id".to_string()))?;
        self.acknowledge_many([id])
    }

    pub fn acknowledge_many(&self, event_ids: impl IntoIterator<Item = EventId>) -> Result<()> {
        let subscription_id = self.subscription_id()?;
        let processed_event_ids = self.release(event_ids);
        if processed_event_ids.is_empty() {
            return Ok(());
        }
        let request = PersistentSubscriptionAckEvents {
            subscription_id,
            processed_event_ids,
        };
        self.send(Package::from_message(&request, self.inner.correlation_id)?)
    }

    /// Negative acknowledgement; `action` tells the server what to do next.
    pub fn fail(
        &self,
        event: &PersistentEvent,
        action: PersistentSubscriptionNakEventAction,
        reason: impl Into<String>,
    ) -> Result<()> {
        let id = event
            .event_id()
            .ok_or_else(|| Error::InvalidArgument("event has no id".to_string()))?;
        self.nak([id], action, reason.into())
    }

    /// Disconnect from the group and wait until the drop callback returned.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if self.inner.state.request_unsubscribe() && !self.inner.state.is_dropped() {
            let _ = self.inner.requests.send(SubscriptionRequest::Unsubscribe {
                correlation_id: self.inner.correlation_id,
            });
        }
        self.inner.state.wait(timeout, "StopPersistentSubscription").await
    }

    pub(crate) fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    pub(crate) fn drop_state(&self) -> &DropState {
        &self.inner.state
    }

    fn nak(
        &self,
        event_ids: impl IntoIterator<Item = EventId>,
        action: PersistentSubscriptionNakEventAction,
        message: String,
    ) -> Result<()> {
        let subscription_id = self.subscription_id()?;
        let processed_event_ids = self.release(event_ids);
        if processed_event_ids.is_empty() {
            return Ok(());
        }
        let request = PersistentSubscriptionNakEvents {
            subscription_id,
            processed_event_ids,
            message: Some(message),
            action,
        };
        self.send(Package::from_message(&request, self.inner.correlation_id)?)
    }

    fn subscription_id(&self) -> Result<String> {
        if self.inner.state.is_dropped() {
            return Err(Error::InvalidOperation(format!(
                "subscription group '{}' on stream '{}' is dropped",
                self.inner.group, self.inner.stream
            )));
        }
        self.inner.subscription_id.get().cloned().ok_or_else(|| {
            Error::InvalidOperation("persistent subscription is not confirmed".to_string())
        })
    }

    fn release(&self, event_ids: impl IntoIterator<Item = EventId>) -> Vec<EventId> {
        event_ids
            .into_iter()
            .inspect(|id| {
                self.inner.in_flight.remove(id);
            })
            .collect()
    }

    fn send(&self, package: Package) -> Result<()> {
        let package = package.with_credentials(self.inner.credentials.clone());
        self.inner
            .requests
            .send(SubscriptionRequest::Send(package))
            .map_err(|_| Error::ConnectionClosed("connection is closed".to_string()))
    }
}

/// The dispatcher-side half of a persistent subscription.
pub(crate) struct PersistentSubscriptionOperation {
    inner: Arc<PersistentInner>,
    buffer_size: i32,
    require_leader: bool,
    confirmation: Option<oneshot::Sender<Result<()>>>,
    deliveries: mpsc::UnboundedSender<Delivery<PersistentEvent>>,
}

/// Build a persistent subscription and spawn its worker.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_persistent<H: PersistentSubscriptionHandler>(
    stream: String,
    group: String,
    buffer_size: i32,
    auto_ack: bool,
    credentials: Option<UserCredentials>,
    require_leader: bool,
    requests: mpsc::UnboundedSender<SubscriptionRequest>,
    handler: H,
) -> (
    PersistentSubscriptionOperation,
    PersistentSubscription,
    oneshot::Receiver<Result<()>>,
) {
    let permits = usize::try_from(buffer_size).unwrap_or(1).max(1);
    let inner = Arc::new(PersistentInner {
        stream,
        group,
        correlation_id: Uuid::new_v4(),
        subscription_id: OnceLock::new(),
        credentials,
        in_flight: DashMap::new(),
        semaphore: Arc::new(Semaphore::new(permits)),
        state: DropState::new(),
        requests,
    });
    let subscription = PersistentSubscription {
        inner: inner.clone(),
    };
    let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
    let (confirmation, confirmation_rx) = oneshot::channel();

    tokio::spawn(run_worker(
        handler,
        deliveries_rx,
        subscription.clone(),
        auto_ack,
    ));

    let operation = PersistentSubscriptionOperation {
        inner,
        buffer_size,
        require_leader,
        confirmation: Some(confirmation),
        deliveries,
    };
    (operation, subscription, confirmation_rx)
}

impl SubscriptionOperation for PersistentSubscriptionOperation {
    fn name(&self) -> &'static str {
        "ConnectToPersistentSubscription"
    }

    fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    fn subscribe_package(&self) -> Result<Package> {
        let request = ConnectToPersistentSubscription {
            subscription_id: self.inner.group.clone(),
            event_stream_id: self.inner.stream.clone(),
            allowed_in_flight_messages: self.buffer_size,
        };
        Ok(Package::from_message(&request, self.inner.correlation_id)?
            .with_credentials(self.inner.credentials.clone()))
    }

    fn unsubscribe_package(&self) -> Package {
        Package::new(TcpCommand::UnsubscribeFromStream, self.inner.correlation_id)
            .with_credentials(self.inner.credentials.clone())
    }

    fn inspect_package(&mut self, package: &Package) -> InspectionResult {
        match package.command {
            TcpCommand::PersistentSubscriptionConfirmation => {
                let confirmation = match package.message::<PersistentSubscriptionConfirmation>() {
                    Ok(confirmation) => confirmation,
                    Err(e) => {
                        self.drop_subscription(SubscriptionDropReason::ServerError, Some(e));
                        return InspectionResult::end("malformed confirmation");
                    }
                };
                let _ = self.inner.subscription_id.set(confirmation.subscription_id);
                if let Some(tx) = self.confirmation.take() {
                    let _ = tx.send(Ok(()));
                }
                InspectionResult::new(
                    InspectionDecision::Subscribed,
                    "PersistentSubscriptionConfirmation",
                )
            }
            TcpCommand::PersistentSubscriptionStreamEventAppeared => {
                match package.message::<PersistentSubscriptionStreamEventAppeared>() {
                    Ok(appeared) if !self.inner.state.is_dropped() => {
                        let _ = self.deliveries.send(Delivery::Event(PersistentEvent {
                            event: appeared.event,
                            retry_count: appeared.retry_count,
                        }));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.drop_subscription(SubscriptionDropReason::ServerError, Some(e));
                        return InspectionResult::end("malformed event");
                    }
                }
                InspectionResult::new(
                    InspectionDecision::DoNothing,
                    "PersistentSubscriptionStreamEventAppeared",
                )
            }
            TcpCommand::SubscriptionDropped => {
                let (reason, error) = match package.message::<SubscriptionDropped>() {
                    Ok(dropped) => classify_server_drop(
                        dropped.reason,
                        self.inner.state.is_unsubscribe_requested(),
                        &self.inner.stream,
                        Some(&self.inner.group),
                    ),
                    Err(e) => (SubscriptionDropReason::Unknown, Some(e)),
                };
                self.drop_subscription(reason, error);
                InspectionResult::end(format!("SubscriptionDropped: {}", reason))
            }
            _ => match inspect_session_package(
                package,
                self.require_leader,
                "PersistentSubscriptionConfirmation",
            ) {
                SessionInspection::Decision(result) => result,
                SessionInspection::Drop(reason, error) => {
                    let description = error.to_string();
                    self.drop_subscription(reason, Some(error));
                    InspectionResult::end(description)
                }
            },
        }
    }

    fn drop_subscription(&mut self, reason: SubscriptionDropReason, error: Option<Error>) {
        if !self.inner.begin_drop() {
            return;
        }
        match self.confirmation.take() {
            Some(tx) => {
                let error = error.unwrap_or_else(|| {
                    Error::ServerError(format!("subscription dropped before confirmation: {}", reason))
                });
                debug!(
                    stream = %self.inner.stream,
                    group = %self.inner.group,
                    %reason,
                    "Persistent subscription failed before confirmation"
                );
                let _ = tx.send(Err(error));
                self.inner.state.complete();
            }
            None => {
                let _ = self.deliveries.send(Delivery::Dropped { reason, error });
            }
        }
    }

    fn is_dropped(&self) -> bool {
        self.inner.state.is_dropped()
    }

    fn is_unsubscribe_requested(&self) -> bool {
        self.inner.state.is_unsubscribe_requested()
    }
}

async fn run_worker<H: PersistentSubscriptionHandler>(
    mut handler: H,
    mut deliveries: mpsc::UnboundedReceiver<Delivery<PersistentEvent>>,
    subscription: PersistentSubscription,
    auto_ack: bool,
) {
    let inner = subscription.inner.clone();
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            Delivery::Event(event) => {
                // Unacked events go back to the group once it drops us.
                if inner.state.is_dropped() {
                    continue;
                }
                let Ok(permit) = inner.semaphore.clone().acquire_owned().await else {
                    continue;
                };
                let id = event.event_id();
                if let Some(id) = id {
                    inner.in_flight.insert(id, permit);
                }

                let result = guarded(handler.event_appeared(&subscription, event)).await;
                match (result, id) {
                    (Ok(()), Some(id)) if auto_ack => {
                        if let Err(e) = subscription.acknowledge_many([id]) {
                            debug!(error = %e, "Auto-ack skipped");
                        }
                    }
                    (Ok(()), _) => {}
                    (Err(error), Some(id)) if auto_ack => {
                        warn!(
                            group = %inner.group,
                            error = %error,
                            "Handler failed, parking event"
                        );
                        let parked = subscription.nak(
                            [id],
                            PersistentSubscriptionNakEventAction::Park,
                            error.to_string(),
                        );
                        if let Err(e) = parked {
                            debug!(error = %e, "Park nak skipped");
                        }
                    }
                    (Err(error), _) => {
                        if !inner.begin_drop() {
                            continue;
                        }
                        warn!(
                            group = %inner.group,
                            error = %error,
                            "Persistent subscription handler failed"
                        );
                        let _ = inner.requests.send(SubscriptionRequest::Unsubscribe {
                            correlation_id: inner.correlation_id,
                        });
                        guarded_drop(handler.subscription_dropped(
                            SubscriptionDropReason::EventHandlerException,
                            Some(Error::HandlerFailed(error.to_string())),
                        ))
                        .await;
                        inner.state.complete();
                        return;
                    }
                }
            }
            Delivery::Dropped { reason, error } => {
                debug!(group = %inner.group, %reason, "Persistent subscription dropped");
                guarded_drop(handler.subscription_dropped(reason, error)).await;
                inner.state.complete();
                return;
            }
        }
    }
    inner.state.complete();
}
