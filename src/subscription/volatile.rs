//! Live-only subscriptions to one stream or to `$all`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Delivery, DropState, SessionInspection, SubscriptionDropReason, SubscriptionHandler,
    SubscriptionOperation, SubscriptionRequest, classify_server_drop, guarded, guarded_drop,
    inspect_session_package,
};
use crate::error::{Error, Result};
use crate::event::ResolvedEvent;
use crate::operations::{InspectionDecision, InspectionResult};
use crate::protocol::messages::{
    StreamEventAppeared, SubscribeToStream, SubscriptionConfirmation, SubscriptionDropped,
};
use crate::protocol::{Package, TcpCommand};
use crate::types::UserCredentials;

#[derive(Debug, Clone, Copy)]
struct Confirmed {
    last_commit_position: i64,
    last_event_number: Option<i64>,
}

pub(crate) struct VolatileInner {
    stream: String,
    correlation_id: Uuid,
    confirmed: OnceLock<Confirmed>,
    state: DropState,
    requests: mpsc::UnboundedSender<SubscriptionRequest>,
}

/// Handle to a confirmed volatile subscription.
///
/// Cloning is cheap; every clone controls the same subscription.
#[derive(Clone)]
pub struct VolatileSubscription {
    inner: Arc<VolatileInner>,
}

impl std::fmt::Debug for VolatileSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileSubscription")
            .field("stream", &self.stream_id())
            .field("correlation_id", &self.inner.correlation_id)
            .field("dropped", &self.inner.state.is_dropped())
            .finish()
    }
}

impl VolatileSubscription {
    /// Subscribed stream; empty for `$all`.
    pub fn stream_id(&self) -> &str {
        &self.inner.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.inner.stream.is_empty()
    }

    /// Commit position of the log when the server confirmed the subscription.
    pub fn last_commit_position(&self) -> i64 {
        self.inner
            .confirmed
            .get()
            .map_or(-1, |c| c.last_commit_position)
    }

    /// Last event number of the stream at confirmation; `None` for `$all`
    /// and for streams that did not exist yet.
    pub fn last_event_number(&self) -> Option<i64> {
        self.inner.confirmed.get().and_then(|c| c.last_event_number)
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.state.is_dropped()
    }

    /// Ask the server to stop the subscription. Returns immediately.
    pub fn unsubscribe(&self) {
        if self.inner.state.request_unsubscribe() && !self.inner.state.is_dropped() {
            let _ = self.inner.requests.send(SubscriptionRequest::Unsubscribe {
                correlation_id: self.inner.correlation_id,
            });
        }
    }

    /// Unsubscribe and wait until the drop callback has returned.
    pub async fn unsubscribe_and_wait(&self, timeout: Duration) -> Result<()> {
        self.unsubscribe();
        self.inner.state.wait(timeout, "Unsubscribe").await
    }

    pub(crate) fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    pub(crate) fn drop_state(&self) -> &DropState {
        &self.inner.state
    }
}

/// The dispatcher-side half of a volatile subscription.
pub(crate) struct VolatileSubscriptionOperation {
    inner: Arc<VolatileInner>,
    resolve_link_tos: bool,
    credentials: Option<UserCredentials>,
    require_leader: bool,
    confirmation: Option<oneshot::Sender<Result<()>>>,
    deliveries: mpsc::UnboundedSender<Delivery<ResolvedEvent>>,
}

/// Build a volatile subscription and spawn its worker.
///
/// The returned receiver resolves once the server confirms (or refuses) the
/// subscription; only then is the handle handed to the caller.
pub(crate) fn start_volatile<H: SubscriptionHandler>(
    stream: String,
    resolve_link_tos: bool,
    credentials: Option<UserCredentials>,
    require_leader: bool,
    requests: mpsc::UnboundedSender<SubscriptionRequest>,
    handler: H,
) -> (
    VolatileSubscriptionOperation,
    VolatileSubscription,
    oneshot::Receiver<Result<()>>,
) {
    let inner = Arc::new(VolatileInner {
        stream,
        correlation_id: Uuid::new_v4(),
        confirmed: OnceLock::new(),
        state: DropState::new(),
        requests,
    });
    let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
    let (confirmation, confirmation_rx) = oneshot::channel();

    tokio::spawn(run_worker(handler, deliveries_rx, inner.clone()));

    let operation = VolatileSubscriptionOperation {
        inner: inner.clone(),
        resolve_link_tos,
        credentials,
        require_leader,
        confirmation: Some(confirmation),
        deliveries,
    };
    (operation, VolatileSubscription { inner }, confirmation_rx)
}

impl SubscriptionOperation for VolatileSubscriptionOperation {
    fn name(&self) -> &'static str {
        "SubscribeToStream"
    }

    fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    fn subscribe_package(&self) -> Result<Package> {
        let request = SubscribeToStream {
            event_stream_id: self.inner.stream.clone(),
            resolve_link_tos: self.resolve_link_tos,
        };
        Ok(Package::from_message(&request, self.inner.correlation_id)?
            .with_credentials(self.credentials.clone()))
    }

    fn unsubscribe_package(&self) -> Package {
        Package::new(TcpCommand::UnsubscribeFromStream, self.inner.correlation_id)
            .with_credentials(self.credentials.clone())
    }

    fn inspect_package(&mut self, package: &Package) -> InspectionResult {
        match package.command {
            TcpCommand::SubscriptionConfirmation => {
                let confirmation = match package.message::<SubscriptionConfirmation>() {
                    Ok(confirmation) => confirmation,
                    Err(e) => {
                        self.drop_subscription(SubscriptionDropReason::ServerError, Some(e));
                        return InspectionResult::end("malformed confirmation");
                    }
                };
                let _ = self.inner.confirmed.set(Confirmed {
                    last_commit_position: confirmation.last_commit_position,
                    last_event_number: confirmation.last_event_number,
                });
                if let Some(tx) = self.confirmation.take() {
                    let _ = tx.send(Ok(()));
                }
                InspectionResult::new(InspectionDecision::Subscribed, "SubscriptionConfirmation")
            }
            TcpCommand::StreamEventAppeared => {
                match package.message::<StreamEventAppeared>() {
                    Ok(appeared) if !self.inner.state.is_dropped() => {
                        let _ = self.deliveries.send(Delivery::Event(appeared.event));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.drop_subscription(SubscriptionDropReason::ServerError, Some(e));
                        return InspectionResult::end("malformed event");
                    }
                }
                InspectionResult::new(InspectionDecision::DoNothing, "StreamEventAppeared")
            }
            TcpCommand::SubscriptionDropped => {
                let (reason, error) = match package.message::<SubscriptionDropped>() {
                    Ok(dropped) => classify_server_drop(
                        dropped.reason,
                        self.inner.state.is_unsubscribe_requested(),
                        &self.inner.stream,
                        None,
                    ),
                    Err(e) => (SubscriptionDropReason::Unknown, Some(e)),
                };
                self.drop_subscription(reason, error);
                InspectionResult::end(format!("SubscriptionDropped: {}", reason))
            }
            _ => match inspect_session_package(package, self.require_leader, "SubscriptionConfirmation") {
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
        if !self.inner.state.try_begin() {
            return;
        }
        match self.confirmation.take() {
            Some(tx) => {
                let error = error.unwrap_or_else(|| {
                    Error::ServerError(format!("subscription dropped before confirmation: {}", reason))
                });
                debug!(stream = %self.inner.stream, %reason, "Subscription failed before confirmation");
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

async fn run_worker<H: SubscriptionHandler>(
    mut handler: H,
    mut deliveries: mpsc::UnboundedReceiver<Delivery<ResolvedEvent>>,
    inner: Arc<VolatileInner>,
) {
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            // Events queued before the drop are still handed out in order.
            Delivery::Event(event) => {
                let Err(error) = guarded(handler.event_appeared(event)).await else {
                    continue;
                };
                if !inner.state.try_begin() {
                    continue;
                }
                warn!(stream = %inner.stream, error = %error, "Subscription handler failed");
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
            Delivery::Dropped { reason, error } => {
                debug!(stream = %inner.stream, %reason, "Subscription dropped");
                guarded_drop(handler.subscription_dropped(reason, error)).await;
                inner.state.complete();
                return;
            }
        }
    }
    // Never confirmed, or the dispatcher went away without a drop.
    inner.state.complete();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::event::RecordedEvent;
    use crate::protocol::messages::SubscriptionDropWireReason;
    use crate::subscription::HandlerResult;

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<std::sync::Mutex<Vec<i64>>>,
        drops: Arc<std::sync::Mutex<Vec<SubscriptionDropReason>>>,
        fail_on: Option<i64>,
    }

    #[async_trait::async_trait]
    impl SubscriptionHandler for Recorder {
        async fn event_appeared(&mut self, event: ResolvedEvent) -> HandlerResult {
            let number = event.original_event_number().unwrap_or(-1);
            if Some(number) == self.fail_on {
                return Err("cannot handle".into());
            }
            self.events.lock().unwrap().push(number);
            Ok(())
        }

        async fn subscription_dropped(
            &mut self,
            reason: SubscriptionDropReason,
            _error: Option<Error>,
        ) {
            self.drops.lock().unwrap().push(reason);
        }
    }

    fn appeared(correlation_id: Uuid, number: i64) -> Package {
        let event = ResolvedEvent {
            event: Some(RecordedEvent {
                stream_id: "orders".to_string(),
                event_id: Uuid::new_v4(),
                event_number: number,
                event_type: "OrderPlaced".to_string(),
                data: Bytes::new(),
                metadata: Bytes::new(),
                is_json: false,
                created_epoch_ms: 0,
            }),
            link: None,
            original_position: None,
        };
        Package::from_message(&StreamEventAppeared { event }, correlation_id).unwrap()
    }

    fn confirm(op: &mut VolatileSubscriptionOperation) {
        let package = Package::from_message(
            &SubscriptionConfirmation {
                last_commit_position: 100,
                last_event_number: Some(4),
            },
            op.correlation_id(),
        )
        .unwrap();
        assert_eq!(
            op.inspect_package(&package).decision,
            InspectionDecision::Subscribed
        );
    }

    #[tokio::test]
    async fn test_confirm_deliver_and_drop_once() {
        let recorder = Recorder::default();
        let (requests, _requests_rx) = mpsc::unbounded_channel();
        let (mut op, handle, confirmed) =
            start_volatile("orders".into(), false, None, true, requests, recorder.clone());

        confirm(&mut op);
        confirmed.await.unwrap().unwrap();
        assert_eq!(handle.last_event_number(), Some(4));
        assert_eq!(handle.last_commit_position(), 100);

        let id = op.correlation_id();
        op.inspect_package(&appeared(id, 5));
        op.inspect_package(&appeared(id, 6));

        let dropped = Package::from_message(
            &SubscriptionDropped {
                reason: SubscriptionDropWireReason::AccessDenied,
            },
            id,
        )
        .unwrap();
        op.inspect_package(&dropped);
        op.drop_subscription(SubscriptionDropReason::ConnectionClosed, None);

        handle
            .inner
            .state
            .wait(Duration::from_secs(1), "test")
            .await
            .unwrap();
        assert_eq!(*recorder.events.lock().unwrap(), vec![5, 6]);
        assert_eq!(
            *recorder.drops.lock().unwrap(),
            vec![SubscriptionDropReason::AccessDenied]
        );
    }

    #[tokio::test]
    async fn test_handler_error_unsubscribes() {
        let recorder = Recorder {
            fail_on: Some(1),
            ..Recorder::default()
        };
        let (requests, mut requests_rx) = mpsc::unbounded_channel();
        let (mut op, handle, _confirmed) =
            start_volatile("orders".into(), false, None, true, requests, recorder.clone());
        confirm(&mut op);

        let id = op.correlation_id();
        for number in 0..3 {
            op.inspect_package(&appeared(id, number));
        }

        match requests_rx.recv().await.unwrap() {
            SubscriptionRequest::Unsubscribe { correlation_id } => assert_eq!(correlation_id, id),
            other => panic!("unexpected request {:?}", other),
        }
        handle
            .inner
            .state
            .wait(Duration::from_secs(1), "test")
            .await
            .unwrap();
        assert_eq!(*recorder.events.lock().unwrap(), vec![0]);
        assert_eq!(
            *recorder.drops.lock().unwrap(),
            vec![SubscriptionDropReason::EventHandlerException]
        );
        assert!(op.is_dropped());
    }

    #[tokio::test]
    async fn test_refused_before_confirmation() {
        let recorder = Recorder::default();
        let (requests, _requests_rx) = mpsc::unbounded_channel();
        let (mut op, _handle, confirmed) =
            start_volatile("orders".into(), false, None, true, requests, recorder.clone());

        let dropped = Package::from_message(
            &SubscriptionDropped {
                reason: SubscriptionDropWireReason::AccessDenied,
            },
            op.correlation_id(),
        )
        .unwrap();
        op.inspect_package(&dropped);

        assert!(matches!(confirmed.await.unwrap(), Err(Error::AccessDenied(_))));
        drop(op);
        tokio::task::yield_now().await;
        assert!(recorder.drops.lock().unwrap().is_empty());
    }
}
