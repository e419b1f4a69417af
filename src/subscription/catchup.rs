//! Catch-up subscriptions: history from a checkpoint, then live events.
//!
//! # Phases
//!
//! | Phase | Does |
//! |-------|------|
//! | `ReadingHistory` | pages forward from the checkpoint until the end of the stream or log |
//! | `Subscribing` | opens a volatile subscription; its events are buffered, not delivered |
//! | `Reconciling` | reads the gap up to the confirmation point, then drains the buffer |
//! | `Live` | delivers buffered-then-live events as they arrive |
//!
//! Every delivery goes through [`Checkpoint::advance`], so the handler sees
//! strictly increasing event numbers (or positions for `$all`) whichever phase
//! produced the event. A failed read or subscribe drops with `CatchUpError`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    CatchUpHandler, DropState, HandlerResult, SubscriptionDropReason, SubscriptionHandler,
    VolatileSubscription, guarded, guarded_drop,
};
use crate::connection::EventStoreConnection;
use crate::error::{Error, Result};
use crate::event::{ResolvedEvent, SliceReadStatus};
use crate::settings::CatchUpSubscriptionSettings;
use crate::types::Position;

/// Last processed event of a catch-up subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    /// Event number in the subscribed stream.
    Stream(Option<i64>),
    /// Position in the `$all` log.
    All(Option<Position>),
}

impl Checkpoint {
    /// The checkpoint after `event`, or `None` when `event` was already seen.
    pub(crate) fn advance(&self, event: &ResolvedEvent) -> Option<Checkpoint> {
        match *self {
            Checkpoint::Stream(last) => {
                let number = event.original_event_number()?;
                match last {
                    Some(last) if number <= last => None,
                    _ => Some(Checkpoint::Stream(Some(number))),
                }
            }
            Checkpoint::All(last) => {
                let position = event.original_position?;
                match last {
                    Some(last) if position <= last => None,
                    _ => Some(Checkpoint::All(Some(position))),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatchUpPhase {
    ReadingHistory,
    Subscribing,
    Reconciling,
    Live,
}

struct CatchUpInner {
    stream: String,
    state: DropState,
    stop: watch::Sender<bool>,
    live: AtomicBool,
    checkpoint: Mutex<Checkpoint>,
}

/// Handle to a running catch-up subscription.
#[derive(Clone)]
pub struct CatchUpSubscription {
    inner: Arc<CatchUpInner>,
}

impl std::fmt::Debug for CatchUpSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchUpSubscription")
            .field("stream", &self.inner.stream)
            .field("live", &self.is_live())
            .field("dropped", &self.inner.state.is_dropped())
            .finish()
    }
}

impl CatchUpSubscription {
    /// Subscribed stream; empty for `$all`.
    pub fn stream_id(&self) -> &str {
        &self.inner.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.inner.stream.is_empty()
    }

    /// History is exhausted and `live_processing_started` has been called.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.state.is_dropped()
    }

    pub fn last_processed_event_number(&self) -> Option<i64> {
        match self.checkpoint() {
            Checkpoint::Stream(last) => last,
            Checkpoint::All(_) => None,
        }
    }

    pub fn last_processed_position(&self) -> Option<Position> {
        match self.checkpoint() {
            Checkpoint::All(last) => last,
            Checkpoint::Stream(_) => None,
        }
    }

    /// Stop the subscription and wait until the drop callback returned.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.inner.stop.send_replace(true);
        self.inner.state.wait(timeout, "StopCatchUpSubscription").await
    }

    fn checkpoint(&self) -> Checkpoint {
        match self.inner.checkpoint.lock() {
            Ok(checkpoint) => *checkpoint,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Start a catch-up subscription on its own task.
///
/// `stream` is empty for `$all`; `checkpoint` must match the target.
pub(crate) fn spawn_catch_up<H: CatchUpHandler>(
    connection: EventStoreConnection,
    stream: String,
    checkpoint: Checkpoint,
    settings: CatchUpSubscriptionSettings,
    handler: H,
) -> CatchUpSubscription {
    let (stop, stop_rx) = watch::channel(false);
    let inner = Arc::new(CatchUpInner {
        stream,
        state: DropState::new(),
        stop,
        live: AtomicBool::new(false),
        checkpoint: Mutex::new(checkpoint),
    });
    let engine = CatchUpEngine {
        connection,
        settings,
        handler,
        inner: inner.clone(),
        checkpoint,
        phase: CatchUpPhase::ReadingHistory,
        stop: stop_rx,
        live: None,
    };
    tokio::spawn(engine.run());
    CatchUpSubscription { inner }
}

// =============================================================================
// Live Forwarding
// =============================================================================

enum LiveItem {
    Event(ResolvedEvent),
    Overflow,
    Dropped(SubscriptionDropReason, Option<Error>),
}

/// Handler of the inner volatile subscription; queues everything for the engine.
struct LiveForwarder {
    items: mpsc::UnboundedSender<LiveItem>,
    queued: Arc<AtomicUsize>,
    max_queued: usize,
}

#[async_trait::async_trait]
impl SubscriptionHandler for LiveForwarder {
    async fn event_appeared(&mut self, event: ResolvedEvent) -> HandlerResult {
        let queued = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        let item = if queued > self.max_queued {
            LiveItem::Overflow
        } else {
            LiveItem::Event(event)
        };
        let _ = self.items.send(item);
        Ok(())
    }

    async fn subscription_dropped(&mut self, reason: SubscriptionDropReason, error: Option<Error>) {
        let _ = self.items.send(LiveItem::Dropped(reason, error));
    }
}

// =============================================================================
// Engine
// =============================================================================

enum Halt {
    Stopped,
    Dropped(SubscriptionDropReason, Option<Error>),
}

fn catch_up_error(error: Error) -> Halt {
    Halt::Dropped(SubscriptionDropReason::CatchUpError, Some(error))
}

/// Resolve `future` unless a stop is requested first.
async fn until_stopped<T>(
    stop: &mut watch::Receiver<bool>,
    future: impl std::future::Future<Output = T>,
) -> std::result::Result<T, Halt> {
    tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => Err(Halt::Stopped),
        value = future => Ok(value),
    }
}

struct CatchUpEngine<H> {
    connection: EventStoreConnection,
    settings: CatchUpSubscriptionSettings,
    handler: H,
    inner: Arc<CatchUpInner>,
    checkpoint: Checkpoint,
    phase: CatchUpPhase,
    stop: watch::Receiver<bool>,
    live: Option<VolatileSubscription>,
}

impl<H: CatchUpHandler> CatchUpEngine<H> {
    fn name(&self) -> &str {
        match &self.settings.subscription_name {
            Some(name) => name,
            None if self.inner.stream.is_empty() => "$all",
            None => &self.inner.stream,
        }
    }

    async fn run(mut self) {
        let halt = match self.process().await {
            Ok(()) => Halt::Dropped(SubscriptionDropReason::Unknown, None),
            Err(halt) => halt,
        };
        let (reason, error) = match halt {
            Halt::Stopped => (SubscriptionDropReason::Unsubscribed, None),
            Halt::Dropped(reason, error) => (reason, error),
        };
        if let Some(live) = self.live.take() {
            live.unsubscribe();
        }
        if self.inner.state.try_begin() {
            match &error {
                Some(e) => warn!(
                    subscription = %self.name(),
                    phase = ?self.phase,
                    %reason,
                    error = %e,
                    "Catch-up subscription dropped"
                ),
                None => debug!(
                    subscription = %self.name(),
                    phase = ?self.phase,
                    %reason,
                    "Catch-up subscription dropped"
                ),
            }
            guarded_drop(self.handler.subscription_dropped(reason, error)).await;
        }
        self.inner.state.complete();
    }

    async fn process(&mut self) -> std::result::Result<(), Halt> {
        self.read_history(None).await?;

        self.phase = CatchUpPhase::Subscribing;
        let (items, mut items_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let forwarder = LiveForwarder {
            items,
            queued: queued.clone(),
            max_queued: self.settings.max_live_queue_size,
        };
        let resolve_link_tos = self.settings.resolve_link_tos;
        let subscribed = if self.inner.stream.is_empty() {
            until_stopped(
                &mut self.stop,
                self.connection.subscribe_to_all(resolve_link_tos, forwarder),
            )
            .await?
        } else {
            until_stopped(
                &mut self.stop,
                self.connection
                    .subscribe_to_stream(&self.inner.stream, resolve_link_tos, forwarder),
            )
            .await?
        };
        let live = subscribed.map_err(catch_up_error)?;
        self.live = Some(live.clone());

        self.phase = CatchUpPhase::Reconciling;
        match self.checkpoint {
            Checkpoint::Stream(last) => {
                let till = live.last_event_number();
                if let Some(till) = till.filter(|till| last.is_none_or(|last| last < *till)) {
                    self.read_history(Some(till)).await?;
                }
            }
            Checkpoint::All(last) => {
                let till = live.last_commit_position();
                if last.is_none_or(|last| last.commit < till) {
                    self.read_history(Some(till)).await?;
                }
            }
        }
        while let Ok(item) = items_rx.try_recv() {
            self.handle_live(item, &queued).await?;
        }

        self.phase = CatchUpPhase::Live;
        info!(subscription = %self.name(), checkpoint = ?self.checkpoint, "Live processing started");
        let handler = &mut self.handler;
        guarded(async move {
            handler.live_processing_started().await;
            Ok(())
        })
        .await
        .map_err(|e| {
            Halt::Dropped(
                SubscriptionDropReason::EventHandlerException,
                Some(Error::HandlerFailed(e.to_string())),
            )
        })?;
        self.inner.live.store(true, Ordering::Release);

        loop {
            match until_stopped(&mut self.stop, items_rx.recv()).await? {
                Some(item) => self.handle_live(item, &queued).await?,
                None => {
                    return Err(Halt::Dropped(
                        SubscriptionDropReason::ConnectionClosed,
                        None,
                    ));
                }
            }
        }
    }

    /// Page forward from the checkpoint. With `till`, stop once past it.
    async fn read_history(&mut self, till: Option<i64>) -> std::result::Result<(), Halt> {
        let batch = self.settings.read_batch_size;
        let resolve_link_tos = self.settings.resolve_link_tos;
        match self.checkpoint {
            Checkpoint::Stream(last) => {
                let mut from = last.map_or(0, |last| last + 1);
                loop {
                    let slice = until_stopped(
                        &mut self.stop,
                        self.connection.read_stream_events_forward(
                            &self.inner.stream,
                            from,
                            batch,
                            resolve_link_tos,
                        ),
                    )
                    .await?
                    .map_err(catch_up_error)?;

                    match slice.status {
                        SliceReadStatus::Success => {}
                        SliceReadStatus::StreamNotFound => return Ok(()),
                        SliceReadStatus::StreamDeleted => {
                            return Err(catch_up_error(Error::StreamDeleted(
                                self.inner.stream.clone(),
                            )));
                        }
                    }
                    for event in slice.events {
                        self.deliver(event).await?;
                    }
                    let done = slice.is_end_of_stream
                        || till.is_some_and(|till| slice.next_event_number > till);
                    if done {
                        return Ok(());
                    }
                    from = slice.next_event_number;
                }
            }
            Checkpoint::All(last) => {
                let mut position = last.unwrap_or(Position::START);
                loop {
                    let slice = until_stopped(
                        &mut self.stop,
                        self.connection
                            .read_all_events_forward(position, batch, resolve_link_tos),
                    )
                    .await?
                    .map_err(catch_up_error)?;

                    for event in slice.events {
                        self.deliver(event).await?;
                    }
                    let done = slice.is_end_of_stream
                        || till.is_some_and(|till| slice.next_position.commit >= till);
                    if done {
                        return Ok(());
                    }
                    position = slice.next_position;
                }
            }
        }
    }

    async fn handle_live(
        &mut self,
        item: LiveItem,
        queued: &AtomicUsize,
    ) -> std::result::Result<(), Halt> {
        match item {
            LiveItem::Event(event) => {
                queued.fetch_sub(1, Ordering::AcqRel);
                self.deliver(event).await
            }
            LiveItem::Overflow => Err(Halt::Dropped(
                SubscriptionDropReason::ProcessingQueueOverflow,
                None,
            )),
            LiveItem::Dropped(reason, error) => Err(Halt::Dropped(reason, error)),
        }
    }

    async fn deliver(&mut self, event: ResolvedEvent) -> std::result::Result<(), Halt> {
        if *self.stop.borrow() {
            return Err(Halt::Stopped);
        }
        let Some(next) = self.checkpoint.advance(&event) else {
            return Ok(());
        };
        guarded(self.handler.event_appeared(event))
            .await
            .map_err(|e| {
                Halt::Dropped(
                    SubscriptionDropReason::EventHandlerException,
                    Some(Error::HandlerFailed(e.to_string())),
                )
            })?;
        self.checkpoint = next;
        match self.inner.checkpoint.lock() {
            Ok(mut checkpoint) => *checkpoint = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::event::RecordedEvent;

    fn event(number: i64, position: Option<Position>) -> ResolvedEvent {
        ResolvedEvent {
            event: Some(RecordedEvent {
                stream_id: "orders".to_string(),
                event_id: uuid::Uuid::new_v4(),
                event_number: number,
                event_type: "OrderPlaced".to_string(),
                data: Bytes::new(),
                metadata: Bytes::new(),
                is_json: false,
                created_epoch_ms: 0,
            }),
            link: None,
            original_position: position,
        }
    }

    #[test]
    fn test_stream_checkpoint_skips_seen_events() {
        let start = Checkpoint::Stream(None);
        let after_zero = start.advance(&event(0, None)).unwrap();
        assert_eq!(after_zero, Checkpoint::Stream(Some(0)));

        assert_eq!(after_zero.advance(&event(0, None)), None);
        assert_eq!(
            after_zero.advance(&event(3, None)),
            Some(Checkpoint::Stream(Some(3)))
        );

        let resumed = Checkpoint::Stream(Some(10));
        assert_eq!(resumed.advance(&event(7, None)), None);
    }

    #[test]
    fn test_all_checkpoint_orders_by_position() {
        let at = |commit| Some(Position::new(commit, commit));
        let checkpoint = Checkpoint::All(at(100));

        assert_eq!(checkpoint.advance(&event(0, at(100))), None);
        assert_eq!(checkpoint.advance(&event(0, at(50))), None);
        assert_eq!(
            checkpoint.advance(&event(0, at(150))),
            Some(Checkpoint::All(at(150)))
        );
        // Events without a position cannot be placed in the log.
        assert_eq!(checkpoint.advance(&event(0, None)), None);
    }

    #[tokio::test]
    async fn test_live_forwarder_overflow() {
        let (items, mut items_rx) = mpsc::unbounded_channel();
        let mut forwarder = LiveForwarder {
            items,
            queued: Arc::new(AtomicUsize::new(0)),
            max_queued: 2,
        };
        for number in 0..3 {
            forwarder.event_appeared(event(number, None)).await.unwrap();
        }

        assert!(matches!(items_rx.recv().await, Some(LiveItem::Event(_))));
        assert!(matches!(items_rx.recv().await, Some(LiveItem::Event(_))));
        assert!(matches!(items_rx.recv().await, Some(LiveItem::Overflow)));
    }
}
