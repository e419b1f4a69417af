//! Push-based subscriptions.
//!
//! Three engines share the pieces in this module:
//!
//! | Engine | Module | Delivers |
//! |--------|--------|----------|
//! | Volatile | `volatile` | live events only, from the moment of confirmation |
//! | Catch-up | `catchup` | history from a checkpoint, then live events, without gaps or duplicates |
//! | Persistent | `persistent` | events from a server-side consumer group, with ack/nak |
//!
//! # Threading
//!
//! The connection actor never runs user code. Events pushed by the server are
//! queued to a per-subscription worker task, which calls the handler one event
//! at a time in arrival order. Handlers that return `Err` or panic drop the
//! subscription with [`SubscriptionDropReason::EventHandlerException`].
//!
//! # Dropping
//!
//! A subscription is dropped at most once. The first party to claim the
//! [`DropState`] guard (the actor on a server drop or connection loss, or the
//! worker on a handler failure) decides the reason; the handler's
//! `subscription_dropped` is then called exactly once and no further events
//! are delivered.
//!
//! A subscription that was never confirmed has no handle yet: the failure is
//! returned from the subscribe call instead and the drop callback is not
//! invoked.

mod catchup;
mod manager;
mod persistent;
mod volatile;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::ResolvedEvent;
use crate::operations::{InspectionResult, inspect_not_handled};
use crate::protocol::messages::SubscriptionDropWireReason;
use crate::protocol::{Package, TcpCommand};

pub use catchup::CatchUpSubscription;
pub use persistent::{PersistentEvent, PersistentSubscription};
pub use volatile::VolatileSubscription;

pub(crate) use catchup::{Checkpoint, spawn_catch_up};
pub(crate) use manager::{SubscriptionItem, SubscriptionOperation, SubscriptionsManager};
pub(crate) use persistent::{PersistentSubscriptionOperation, start_persistent};
pub(crate) use volatile::{VolatileSubscriptionOperation, start_volatile};

// =============================================================================
// Drop Reasons
// =============================================================================

/// Why a subscription stopped delivering events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionDropReason {
    /// The client asked to stop.
    Unsubscribed,
    /// The server ended the subscription without a client request.
    UserInitiated,
    NotAuthenticated,
    AccessDenied,
    SubscribingError,
    ServerError,
    ConnectionClosed,
    CatchUpError,
    ProcessingQueueOverflow,
    EventHandlerException,
    MaxSubscribersReached,
    PersistentSubscriptionDeleted,
    NotFound,
    Unknown,
}

impl fmt::Display for SubscriptionDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Map a server drop to a reason and the error a subscriber sees.
///
/// `group` is set for persistent subscriptions.
pub(crate) fn classify_server_drop(
    reason: SubscriptionDropWireReason,
    unsubscribe_requested: bool,
    stream: &str,
    group: Option<&str>,
) -> (SubscriptionDropReason, Option<Error>) {
    let target = if stream.is_empty() { "$all" } else { stream };
    match reason {
        SubscriptionDropWireReason::Unsubscribed if unsubscribe_requested => {
            (SubscriptionDropReason::Unsubscribed, None)
        }
        SubscriptionDropWireReason::Unsubscribed => (SubscriptionDropReason::UserInitiated, None),
        SubscriptionDropWireReason::AccessDenied => (
            SubscriptionDropReason::AccessDenied,
            Some(Error::AccessDenied(format!(
                "subscription to '{}' failed due to access denied",
                target
            ))),
        ),
        SubscriptionDropWireReason::NotFound => (
            SubscriptionDropReason::NotFound,
            Some(match group {
                Some(group) => Error::InvalidArgument(format!(
                    "subscription group '{}' on stream '{}' does not exist",
                    group, target
                )),
                None => Error::InvalidArgument(format!("stream '{}' does not exist", target)),
            }),
        ),
        SubscriptionDropWireReason::PersistentSubscriptionDeleted => (
            SubscriptionDropReason::PersistentSubscriptionDeleted,
            Some(Error::PersistentSubscriptionNotFound {
                stream: target.to_string(),
                group: group.unwrap_or_default().to_string(),
            }),
        ),
        SubscriptionDropWireReason::SubscriberMaxCountReached => (
            SubscriptionDropReason::MaxSubscribersReached,
            Some(Error::MaximumSubscribersReached {
                stream: target.to_string(),
                group: group.unwrap_or_default().to_string(),
            }),
        ),
    }
}

/// Outcome of inspecting a package that is not specific to one engine.
pub(crate) enum SessionInspection {
    Decision(InspectionResult),
    Drop(SubscriptionDropReason, Error),
}

/// Handle the commands any subscription can receive besides its own.
pub(crate) fn inspect_session_package(
    package: &Package,
    require_leader: bool,
    expected: &'static str,
) -> SessionInspection {
    match package.command {
        TcpCommand::NotAuthenticated => SessionInspection::Drop(
            SubscriptionDropReason::NotAuthenticated,
            Error::NotAuthenticated(package.data_as_text()),
        ),
        TcpCommand::BadRequest => SessionInspection::Drop(
            SubscriptionDropReason::ServerError,
            Error::ServerError(format!("bad request: {}", package.data_as_text())),
        ),
        TcpCommand::NotHandled => match inspect_not_handled(package, require_leader) {
            Ok(result) => SessionInspection::Decision(result),
            Err(e) => SessionInspection::Drop(SubscriptionDropReason::ServerError, e),
        },
        other => SessionInspection::Drop(
            SubscriptionDropReason::ServerError,
            Error::UnexpectedCommand {
                expected,
                actual: format!("{:?}", other),
            },
        ),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Error type user handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Callbacks for a volatile subscription.
#[async_trait]
pub trait SubscriptionHandler: Send + 'static {
    async fn event_appeared(&mut self, event: ResolvedEvent) -> HandlerResult;

    /// Called exactly once, after the last event.
    async fn subscription_dropped(
        &mut self,
        reason: SubscriptionDropReason,
        error: Option<Error>,
    ) {
        let _ = (reason, error);
    }
}

/// Callbacks for a catch-up subscription.
#[async_trait]
pub trait CatchUpHandler: Send + 'static {
    async fn event_appeared(&mut self, event: ResolvedEvent) -> HandlerResult;

    /// History is exhausted; events from here on are live.
    async fn live_processing_started(&mut self) {}

    async fn subscription_dropped(
        &mut self,
        reason: SubscriptionDropReason,
        error: Option<Error>,
    ) {
        let _ = (reason, error);
    }
}

/// Callbacks for a persistent subscription.
///
/// With `auto_ack` the subscription acknowledges after `event_appeared`
/// returns `Ok` and parks the event on `Err`. Without it, the handler must
/// call [`PersistentSubscription::acknowledge`] or
/// [`PersistentSubscription::fail`] itself.
#[async_trait]
pub trait PersistentSubscriptionHandler: Send + 'static {
    async fn event_appeared(
        &mut self,
        subscription: &PersistentSubscription,
        event: PersistentEvent,
    ) -> HandlerResult;

    async fn subscription_dropped(
        &mut self,
        reason: SubscriptionDropReason,
        error: Option<Error>,
    ) {
        let _ = (reason, error);
    }
}

/// Run a handler future, turning a panic into an error.
pub(crate) async fn guarded<F>(future: F) -> HandlerResult
where
    F: std::future::Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic.as_ref()).into()),
    }
}

/// Run a drop callback; a panic is logged and swallowed.
pub(crate) async fn guarded_drop<F>(future: F)
where
    F: std::future::Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
        tracing::warn!(
            panic = %panic_message(panic.as_ref()),
            "Subscription drop handler panicked"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// Drop-once guard plus a completion signal for `*_and_wait` calls.
pub(crate) struct DropState {
    dropped: AtomicBool,
    unsubscribe_requested: AtomicBool,
    done: watch::Sender<bool>,
}

impl DropState {
    pub(crate) fn new() -> Self {
        let (done, _) = watch::channel(false);
        DropState {
            dropped: AtomicBool::new(false),
            unsubscribe_requested: AtomicBool::new(false),
            done,
        }
    }

    /// Claim the drop. Returns `true` for the first caller only.
    pub(crate) fn try_begin(&self) -> bool {
        !self.dropped.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Record a client unsubscribe. Returns `true` the first time.
    pub(crate) fn request_unsubscribe(&self) -> bool {
        !self.unsubscribe_requested.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_unsubscribe_requested(&self) -> bool {
        self.unsubscribe_requested.load(Ordering::Acquire)
    }

    /// The drop callback has returned.
    pub(crate) fn complete(&self) {
        self.done.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) async fn wait(&self, timeout: Duration, operation: &'static str) -> Result<()> {
        let mut done = self.done.subscribe();
        match tokio::time::timeout(timeout, done.wait_for(|done| *done)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::OperationTimedOut {
                operation,
                elapsed: timeout,
            }),
        }
    }
}

/// Requests from subscription handles to the connection actor.
#[derive(Debug)]
pub(crate) enum SubscriptionRequest {
    /// Send a package on the current transport (acks, naks).
    Send(Package),
    /// Stop the subscription with this correlation id.
    Unsubscribe { correlation_id: Uuid },
}

/// Items queued to a subscription worker.
pub(crate) enum Delivery<E> {
    Event(E),
    Dropped {
        reason: SubscriptionDropReason,
        error: Option<Error>,
    },
}
