//! Subscription table owned by the connection actor.
//!
//! Unlike operations, a subscription keeps one correlation id for its whole
//! life: handles use it to unsubscribe and to ack, so it must survive
//! reconnects. A subscription that was confirmed on a connection that is now
//! gone is dropped with `ConnectionClosed`; one that was still waiting for its
//! confirmation is re-sent on the next connection.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use super::SubscriptionDropReason;
use crate::error::{Error, Result};
use crate::operations::InspectionResult;
use crate::protocol::Package;
use crate::settings::ConnectionSettings;
use crate::transport::PackageSink;
use crate::types::Attempts;

/// A subscription as seen by the dispatcher.
pub(crate) trait SubscriptionOperation: Send {
    fn name(&self) -> &'static str;

    /// Stable for the lifetime of the subscription.
    fn correlation_id(&self) -> Uuid;

    fn subscribe_package(&self) -> Result<Package>;

    fn unsubscribe_package(&self) -> Package;

    fn inspect_package(&mut self, package: &Package) -> InspectionResult;

    /// Idempotent; only the first call has an effect.
    fn drop_subscription(&mut self, reason: SubscriptionDropReason, error: Option<Error>);

    fn is_dropped(&self) -> bool;

    /// The client asked to stop this subscription.
    fn is_unsubscribe_requested(&self) -> bool;
}

pub(crate) struct SubscriptionItem {
    pub(crate) operation: Box<dyn SubscriptionOperation>,
    pub(crate) connection_id: Option<Uuid>,
    pub(crate) is_subscribed: bool,
    pub(crate) retry_count: u32,
    pub(crate) last_updated: Instant,
}

impl SubscriptionItem {
    fn correlation_id(&self) -> Uuid {
        self.operation.correlation_id()
    }
}

pub(crate) struct SubscriptionsManager {
    connection_name: String,
    max_retries: Attempts,
    operation_timeout: Duration,
    active: HashMap<Uuid, SubscriptionItem>,
    waiting: VecDeque<SubscriptionItem>,
    retry_pending: Vec<SubscriptionItem>,
}

impl SubscriptionsManager {
    pub(crate) fn new(connection_name: impl Into<String>, settings: &ConnectionSettings) -> Self {
        SubscriptionsManager {
            connection_name: connection_name.into(),
            max_retries: settings.max_retries,
            operation_timeout: settings.operation_timeout,
            active: HashMap::new(),
            waiting: VecDeque::new(),
            retry_pending: Vec::new(),
        }
    }

    pub(crate) fn enqueue_subscription(
        &mut self,
        operation: Box<dyn SubscriptionOperation>,
        now: Instant,
    ) {
        self.waiting.push_back(SubscriptionItem {
            operation,
            connection_id: None,
            is_subscribed: false,
            retry_count: 0,
            last_updated: now,
        });
    }

    pub(crate) fn start_waiting(&mut self, sink: &dyn PackageSink, now: Instant) {
        while let Some(item) = self.waiting.pop_front() {
            self.start_subscription(item, sink, now);
        }
    }

    pub(crate) fn start_subscription(
        &mut self,
        mut item: SubscriptionItem,
        sink: &dyn PackageSink,
        now: Instant,
    ) {
        if item.operation.is_dropped() {
            return;
        }

        let package = match item.operation.subscribe_package() {
            Ok(package) => package,
            Err(e) => {
                item.operation
                    .drop_subscription(SubscriptionDropReason::SubscribingError, Some(e));
                return;
            }
        };

        item.connection_id = Some(sink.connection_id());
        item.is_subscribed = false;
        item.last_updated = now;
        debug!(
            connection = %self.connection_name,
            subscription = item.operation.name(),
            correlation_id = %item.correlation_id(),
            retry_count = item.retry_count,
            "Starting subscription"
        );
        if let Err(e) = sink.send(package) {
            debug!(error = %e, "Send failed, subscription stays pending");
        }
        self.active.insert(item.correlation_id(), item);
    }

    pub(crate) fn get_active(&mut self, correlation_id: Uuid) -> Option<&mut SubscriptionItem> {
        self.active.get_mut(&correlation_id)
    }

    pub(crate) fn remove_subscription(&mut self, correlation_id: Uuid) -> Option<SubscriptionItem> {
        self.active.remove(&correlation_id)
    }

    /// Take a subscription that was never sent.
    pub(crate) fn remove_waiting(&mut self, correlation_id: Uuid) -> Option<SubscriptionItem> {
        let index = self
            .waiting
            .iter()
            .position(|item| item.correlation_id() == correlation_id)?;
        self.waiting.remove(index)
    }

    pub(crate) fn mark_subscribed(&mut self, correlation_id: Uuid) {
        if let Some(item) = self.active.get_mut(&correlation_id) {
            item.is_subscribed = true;
        }
    }

    pub(crate) fn schedule_subscription_retry(&mut self, mut item: SubscriptionItem) {
        if item.operation.is_dropped() {
            return;
        }
        if self.max_retries.is_exhausted(item.retry_count) {
            warn!(
                connection = %self.connection_name,
                subscription = item.operation.name(),
                retries = item.retry_count,
                "Subscription retry limit reached"
            );
            let error = Error::RetryLimitExceeded {
                operation: item.operation.name(),
                retries: item.retry_count,
            };
            item.operation
                .drop_subscription(SubscriptionDropReason::SubscribingError, Some(error));
            return;
        }
        item.retry_count += 1;
        self.retry_pending.push(item);
    }

    pub(crate) fn send_pending_retries(&mut self, sink: &dyn PackageSink, now: Instant) {
        for item in std::mem::take(&mut self.retry_pending) {
            self.start_subscription(item, sink, now);
        }
    }

    /// Drop confirmed subscriptions of a connection that just went away.
    ///
    /// A subscription the client was already unsubscribing ends as
    /// `Unsubscribed` and is never re-sent, confirmed or not.
    pub(crate) fn purge_subscribed_and_dropped(&mut self, connection_id: Uuid) {
        let doomed: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, item)| {
                item.operation.is_dropped()
                    || item.operation.is_unsubscribe_requested()
                    || (item.is_subscribed && item.connection_id == Some(connection_id))
            })
            .map(|(id, _)| *id)
            .collect();

        for correlation_id in doomed {
            let Some(mut item) = self.active.remove(&correlation_id) else {
                continue;
            };
            if item.operation.is_unsubscribe_requested() {
                item.operation
                    .drop_subscription(SubscriptionDropReason::Unsubscribed, None);
            } else {
                item.operation.drop_subscription(
                    SubscriptionDropReason::ConnectionClosed,
                    Some(Error::ConnectionClosed(format!(
                        "connection '{}' was lost",
                        self.connection_name
                    ))),
                );
            }
        }
    }

    /// Re-send unconfirmed subscriptions from a previous connection and drop
    /// those the server never confirmed in time.
    pub(crate) fn check_timeouts_and_retry(&mut self, sink: &dyn PackageSink, now: Instant) {
        let connection_id = sink.connection_id();
        let mut retries = Vec::new();
        let mut timed_out = Vec::new();

        for (correlation_id, item) in &self.active {
            if item.connection_id != Some(connection_id) {
                retries.push(*correlation_id);
            } else if !item.is_subscribed
                && !self.operation_timeout.is_zero()
                && now.saturating_duration_since(item.last_updated) > self.operation_timeout
            {
                timed_out.push(*correlation_id);
            }
        }

        for correlation_id in timed_out {
            if let Some(mut item) = self.active.remove(&correlation_id) {
                let elapsed = now.saturating_duration_since(item.last_updated);
                warn!(
                    connection = %self.connection_name,
                    subscription = item.operation.name(),
                    %correlation_id,
                    "Subscription was never confirmed"
                );
                let error = Error::OperationTimedOut {
                    operation: item.operation.name(),
                    elapsed,
                };
                item.operation
                    .drop_subscription(SubscriptionDropReason::SubscribingError, Some(error));
            }
        }

        for correlation_id in retries {
            if let Some(item) = self.active.remove(&correlation_id) {
                self.schedule_subscription_retry(item);
            }
        }

        self.send_pending_retries(sink, now);
        self.start_waiting(sink, now);
    }

    /// Drop every subscription.
    pub(crate) fn cleanup(&mut self, error: Error) {
        let active = self.active.drain().map(|(_, item)| item);
        let waiting = self.waiting.drain(..);
        let pending = self.retry_pending.drain(..);
        for mut item in active.chain(waiting).chain(pending) {
            item.operation
                .drop_subscription(SubscriptionDropReason::ConnectionClosed, Some(error.clone()));
        }
    }
}
