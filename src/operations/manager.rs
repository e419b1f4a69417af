//! Correlation table for in-flight operations.
//!
//! Owned by the connection actor; nothing here is shared across tasks.
//!
//! An operation lives in exactly one of three places:
//!
//! - `waiting`: accepted but not sent, because the connection is not ready or
//!   `max_concurrent_items` operations are already in flight
//! - `active`: sent, keyed by the correlation id of the last send
//! - `retry_pending`: about to be re-sent with a fresh correlation id
//!
//! Retries keep the operation's creation order, so a burst of operations that
//! all fail over to a new connection is re-sent in the order it was issued.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use super::ClientOperation;
use crate::error::Error;
use crate::settings::ConnectionSettings;
use crate::transport::PackageSink;
use crate::types::Attempts;

pub(crate) struct OperationItem {
    pub(crate) operation: Box<dyn ClientOperation>,
    pub(crate) correlation_id: Uuid,
    pub(crate) connection_id: Option<Uuid>,
    pub(crate) retry_count: u32,
    pub(crate) created: Instant,
    pub(crate) last_updated: Instant,
    sequence: u64,
}

impl OperationItem {
    fn name(&self) -> &'static str {
        self.operation.name()
    }
}

pub(crate) struct OperationsManager {
    connection_name: String,
    max_queue_size: usize,
    max_concurrent_items: usize,
    max_retries: Attempts,
    operation_timeout: Duration,
    fail_on_no_server_response: bool,
    active: HashMap<Uuid, OperationItem>,
    waiting: VecDeque<OperationItem>,
    retry_pending: Vec<OperationItem>,
    next_sequence: u64,
}

impl OperationsManager {
    pub(crate) fn new(connection_name: impl Into<String>, settings: &ConnectionSettings) -> Self {
        OperationsManager {
            connection_name: connection_name.into(),
            max_queue_size: settings.max_queue_size,
            max_concurrent_items: settings.max_concurrent_items,
            max_retries: settings.max_retries,
            operation_timeout: settings.operation_timeout,
            fail_on_no_server_response: settings.fail_on_no_server_response,
            active: HashMap::new(),
            waiting: VecDeque::new(),
            retry_pending: Vec::new(),
            next_sequence: 0,
        }
    }

    pub(crate) fn total_operation_count(&self) -> usize {
        self.active.len() + self.waiting.len() + self.retry_pending.len()
    }

    /// Accept an operation; it is sent by the next scheduling pass.
    pub(crate) fn enqueue_operation(&mut self, mut operation: Box<dyn ClientOperation>, now: Instant) {
        if self.total_operation_count() >= self.max_queue_size {
            warn!(
                connection = %self.connection_name,
                operation = operation.name(),
                max_queue_size = self.max_queue_size,
                "Operation queue is full"
            );
            operation.fail(Error::OperationQueueFull(self.max_queue_size));
            return;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.waiting.push_back(OperationItem {
            operation,
            correlation_id: Uuid::new_v4(),
            connection_id: None,
            retry_count: 0,
            created: now,
            last_updated: now,
            sequence,
        });
    }

    pub(crate) fn schedule_waiting_operations(&mut self, sink: &dyn PackageSink, now: Instant) {
        while self.active.len() < self.max_concurrent_items {
            match self.waiting.pop_front() {
                Some(item) => self.schedule_operation(item, sink, now),
                None => break,
            }
        }
    }

    /// Send `item` now, or park it in `waiting` when too many are in flight.
    pub(crate) fn schedule_operation(
        &mut self,
        mut item: OperationItem,
        sink: &dyn PackageSink,
        now: Instant,
    ) {
        if self.active.len() >= self.max_concurrent_items {
            self.waiting.push_back(item);
            return;
        }

        let package = match item.operation.create_network_package(item.correlation_id) {
            Ok(package) => package,
            Err(e) => {
                warn!(operation = item.name(), error = %e, "Failed to build request package");
                item.operation.fail(e);
                return;
            }
        };

        item.connection_id = Some(sink.connection_id());
        item.last_updated = now;
        debug!(
            connection = %self.connection_name,
            operation = item.name(),
            correlation_id = %item.correlation_id,
            retry_count = item.retry_count,
            "Sending operation"
        );

        // A failed send is recovered by the connection-id check after reconnect.
        if let Err(e) = sink.send(package) {
            debug!(operation = item.name(), error = %e, "Send failed, operation stays pending");
        }
        self.active.insert(item.correlation_id, item);
    }

    pub(crate) fn get_active(&mut self, correlation_id: Uuid) -> Option<&mut OperationItem> {
        self.active.get_mut(&correlation_id)
    }

    pub(crate) fn remove_operation(&mut self, correlation_id: Uuid) -> Option<OperationItem> {
        self.active.remove(&correlation_id)
    }

    /// Queue `item` for a re-send under a new correlation id, or fail it when
    /// the retry budget is spent.
    pub(crate) fn schedule_operation_retry(&mut self, mut item: OperationItem) {
        if self.max_retries.is_exhausted(item.retry_count) {
            warn!(
                connection = %self.connection_name,
                operation = item.name(),
                retries = item.retry_count,
                "Retry limit reached"
            );
            let error = Error::RetryLimitExceeded {
                operation: item.name(),
                retries: item.retry_count,
            };
            item.operation.fail(error);
            return;
        }

        debug!(
            operation = item.name(),
            old_correlation_id = %item.correlation_id,
            retry_count = item.retry_count + 1,
            "Retrying operation"
        );
        item.correlation_id = Uuid::new_v4();
        item.retry_count += 1;
        self.retry_pending.push(item);
    }

    pub(crate) fn send_pending_retries(&mut self, sink: &dyn PackageSink, now: Instant) {
        if self.retry_pending.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut self.retry_pending);
        pending.sort_by_key(|item| item.sequence);
        for item in pending {
            self.schedule_operation(item, sink, now);
        }
    }

    /// Periodic sweep: re-send operations from a previous connection, time
    /// out silent ones, then fill free slots from `waiting`.
    pub(crate) fn check_timeouts_and_retry(&mut self, sink: &dyn PackageSink, now: Instant) {
        let connection_id = sink.connection_id();
        let mut retries = Vec::new();
        let mut timed_out = Vec::new();

        for (correlation_id, item) in &self.active {
            if item.connection_id != Some(connection_id) {
                retries.push(*correlation_id);
            // Measured from the last send or server progress, not from
            // creation: every retry gets a full timeout window.
            } else if !self.operation_timeout.is_zero()
                && now.saturating_duration_since(item.last_updated) > self.operation_timeout
            {
                if self.fail_on_no_server_response {
                    timed_out.push(*correlation_id);
                } else {
                    retries.push(*correlation_id);
                }
            }
        }

        for correlation_id in timed_out {
            if let Some(mut item) = self.active.remove(&correlation_id) {
                let elapsed = now.saturating_duration_since(item.created);
                warn!(
                    connection = %self.connection_name,
                    operation = item.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Operation timed out"
                );
                let error = Error::OperationTimedOut {
                    operation: item.name(),
                    elapsed,
                };
                item.operation.fail(error);
            }
        }

        for correlation_id in retries {
            if let Some(item) = self.active.remove(&correlation_id) {
                self.schedule_operation_retry(item);
            }
        }

        self.send_pending_retries(sink, now);
        self.schedule_waiting_operations(sink, now);
    }

    /// Fail every tracked operation.
    pub(crate) fn cleanup(&mut self, error: Error) {
        let active = self.active.drain().map(|(_, item)| item);
        let waiting = self.waiting.drain(..);
        let pending = self.retry_pending.drain(..);
        for mut item in active.chain(waiting).chain(pending) {
            item.operation.fail(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::Result;
    use crate::operations::InspectionResult;
    use crate::operations::test_support::RecordingSink;
    use crate::protocol::{Package, TcpCommand};

    type Failures = Arc<Mutex<Vec<Error>>>;

    struct TestOperation {
        failures: Failures,
    }

    impl ClientOperation for TestOperation {
        fn name(&self) -> &'static str {
            "Test"
        }

        fn create_network_package(&self, correlation_id: Uuid) -> Result<Package> {
            Ok(Package::new(TcpCommand::Ping, correlation_id))
        }

        fn inspect_package(&mut self, _package: &Package) -> InspectionResult {
            InspectionResult::end("done")
        }

        fn fail(&mut self, error: Error) {
            self.failures.lock().unwrap().push(error);
        }
    }

    fn operation(failures: &Failures) -> Box<dyn ClientOperation> {
        Box::new(TestOperation {
            failures: failures.clone(),
        })
    }

    fn manager(configure: impl FnOnce(&mut ConnectionSettings)) -> OperationsManager {
        let mut settings = ConnectionSettings::default();
        configure(&mut settings);
        OperationsManager::new("test", &settings)
    }

    #[test]
    fn test_queue_full() {
        let failures = Failures::default();
        let mut manager = manager(|s| s.max_queue_size = 2);
        let now = Instant::now();

        for _ in 0..3 {
            manager.enqueue_operation(operation(&failures), now);
        }

        assert_eq!(manager.total_operation_count(), 2);
        assert_eq!(*failures.lock().unwrap(), vec![Error::OperationQueueFull(2)]);
    }

    #[test]
    fn test_concurrency_limit() {
        let failures = Failures::default();
        let mut manager = manager(|s| s.max_concurrent_items = 2);
        let sink = RecordingSink::new();
        let now = Instant::now();

        for _ in 0..3 {
            manager.enqueue_operation(operation(&failures), now);
        }
        manager.schedule_waiting_operations(&sink, now);
        assert_eq!(sink.sent().len(), 2);
        assert_eq!(manager.active.len(), 2);

        let first = sink.sent()[0].correlation_id;
        manager.remove_operation(first);
        manager.schedule_waiting_operations(&sink, now);
        assert_eq!(sink.sent().len(), 3);
    }

    #[test]
    fn test_retry_uses_fresh_correlation_id() {
        let failures = Failures::default();
        let mut manager = manager(|_| {});
        let sink = RecordingSink::new();
        let now = Instant::now();

        manager.enqueue_operation(operation(&failures), now);
        manager.schedule_waiting_operations(&sink, now);
        let first = sink.last().correlation_id;

        let item = manager.remove_operation(first).unwrap();
        manager.schedule_operation_retry(item);
        manager.send_pending_retries(&sink, now);

        let second = sink.last().correlation_id;
        assert_ne!(first, second);
        assert!(manager.get_active(first).is_none());
        assert_eq!(manager.get_active(second).unwrap().retry_count, 1);
    }

    #[test]
    fn test_retry_limit() {
        let failures = Failures::default();
        let mut manager = manager(|s| s.max_retries = Attempts::Limited(2));
        let sink = RecordingSink::new();
        let now = Instant::now();

        manager.enqueue_operation(operation(&failures), now);
        manager.schedule_waiting_operations(&sink, now);

        for _ in 0..3 {
            let id = sink.last().correlation_id;
            if let Some(item) = manager.remove_operation(id) {
                manager.schedule_operation_retry(item);
                manager.send_pending_retries(&sink, now);
            }
        }

        assert_eq!(sink.sent().len(), 3);
        assert_eq!(
            *failures.lock().unwrap(),
            vec![Error::RetryLimitExceeded {
                operation: "Test",
                retries: 2,
            }]
        );
    }

    #[test]
    fn test_timeout_fails_by_default() {
        let failures = Failures::default();
        let mut manager = manager(|s| {
            s.operation_timeout = Duration::from_secs(7);
        });
        let sink = RecordingSink::new();
        let start = Instant::now();

        manager.enqueue_operation(operation(&failures), start);
        manager.schedule_waiting_operations(&sink, start);

        manager.check_timeouts_and_retry(&sink, start + Duration::from_secs(5));
        assert!(failures.lock().unwrap().is_empty());

        manager.check_timeouts_and_retry(&sink, start + Duration::from_secs(8));
        assert!(matches!(
            failures.lock().unwrap().as_slice(),
            [Error::OperationTimedOut {
                operation: "Test",
                ..
            }]
        ));
        assert_eq!(manager.total_operation_count(), 0);
    }

    #[test]
    fn test_timeout_retries_when_allowed() {
        let failures = Failures::default();
        let mut manager = manager(|s| {
            s.operation_timeout = Duration::from_secs(7);
            s.fail_on_no_server_response = false;
        });
        let sink = RecordingSink::new();
        let start = Instant::now();

        manager.enqueue_operation(operation(&failures), start);
        manager.schedule_waiting_operations(&sink, start);
        manager.check_timeouts_and_retry(&sink, start + Duration::from_secs(8));

        assert!(failures.lock().unwrap().is_empty());
        assert_eq!(sink.sent().len(), 2);
    }

    #[test]
    fn test_timeout_window_restarts_on_retry() {
        let failures = Failures::default();
        let mut manager = manager(|s| {
            s.operation_timeout = Duration::from_secs(7);
            s.fail_on_no_server_response = false;
        });
        let sink = RecordingSink::new();
        let start = Instant::now();

        manager.enqueue_operation(operation(&failures), start);
        manager.schedule_waiting_operations(&sink, start);
        manager.check_timeouts_and_retry(&sink, start + Duration::from_secs(8));
        assert_eq!(sink.sent().len(), 2);

        // Well past creation, but only four seconds since the resend.
        manager.check_timeouts_and_retry(&sink, start + Duration::from_secs(12));
        assert_eq!(sink.sent().len(), 2);

        manager.check_timeouts_and_retry(&sink, start + Duration::from_secs(16));
        assert_eq!(sink.sent().len(), 3);
        assert!(failures.lock().unwrap().is_empty());
    }

    #[test]
    fn test_new_connection_resends_in_creation_order() {
        let failures = Failures::default();
        let mut manager = manager(|_| {});
        let old = RecordingSink::new();
        let now = Instant::now();

        for _ in 0..5 {
            manager.enqueue_operation(operation(&failures), now);
        }
        manager.schedule_waiting_operations(&old, now);
        let original: Vec<Uuid> = old.sent().iter().map(|p| p.correlation_id).collect();

        let new = RecordingSink::new();
        manager.check_timeouts_and_retry(&new, now);
        assert_eq!(new.sent().len(), 5);

        // Each re-sent operation is found under its new id with its retry count.
        for package in new.sent() {
            assert!(!original.contains(&package.correlation_id));
            assert_eq!(manager.get_active(package.correlation_id).unwrap().retry_count, 1);
        }
        let order: Vec<u64> = new
            .sent()
            .iter()
            .map(|p| manager.active[&p.correlation_id].sequence)
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_cleanup_fails_everything() {
        let failures = Failures::default();
        let mut manager = manager(|s| s.max_concurrent_items = 1);
        let sink = RecordingSink::new();
        let now = Instant::now();

        for _ in 0..3 {
            manager.enqueue_operation(operation(&failures), now);
        }
        manager.schedule_waiting_operations(&sink, now);
        manager.cleanup(Error::ConnectionClosed("closed".to_string()));

        assert_eq!(failures.lock().unwrap().len(), 3);
        assert_eq!(manager.total_operation_count(), 0);
    }
}
