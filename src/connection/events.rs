//! Observer registry for connection lifecycle events.
//!
//! Listeners are plain callbacks scoped to one connection. They run on the
//! connection actor, so they must return quickly; a panicking listener is
//! logged and skipped.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::warn;

use crate::error::Error;

/// Something that happened to a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr),
    Reconnecting,
    /// Terminal; fired once.
    Closed(String),
    ErrorOccurred(Error),
    AuthenticationFailed(String),
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Connected(_) => ConnectionEventKind::Connected,
            ConnectionEvent::Disconnected(_) => ConnectionEventKind::Disconnected,
            ConnectionEvent::Reconnecting => ConnectionEventKind::Reconnecting,
            ConnectionEvent::Closed(_) => ConnectionEventKind::Closed,
            ConnectionEvent::ErrorOccurred(_) => ConnectionEventKind::ErrorOccurred,
            ConnectionEvent::AuthenticationFailed(_) => ConnectionEventKind::AuthenticationFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
    ErrorOccurred,
    AuthenticationFailed,
}

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    kind: ConnectionEventKind,
    id: u64,
}

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
pub struct ConnectionEvents {
    listeners: DashMap<ConnectionEventKind, Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ConnectionEvents {
    pub fn add_listener<F>(&self, kind: ConnectionEventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerHandle { kind, id }
    }

    /// Returns `false` if the listener was already removed.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let Some(mut listeners) = self.listeners.get_mut(&handle.kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != handle.id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // Clone out so a listener may add or remove listeners.
        let listeners: Vec<Listener> = match self.listeners.get(&event.kind()) {
            Some(entry) => entry.iter().map(|(_, listener)| listener.clone()).collect(),
            None => return,
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(event = ?event.kind(), "Connection event listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_listeners_receive_their_kind_only() {
        let events = ConnectionEvents::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        events.add_listener(ConnectionEventKind::Closed, move |event| {
            sink.lock().unwrap().push(format!("{:?}", event));
        });

        events.emit(ConnectionEvent::Reconnecting);
        events.emit(ConnectionEvent::Closed("bye".to_string()));

        assert_eq!(*seen.lock().unwrap(), vec!["Closed(\"bye\")".to_string()]);
    }

    #[test]
    fn test_remove_listener() {
        let events = ConnectionEvents::default();
        let count = Arc::new(AtomicU64::new(0));

        let counter = count.clone();
        let handle = events.add_listener(ConnectionEventKind::Reconnecting, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        events.emit(ConnectionEvent::Reconnecting);
        assert!(events.remove_listener(handle));
        assert!(!events.remove_listener(handle));
        events.emit(ConnectionEvent::Reconnecting);

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(events.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let events = ConnectionEvents::default();
        let count = Arc::new(AtomicU64::new(0));

        events.add_listener(ConnectionEventKind::Reconnecting, |_| panic!("listener bug"));
        let counter = count.clone();
        events.add_listener(ConnectionEventKind::Reconnecting, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        events.emit(ConnectionEvent::Reconnecting);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
