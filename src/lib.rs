//! # Eventesque
//! Rust-native client driver for stream-oriented event stores.
//!
//! The crate speaks the event store's binary TCP protocol: appends with
//! optimistic concurrency, transactions, stream and `$all` reads, volatile,
//! catch-up and persistent subscriptions, heartbeats, automatic reconnection
//! and cluster discovery over HTTP gossip.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/), [Nom](https://docs.rs/nom/latest/nom/)
//! - One actor per connection; no locks on the hot path
//! - Retries that never duplicate a write
//!
//! ## Getting started
//! Include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! eventesque = "0.1"
//! ```
//!
//! ### Appending and reading
//!
//! ```rust,no_run
//! use eventesque::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let settings = ConnectionSettings::builder()
//!         .single_node("127.0.0.1:1113".parse()?)
//!         .build()?;
//!     let connection = EventStoreConnection::create(settings)?;
//!     connection.connect().await?;
//!
//!     let event = EventData::json("OrderPlaced", r#"{"id":1}"#);
//!     connection
//!         .append_to_stream("orders-1", ExpectedVersion::NoStream, vec![event])
//!         .await?;
//!
//!     let slice = connection
//!         .read_stream_events_forward("orders-1", 0, 100, false)
//!         .await?;
//!     for resolved in &slice.events {
//!         if let Some(event) = resolved.original_event() {
//!             println!("{} {}", event.event_number, event.event_type);
//!         }
//!     }
//!
//!     connection.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Subscribing
//! Implement [`SubscriptionHandler`](subscription::SubscriptionHandler),
//! [`CatchUpHandler`](subscription::CatchUpHandler) or
//! [`PersistentSubscriptionHandler`](subscription::PersistentSubscriptionHandler)
//! and hand it to the matching `subscribe_*` call on
//! [`EventStoreConnection`](connection::EventStoreConnection). Handlers run
//! on a worker task per subscription, one event at a time.
//!
//! ## Configuration
//! [`ConnectionSettings::from_env`](settings::ConnectionSettings::from_env)
//! reads `EVENTESQUE_*` variables; see [`settings`] for the full list.

#![forbid(unsafe_code)]

mod encode;
mod operations;
mod parser;

pub mod connection;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod protocol;
pub mod retry;
pub mod settings;
pub mod subscription;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, EventStoreConnection,
    EventStoreTransaction,
};
pub use error::{Error, Result};

pub mod prelude {
    //! Everything an application typically needs.
    //!
    //! ```rust,no_run
    //! use eventesque::prelude::*;
    //! ```
    pub use crate::connection::{
        ConnectionEvent, ConnectionEventKind, ConnectionState, EventStoreConnection,
        EventStoreTransaction, ListenerHandle,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::{
        AllEventsSlice, DeleteResult, EventData, EventId, EventReadResult, EventReadStatus,
        ReadDirection, RecordedEvent, ResolvedEvent, SliceReadStatus, StreamEventsSlice,
        WriteResult,
    };
    pub use crate::protocol::messages::PersistentSubscriptionNakEventAction;
    pub use crate::settings::{
        CatchUpSubscriptionSettings, ClusterSettings, ConnectionSettings, ConnectionTarget,
        ConsumerStrategy, PersistentSubscriptionSettings,
    };
    pub use crate::subscription::{
        CatchUpHandler, CatchUpSubscription, HandlerError, HandlerResult, PersistentEvent,
        PersistentSubscription, PersistentSubscriptionHandler, SubscriptionDropReason,
        SubscriptionHandler, VolatileSubscription,
    };
    pub use crate::types::{
        Attempts, ExpectedVersion, NodePreference, Position, StreamPosition, UserCredentials,
    };

    pub use async_trait::async_trait;
    pub use bytes;
}
