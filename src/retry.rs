//! Retry policies built on `backon`.
//!
//! Operation retries are not driven from here: the dispatcher re-sends
//! operations itself so it can keep correlation ids and retry counters.
//! This module covers the loops that run outside the connection actor.
//!
//! | Policy | Delay | Attempts | Use Case |
//! |--------|-------|----------|----------|
//! | `discovery_policy` | `discover_delay`, constant | `max_discover_attempts` | gossip discovery |
//! | `gossip_read_policy` | 10ms..100ms, jittered | 3 | transient gossip socket errors |
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use backon::Retryable;
//! use eventesque::retry;
//! use eventesque::types::Attempts;
//!
//! async fn example() -> Result<(), std::io::Error> {
//!     (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::discovery_policy(Duration::from_millis(500), Attempts::Limited(10)))
//!         .await
//! }
//! ```

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder, Retryable};
use tracing::warn;

use crate::types::Attempts;

/// Fixed delay between discovery attempts.
///
/// `attempts` counts every try including the first, so `Limited(1)` never
/// retries. `Unlimited` keeps trying until the caller gives up.
pub fn discovery_policy(delay: Duration, attempts: Attempts) -> ConstantBuilder {
    let retries = match attempts {
        Attempts::Limited(n) => n.saturating_sub(1) as usize,
        Attempts::Unlimited => usize::MAX,
    };
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(retries)
}

/// Short jittered policy for a single gossip fetch that hit a reset socket.
pub fn gossip_read_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Run `operation` under [`discovery_policy`], logging each failed attempt.
pub async fn with_discovery_policy<F, Fut, T, E, C>(
    operation: F,
    delay: Duration,
    attempts: Attempts,
    condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(discovery_policy(delay, attempts))
        .when(condition)
        .notify(|err: &E, after: Duration| {
            warn!(error = %err, retry_in_ms = after.as_millis() as u64, "Discovery attempt failed");
        })
        .await
}
