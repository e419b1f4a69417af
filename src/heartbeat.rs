//! Heartbeat-based liveness detection for one connection.
//!
//! The monitor is pure state driven by the connection's timer. It never
//! touches the socket itself; [`HeartbeatMonitor::tick`] tells the caller what
//! to do next.
//!
//! # States
//!
//! 1. **Healthy** - a package arrived within the last `interval`
//! 2. **AwaitingResponse** - the link went quiet, a heartbeat request is out
//! 3. **Stalled** - nothing arrived for `timeout` after the request was sent
//!
//! Any inbound package counts as proof of life, not only the heartbeat
//! response. A stall is handled exactly like a socket failure by the caller.

use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS};

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Quiet period after which a heartbeat request is sent.
    /// Default: 750ms
    pub interval: Duration,

    /// How long to wait for any package after sending a request.
    /// Default: 1500ms
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

impl HeartbeatConfig {
    /// Worst-case time from the last received package to a stall.
    pub fn detection_time(&self) -> Duration {
        self.interval + self.timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Healthy,
    AwaitingResponse,
    Stalled,
}

impl std::fmt::Display for HeartbeatState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatState::Healthy => write!(f, "healthy"),
            HeartbeatState::AwaitingResponse => write!(f, "awaiting_response"),
            HeartbeatState::Stalled => write!(f, "stalled"),
        }
    }
}

/// What the connection should do after a timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    /// Send a heartbeat request with this correlation id.
    SendRequest(Uuid),
    /// Close the transport and go through the reconnect path.
    Stalled { silence: Duration },
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    correlation_id: Uuid,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_received: Instant,
    pending: Option<PendingRequest>,
    last_round_trip: Option<Duration>,
    stalled: bool,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_received: now,
            pending: None,
            last_round_trip: None,
            stalled: false,
        }
    }

    /// Forget everything about the previous socket.
    pub fn reset(&mut self, now: Instant) {
        self.last_received = now;
        self.pending = None;
        self.stalled = false;
    }

    pub fn on_package_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Match a heartbeat response and return the measured round trip.
    pub fn on_response(&mut self, correlation_id: Uuid, now: Instant) -> Option<Duration> {
        let pending = self.pending?;
        if pending.correlation_id != correlation_id {
            return None;
        }
        self.pending = None;
        let rtt = now.saturating_duration_since(pending.sent_at);
        self.last_round_trip = Some(rtt);
        debug!(rtt_ms = rtt.as_millis() as u64, "Heartbeat round trip");
        Some(rtt)
    }

    pub fn tick(&mut self, now: Instant) -> HeartbeatAction {
        if self.stalled {
            return HeartbeatAction::Idle;
        }

        if let Some(pending) = self.pending {
            if self.last_received > pending.sent_at {
                // Traffic arrived after the request; the link is alive.
                self.pending = None;
            } else if now.saturating_duration_since(pending.sent_at) >= self.config.timeout {
                let silence = now.saturating_duration_since(self.last_received);
                warn!(
                    silence_ms = silence.as_millis() as u64,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Heartbeat timed out, connection stalled"
                );
                self.stalled = true;
                return HeartbeatAction::Stalled { silence };
            } else {
                return HeartbeatAction::Idle;
            }
        }

        if now.saturating_duration_since(self.last_received) >= self.config.interval {
            let correlation_id = Uuid::new_v4();
            self.pending = Some(PendingRequest {
                correlation_id,
                sent_at: now,
            });
            return HeartbeatAction::SendRequest(correlation_id);
        }

        HeartbeatAction::Idle
    }

    pub fn state(&self) -> HeartbeatState {
        if self.stalled {
            HeartbeatState::Stalled
        } else if self.pending.is_some() {
            HeartbeatState::AwaitingResponse
        } else {
            HeartbeatState::Healthy
        }
    }

    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_idle_while_traffic_flows() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config(), start);

        for step in 1..10 {
            let now = start + Duration::from_millis(step * 50);
            monitor.on_package_received(now);
            assert_eq!(monitor.tick(now), HeartbeatAction::Idle);
        }
        assert_eq!(monitor.state(), HeartbeatState::Healthy);
    }

    #[test]
    fn test_sends_request_after_quiet_interval() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config(), start);

        assert_eq!(
            monitor.tick(start + Duration::from_millis(50)),
            HeartbeatAction::Idle
        );
        let action = monitor.tick(start + Duration::from_millis(100));
        assert!(matches!(action, HeartbeatAction::SendRequest(_)));
        assert_eq!(monitor.state(), HeartbeatState::AwaitingResponse);

        // Only one request in flight.
        assert_eq!(
            monitor.tick(start + Duration::from_millis(150)),
            HeartbeatAction::Idle
        );
    }

    #[test]
    fn test_response_measures_round_trip() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config(), start);

        let sent = start + Duration::from_millis(100);
        let HeartbeatAction::SendRequest(id) = monitor.tick(sent) else {
            panic!("expected a heartbeat request");
        };

        let received = sent + Duration::from_millis(30);
        monitor.on_package_received(received);
        assert_eq!(monitor.on_response(Uuid::new_v4(), received), None);
        assert_eq!(
            monitor.on_response(id, received),
            Some(Duration::from_millis(30))
        );
        assert_eq!(monitor.last_round_trip(), Some(Duration::from_millis(30)));
        assert_eq!(monitor.state(), HeartbeatState::Healthy);
    }

    #[test]
    fn test_stalls_when_nothing_arrives() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config(), start);

        let sent = start + Duration::from_millis(100);
        assert!(matches!(
            monitor.tick(sent),
            HeartbeatAction::SendRequest(_)
        ));
        assert_eq!(
            monitor.tick(sent + Duration::from_millis(199)),
            HeartbeatAction::Idle
        );

        let action = monitor.tick(sent + Duration::from_millis(200));
        assert_eq!(
            action,
            HeartbeatAction::Stalled {
                silence: Duration::from_millis(300)
            }
        );
        assert_eq!(monitor.state(), HeartbeatState::Stalled);

        // Reported once.
        assert_eq!(
            monitor.tick(sent + Duration::from_millis(400)),
            HeartbeatAction::Idle
        );
    }

    #[test]
    fn test_any_package_counts_as_alive() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config(), start);

        let sent = start + Duration::from_millis(100);
        assert!(matches!(
            monitor.tick(sent),
            HeartbeatAction::SendRequest(_)
        ));
        monitor.on_package_received(sent + Duration::from_millis(10));

        assert_eq!(
            monitor.tick(sent + Duration::from_millis(50)),
            HeartbeatAction::Idle
        );
        assert_eq!(monitor.state(), HeartbeatState::Healthy);
    }

    #[test]
    fn test_reset_clears_stall() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(config(), start);
        monitor.tick(start + Duration::from_millis(100));
        monitor.tick(start + Duration::from_millis(300));
        assert_eq!(monitor.state(), HeartbeatState::Stalled);

        monitor.reset(start + Duration::from_millis(400));
        assert_eq!(monitor.state(), HeartbeatState::Healthy);
    }

    #[test]
    fn test_detection_time() {
        assert_eq!(config().detection_time(), Duration::from_millis(300));
    }
}
