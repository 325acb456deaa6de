//! Publishing policy: connection state machine, reconnect backoff and the
//! outbox that decides what happens to an event while the bus is away.
//!
//! Nothing in here touches the network. The MQTT driver in the `infra` crate
//! feeds [`LinkEvent`]s into a [`ConnectionTracker`] and asks the [`Outbox`]
//! whether an event is sent, held or dropped.

use crate::domain::event::{OutboundEvent, Payload};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors surfaced by publisher operations
///
/// None of these are fatal to a sampling cycle.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Bus connection error: {0}")]
    Connection(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Session state as seen by the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Backoff => "BACKOFF",
        };
        f.write_str(label)
    }
}

/// Session events reported by the bus client driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt is starting
    Connecting,
    /// The broker acknowledged the session
    Connected,
    /// An attempt failed before the session was established
    ConnectFailed,
    /// An established session dropped
    ConnectionLost,
    /// The session was closed on purpose
    Closed,
}

/// Exponential reconnect delay, capped and resettable
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            next: base,
        }
    }

    /// Delay to wait now; doubles the following one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

/// Explicit state machine fed by [`LinkEvent`]s
///
/// `CONNECTED → BACKOFF → CONNECTING → CONNECTED`, with `CONNECTING → BACKOFF`
/// on a failed attempt and any state → `DISCONNECTED` on close.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: ConnectionState,
    backoff: Backoff,
    reconnect_attempts: u32,
}

impl ConnectionTracker {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Apply an event; returns the wait before the next attempt when the
    /// tracker enters BACKOFF
    pub fn apply(&mut self, event: LinkEvent) -> Option<Duration> {
        let previous = self.state;
        let delay = match (previous, event) {
            (_, LinkEvent::Closed) => {
                self.state = ConnectionState::Disconnected;
                None
            }
            (ConnectionState::Disconnected | ConnectionState::Backoff, LinkEvent::Connecting) => {
                self.state = ConnectionState::Connecting;
                None
            }
            (ConnectionState::Connecting, LinkEvent::Connected) => {
                self.state = ConnectionState::Connected;
                self.reconnect_attempts = 0;
                self.backoff.reset();
                None
            }
            (
                ConnectionState::Connecting | ConnectionState::Connected,
                LinkEvent::ConnectFailed | LinkEvent::ConnectionLost,
            ) => {
                self.state = ConnectionState::Backoff;
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                Some(self.backoff.next_delay())
            }
            (state, event) => {
                trace!(?state, ?event, "Ignoring link event");
                None
            }
        };

        if previous != self.state {
            debug!(from = %previous, to = %self.state, ?delay, "Connection state changed");
        }
        delay
    }
}

/// What the outbox decided for one event
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Hand to the session now
    Send(OutboundEvent),
    /// Durable event kept until the session is back
    Held,
    /// Best-effort event discarded
    Dropped,
}

/// Holding area for durable events while disconnected
///
/// Best-effort events are never queued. Durable events keep only the latest
/// per topic, since each one supersedes the previous status.
#[derive(Debug)]
pub struct Outbox {
    held: VecDeque<OutboundEvent>,
    capacity: usize,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl Outbox {
    pub const DEFAULT_CAPACITY: usize = 16;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            held: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn admit(&mut self, event: OutboundEvent, state: ConnectionState) -> Admission {
        if state == ConnectionState::Connected {
            return Admission::Send(event);
        }
        if event.is_durable() {
            self.hold(event);
            Admission::Held
        } else {
            trace!(topic = %event.topic, %state, "Dropping best-effort event");
            Admission::Dropped
        }
    }

    /// Keep a durable event for the next session
    pub fn hold(&mut self, event: OutboundEvent) {
        self.held.retain(|held| held.topic != event.topic);
        self.held.push_back(event);
        while self.held.len() > self.capacity {
            self.held.pop_front();
        }
    }

    /// Drain held events in the order they were held
    pub fn take_held(&mut self) -> Vec<OutboundEvent> {
        self.held.drain(..).collect()
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }
}

/// Most recent message handed to the session
#[derive(Debug, Clone, PartialEq)]
pub struct LastMessage {
    pub summary: String,
    pub timestamp: i64,
}

/// Counters exposed for status display
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublisherStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub reconnect_attempts: u32,
    pub last_message: Option<LastMessage>,
}

impl PublisherStats {
    /// Count a message that reached the session; probes are not counted
    pub fn record_sent(&mut self, event: &OutboundEvent, timestamp: i64) {
        if matches!(event.payload, Payload::Ping) {
            return;
        }
        self.messages_sent += 1;
        let body = event
            .to_bytes()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        self.last_message = Some(LastMessage {
            summary: format!("{}: {}", event.topic, body),
            timestamp,
        });
    }

    pub fn record_dropped(&mut self) {
        self.messages_dropped += 1;
    }
}

/// Seam between the sampling cycles and the bus
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Non-blocking enqueue
    fn publish(&self, event: OutboundEvent);

    fn connection_state(&self) -> ConnectionState;

    fn stats(&self) -> PublisherStats;

    /// Publish the offline status and close the session
    async fn disconnect(&self) -> Result<(), PublishError>;
}
