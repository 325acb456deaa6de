//! Active/inactive classification and the per-tick publish policy
//!
//! Each channel owns one [`ActivityStateMachine`]. It is fed one
//! [`Reading`] per tick and answers two questions: which state the channel
//! is in now, and which event (if any) goes to the bus for this tick.
//!
//! Publish policy:
//! - a transition always emits one event, in either direction
//! - staying ACTIVE emits one event per tick
//! - staying INACTIVE emits nothing

use crate::domain::audio::{Channel, Reading};
use crate::domain::event::OutboundEvent;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivityState {
    #[default]
    Inactive,
    Active,
}

impl ActivityState {
    /// Wire value: 1 for active, 0 for inactive
    pub fn as_flag(&self) -> u8 {
        match self {
            ActivityState::Inactive => 0,
            ActivityState::Active => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActivityState::Inactive => "INACTIVE",
            ActivityState::Active => "ACTIVE",
        }
    }
}

/// Threshold rule with an optional release band
///
/// `level > threshold` always activates. An active channel stays active while
/// `level > threshold - hysteresis`; with `hysteresis == 0` this is the plain
/// single-threshold rule and `level == threshold` is inactive.
pub fn next_state(current: ActivityState, level: f64, threshold: f64, hysteresis: f64) -> ActivityState {
    let floor = match current {
        ActivityState::Active => threshold - hysteresis,
        ActivityState::Inactive => threshold,
    };
    if level > floor {
        ActivityState::Active
    } else {
        ActivityState::Inactive
    }
}

/// Result of feeding one reading into the machine
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub previous: ActivityState,
    pub state: ActivityState,
    pub event: Option<OutboundEvent>,
}

impl TickOutcome {
    pub fn is_transition(&self) -> bool {
        self.previous != self.state
    }
}

pub struct ActivityStateMachine {
    channel: Channel,
    topic: String,
    threshold: f64,
    hysteresis: f64,
    state: ActivityState,
}

impl ActivityStateMachine {
    pub fn new(channel: Channel, topic: impl Into<String>, threshold: f64) -> Self {
        Self {
            channel,
            topic: topic.into(),
            threshold,
            hysteresis: 0.0,
            state: ActivityState::Inactive,
        }
    }

    pub fn with_hysteresis(mut self, hysteresis: f64) -> Self {
        self.hysteresis = hysteresis.max(0.0);
        self
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn observe(&mut self, reading: &Reading) -> TickOutcome {
        let previous = self.state;
        let state = next_state(previous, reading.level, self.threshold, self.hysteresis);
        self.state = state;

        if previous != state {
            debug!(
                channel = %self.channel,
                from = previous.label(),
                to = state.label(),
                level = reading.level,
                "Activity state changed"
            );
        }

        let event = (previous != state || state == ActivityState::Active).then(|| {
            OutboundEvent::level(
                self.topic.clone(),
                state.as_flag(),
                reading.level,
                reading.timestamp,
            )
        });

        TickOutcome {
            previous,
            state,
            event,
        }
    }
}
