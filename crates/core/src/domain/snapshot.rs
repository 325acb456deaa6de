//! Latest-value store shared between the sampling cycles and presentation

use crate::domain::activity::ActivityState;
use crate::domain::audio::Channel;
use std::sync::{Arc, PoisonError, RwLock};

/// One channel's latest tick
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelReading {
    pub state: ActivityState,
    pub level: f64,
    pub timestamp: i64,
    /// Set once the channel's cycle has stopped on a capture error
    pub halted: Option<String>,
}

/// Consistent view of both channels
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub left: ChannelReading,
    pub right: ChannelReading,
}

impl Snapshot {
    pub fn get(&self, channel: Channel) -> &ChannelReading {
        match channel {
            Channel::Left => &self.left,
            Channel::Right => &self.right,
        }
    }

    fn get_mut(&mut self, channel: Channel) -> &mut ChannelReading {
        match channel {
            Channel::Left => &mut self.left,
            Channel::Right => &mut self.right,
        }
    }
}

/// Cloneable handle to the shared snapshot
///
/// Every update replaces one channel entry under the write lock, and every
/// read copies the whole snapshot under the read lock, so a reader never sees
/// a state and level from different ticks.
#[derive(Debug, Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Snapshot>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, channel: Channel, state: ActivityState, level: f64, timestamp: i64) {
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = snapshot.get_mut(channel);
        entry.state = state;
        entry.level = level;
        entry.timestamp = timestamp;
    }

    /// Record why a channel stopped
    pub fn mark_halted(&self, channel: Channel, reason: impl Into<String>) {
        let mut snapshot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.get_mut(channel).halted = Some(reason.into());
    }

    pub fn read(&self) -> Snapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
