//! Domain entities and business rules

pub mod activity;
pub mod audio;
pub mod config;
pub mod event;
pub mod level;
pub mod publish;
pub mod snapshot;

// Re-export specific items to avoid ambiguous glob imports
pub use activity::{next_state, ActivityState, ActivityStateMachine, TickOutcome};
pub use audio::{
    unix_timestamp, CaptureBackend, CaptureError, CaptureStream, Channel, DeviceInfo, Reading,
    SampleFormat, StreamRequest,
};
pub use config::{ConfigError, Settings, SettingsOverrides, SettingsStore};
pub use event::{OutboundEvent, Payload, Presence, Qos};
pub use level::{mean_abs_level, LevelSampler};
pub use publish::{
    Admission, Backoff, ConnectionState, ConnectionTracker, LastMessage, LinkEvent, Outbox,
    PublishError, Publisher, PublisherStats,
};
pub use snapshot::{ChannelReading, SharedSnapshot, Snapshot};
