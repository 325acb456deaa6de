//! Test doubles shared by the integration tests
//!
//! - [`ScriptedStream`] replays a list of levels as capture chunks
//! - [`RecordingPublisher`] applies the real outbox policy against a switchable
//!   link and records everything into a shared [`Journal`]

use async_trait::async_trait;
use micmon_core::domain::audio::{CaptureError, CaptureStream, Result as CaptureResult, SampleFormat};
use micmon_core::domain::event::{OutboundEvent, Payload, Presence};
use micmon_core::domain::publish::{
    Admission, ConnectionState, Outbox, PublishError, Publisher, PublisherStats,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One entry in the shared journal, in the order things happened
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Published(OutboundEvent),
    Dropped(OutboundEvent),
    Disconnected,
    StreamClosed(String),
}

/// Ordered log shared between streams and publisher
#[derive(Debug, Clone, Default)]
pub struct Journal {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Journal {
    pub fn push(&self, record: Record) {
        self.records.lock().unwrap().push(record);
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    /// `(state, level)` of level events published on `topic`
    pub fn published_levels(&self, topic: &str) -> Vec<(u8, f64)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Published(OutboundEvent {
                    topic: t,
                    payload: Payload::Level(level),
                    ..
                }) if t == topic => Some((level.state, level.level)),
                _ => None,
            })
            .collect()
    }

    /// `(state, level)` of level events dropped on `topic`
    pub fn dropped_levels(&self, topic: &str) -> Vec<(u8, f64)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Dropped(OutboundEvent {
                    topic: t,
                    payload: Payload::Level(level),
                    ..
                }) if t == topic => Some((level.state, level.level)),
                _ => None,
            })
            .collect()
    }
}

/// Hook run before each chunk is returned, with the 0-based read count
pub type ReadHook = Box<dyn FnMut(usize) + Send>;

/// What a scripted read produces
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Level(f64),
    Fail(CaptureError),
}

/// Capture stream replaying scripted levels
///
/// Each level becomes a chunk whose mean absolute value reduces back to
/// exactly that level in the given format.
pub struct ScriptedStream {
    name: String,
    format: SampleFormat,
    steps: VecDeque<Step>,
    looping: bool,
    reads: usize,
    hook: Option<ReadHook>,
    journal: Journal,
}

impl ScriptedStream {
    /// Play `levels` once, then report the stream closed
    pub fn once(name: &str, levels: &[f64], journal: &Journal) -> Self {
        Self::new(name, levels.iter().copied().map(Step::Level).collect(), false, journal)
    }

    /// Play `levels` forever
    pub fn looping(name: &str, levels: &[f64], journal: &Journal) -> Self {
        Self::new(name, levels.iter().copied().map(Step::Level).collect(), true, journal)
    }

    pub fn from_steps(name: &str, steps: Vec<Step>, journal: &Journal) -> Self {
        Self::new(name, steps, false, journal)
    }

    fn new(name: &str, steps: Vec<Step>, looping: bool, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            format: SampleFormat::Int16,
            steps: steps.into(),
            looping,
            reads: 0,
            hook: None,
            journal: journal.clone(),
        }
    }

    pub fn with_hook(mut self, hook: ReadHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn boxed(self) -> Box<dyn CaptureStream> {
        Box::new(self)
    }
}

#[async_trait]
impl CaptureStream for ScriptedStream {
    fn device_name(&self) -> &str {
        &self.name
    }

    async fn read_chunk(&mut self) -> CaptureResult<Vec<f32>> {
        let step = self
            .steps
            .pop_front()
            .ok_or_else(|| CaptureError::StreamClosed(self.name.clone()))?;
        if self.looping {
            self.steps.push_back(step.clone());
        }

        if let Some(hook) = self.hook.as_mut() {
            hook(self.reads);
        }
        self.reads += 1;

        match step {
            Step::Level(level) => {
                let sample = (level / self.format.full_scale()) as f32;
                Ok(vec![sample; 16])
            }
            Step::Fail(error) => Err(error),
        }
    }

    fn close(&mut self) {
        self.journal.push(Record::StreamClosed(self.name.clone()));
    }
}

/// Publisher double with a switchable link
pub struct RecordingPublisher {
    status_topic: String,
    state: Mutex<ConnectionState>,
    outbox: Mutex<Outbox>,
    stats: Mutex<PublisherStats>,
    journal: Journal,
}

impl RecordingPublisher {
    pub fn connected(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            status_topic: "microphones/status".to_string(),
            state: Mutex::new(ConnectionState::Connected),
            outbox: Mutex::new(Outbox::default()),
            stats: Mutex::new(PublisherStats::default()),
            journal: journal.clone(),
        })
    }

    /// Switch the link; reconnecting flushes held events first
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Backoff
        };
        *self.state.lock().unwrap() = state;
        if connected {
            let held = self.outbox.lock().unwrap().take_held();
            for event in held {
                self.deliver(event);
            }
        }
    }

    fn deliver(&self, event: OutboundEvent) {
        self.stats.lock().unwrap().record_sent(&event, 0);
        self.journal.push(Record::Published(event));
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn publish(&self, event: OutboundEvent) {
        let state = *self.state.lock().unwrap();
        let admission = self.outbox.lock().unwrap().admit(event.clone(), state);
        match admission {
            Admission::Send(event) => self.deliver(event),
            Admission::Held => {}
            Admission::Dropped => {
                self.stats.lock().unwrap().record_dropped();
                self.journal.push(Record::Dropped(event));
            }
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn stats(&self) -> PublisherStats {
        self.stats.lock().unwrap().clone()
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        if self.connection_state() == ConnectionState::Connected {
            self.deliver(OutboundEvent::status(self.status_topic.as_str(), Presence::Offline));
        }
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.journal.push(Record::Disconnected);
        Ok(())
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
