//! End-to-end scenarios for the monitor
//!
//! Scripted capture streams and a recording publisher drive the real
//! orchestrator, state machines and snapshot.

use micmon_app::orchestrator::Orchestrator;
use micmon_core::domain::activity::ActivityState;
use micmon_core::domain::audio::{CaptureError, Channel, SampleFormat};
use micmon_core::domain::config::Settings;
use micmon_core::domain::event::{OutboundEvent, Payload, Presence};
use micmon_core::domain::level::LevelSampler;
use micmon_core::domain::publish::Publisher;
use micmon_core::domain::snapshot::SharedSnapshot;
use micmon_tests::{wait_until, Journal, Record, RecordingPublisher, ScriptedStream, Step};
use std::sync::Arc;
use std::time::Duration;

const LEFT: &str = "microphones/left";
const RIGHT: &str = "microphones/right";
const WAIT: Duration = Duration::from_secs(5);

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.audio.check_interval = 0.01;
    settings.audio.threshold = 500.0;
    settings
}

fn sampler(channel: Channel, stream: ScriptedStream) -> LevelSampler {
    LevelSampler::new(channel, SampleFormat::Int16, stream.boxed())
}

// ============================================================================
// PUBLISH POLICY
// ============================================================================

#[tokio::test]
async fn test_reference_sequence_publishes_transitions_and_active_ticks() {
    let journal = Journal::default();
    let publisher = RecordingPublisher::connected(&journal);
    let snapshot = SharedSnapshot::new();

    let samplers = vec![
        sampler(
            Channel::Left,
            ScriptedStream::once("left-mic", &[450.0, 520.0, 510.0, 480.0], &journal),
        ),
        sampler(Channel::Right, ScriptedStream::looping("right-mic", &[0.0], &journal)),
    ];
    let orchestrator = Orchestrator::start(
        &fast_settings(),
        samplers,
        publisher.clone(),
        snapshot.clone(),
    );

    assert!(wait_until(WAIT, || snapshot.read().left.halted.is_some()).await);
    let report = orchestrator.shutdown().await;

    assert_eq!(
        journal.published_levels(LEFT),
        vec![(1, 520.0), (1, 510.0), (0, 480.0)]
    );
    assert!(journal.published_levels(RIGHT).is_empty());

    let left = snapshot.read().left;
    assert_eq!(left.state, ActivityState::Inactive);
    assert_eq!(left.level, 480.0);

    assert_eq!(report.faults.len(), 1);
    assert_eq!(report.faults[0].0, Channel::Left);
    assert_eq!(report.faults[0].1, CaptureError::StreamClosed("left-mic".to_string()));
}

#[tokio::test]
async fn test_active_channel_publishes_every_tick() {
    let journal = Journal::default();
    let publisher = RecordingPublisher::connected(&journal);
    let snapshot = SharedSnapshot::new();

    let levels = [900.0; 6];
    let samplers = vec![
        sampler(Channel::Left, ScriptedStream::looping("left-mic", &[10.0], &journal)),
        sampler(Channel::Right, ScriptedStream::once("right-mic", &levels, &journal)),
    ];
    let orchestrator =
        Orchestrator::start(&fast_settings(), samplers, publisher.clone(), snapshot.clone());

    assert!(wait_until(WAIT, || snapshot.read().right.halted.is_some()).await);
    orchestrator.shutdown().await;

    assert_eq!(journal.published_levels(RIGHT), vec![(1, 900.0); 6]);
    assert!(journal.published_levels(LEFT).is_empty());
    assert_eq!(publisher.stats().messages_dropped, 0);
}

#[tokio::test]
async fn test_disconnected_ticks_drop_best_effort_events() {
    let journal = Journal::default();
    let publisher = RecordingPublisher::connected(&journal);
    let snapshot = SharedSnapshot::new();

    // Link is down while ticks 2 and 3 are published
    let gate = Arc::clone(&publisher);
    let left = ScriptedStream::once("left-mic", &[450.0, 520.0, 510.0, 480.0, 530.0], &journal)
        .with_hook(Box::new(move |read| gate.set_connected(!(1..=2).contains(&read))));

    let samplers = vec![
        sampler(Channel::Left, left),
        sampler(Channel::Right, ScriptedStream::looping("right-mic", &[0.0], &journal)),
    ];
    let orchestrator =
        Orchestrator::start(&fast_settings(), samplers, publisher.clone(), snapshot.clone());

    assert!(wait_until(WAIT, || snapshot.read().left.halted.is_some()).await);
    orchestrator.shutdown().await;

    assert_eq!(journal.dropped_levels(LEFT), vec![(1, 520.0), (1, 510.0)]);
    assert_eq!(journal.published_levels(LEFT), vec![(0, 480.0), (1, 530.0)]);
    assert_eq!(publisher.stats().messages_dropped, 2);
}

#[tokio::test]
async fn test_status_held_while_disconnected_is_sent_on_reconnect() {
    let journal = Journal::default();
    let publisher = RecordingPublisher::connected(&journal);

    publisher.set_connected(false);
    publisher.publish(OutboundEvent::status("microphones/status", Presence::Online));
    publisher.publish(OutboundEvent::level(LEFT, 1, 600.0, 1));
    assert!(journal
        .records()
        .iter()
        .all(|r| !matches!(r, Record::Published(_))));

    publisher.set_connected(true);
    let published: Vec<_> = journal
        .records()
        .into_iter()
        .filter_map(|r| match r {
            Record::Published(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(published.len(), 1);
    assert!(matches!(published[0].payload, Payload::Status(_)));
    assert_eq!(journal.dropped_levels(LEFT), vec![(1, 600.0)]);
}

// ============================================================================
// FAILURE ISOLATION AND SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_capture_failure_stops_only_its_channel() {
    let journal = Journal::default();
    let publisher = RecordingPublisher::connected(&journal);
    let snapshot = SharedSnapshot::new();

    let failure = CaptureError::StreamFailed {
        device: "left-mic".to_string(),
        reason: "device unplugged".to_string(),
    };
    let samplers = vec![
        sampler(
            Channel::Left,
            ScriptedStream::from_steps(
                "left-mic",
                vec![Step::Level(600.0), Step::Fail(failure.clone())],
                &journal,
            ),
        ),
        sampler(Channel::Right, ScriptedStream::looping("right-mic", &[700.0], &journal)),
    ];
    let orchestrator =
        Orchestrator::start(&fast_settings(), samplers, publisher.clone(), snapshot.clone());

    assert!(wait_until(WAIT, || snapshot.read().left.halted.is_some()).await);
    assert!(wait_until(WAIT, || orchestrator.running() == 1).await);

    let right_before = journal.published_levels(RIGHT).len();
    assert!(wait_until(WAIT, || journal.published_levels(RIGHT).len() >= right_before + 3).await);

    let halted = snapshot.read().left.halted.unwrap();
    assert!(halted.contains("device unplugged"));
    assert!(snapshot.read().right.halted.is_none());
    assert_eq!(snapshot.read().right.state, ActivityState::Active);

    let report = orchestrator.shutdown().await;
    assert_eq!(report.faults, vec![(Channel::Left, failure)]);
    assert_eq!(report.streams_closed, 2);
    assert_eq!(journal.published_levels(LEFT), vec![(1, 600.0)]);
}

#[tokio::test]
async fn test_shutdown_publishes_offline_before_closing_streams() {
    let journal = Journal::default();
    let publisher = RecordingPublisher::connected(&journal);
    let snapshot = SharedSnapshot::new();

    let samplers = vec![
        sampler(Channel::Left, ScriptedStream::looping("left-mic", &[800.0], &journal)),
        sampler(Channel::Right, ScriptedStream::looping("right-mic", &[0.0], &journal)),
    ];
    let orchestrator =
        Orchestrator::start(&fast_settings(), samplers, publisher.clone(), snapshot.clone());

    assert!(wait_until(WAIT, || journal.published_levels(LEFT).len() >= 3).await);
    let report = orchestrator.shutdown().await;
    assert!(report.faults.is_empty());
    assert!(report.publisher_error.is_none());
    assert_eq!(report.streams_closed, 2);

    let records = journal.records();
    let offline = records
        .iter()
        .position(|r| {
            matches!(
                r,
                Record::Published(OutboundEvent {
                    payload: Payload::Status(status),
                    ..
                }) if status.status == Presence::Offline
            )
        })
        .expect("offline status published");
    let disconnected = records
        .iter()
        .position(|r| *r == Record::Disconnected)
        .expect("publisher disconnected");
    let last_level = records
        .iter()
        .rposition(|r| {
            matches!(
                r,
                Record::Published(OutboundEvent {
                    payload: Payload::Level(_),
                    ..
                })
            )
        })
        .expect("level events published");
    let first_close = records
        .iter()
        .position(|r| matches!(r, Record::StreamClosed(_)))
        .expect("streams closed");

    assert!(last_level < offline);
    assert!(offline < disconnected);
    assert!(disconnected < first_close);
    assert_eq!(
        records
            .iter()
            .filter(|r| matches!(r, Record::StreamClosed(_)))
            .count(),
        2
    );
    assert_eq!(publisher.connection_state().to_string(), "DISCONNECTED");
}

#[tokio::test]
async fn test_all_halted_resolves_when_every_channel_fails() {
    let journal = Journal::default();
    let publisher = RecordingPublisher::connected(&journal);
    let snapshot = SharedSnapshot::new();

    let samplers = vec![
        sampler(Channel::Left, ScriptedStream::once("left-mic", &[100.0], &journal)),
        sampler(Channel::Right, ScriptedStream::once("right-mic", &[100.0, 200.0], &journal)),
    ];
    let orchestrator =
        Orchestrator::start(&fast_settings(), samplers, publisher.clone(), snapshot.clone());
    assert_eq!(orchestrator.running(), 2);

    tokio::time::timeout(WAIT, orchestrator.all_halted())
        .await
        .expect("all channels halted");
    assert_eq!(orchestrator.running(), 0);
    assert!(snapshot.read().left.halted.is_some());
    assert!(snapshot.read().right.halted.is_some());

    let report = orchestrator.shutdown().await;
    assert_eq!(report.faults.len(), 2);
    assert_eq!(report.streams_closed, 2);
}
