//! Resilient broker publisher

use async_trait::async_trait;
use micmon_core::domain::audio::unix_timestamp;
use micmon_core::domain::config::Settings;
use micmon_core::domain::event::{OutboundEvent, Presence, Qos};
use micmon_core::domain::publish::{
    Admission, Backoff, ConnectionState, ConnectionTracker, LinkEvent, Outbox, PublishError,
    Publisher, PublisherStats,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Interval between connectivity probes
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive probe failures before a warning is logged
const PING_FAILURE_WARN: u32 = 3;

/// How long a graceful disconnect waits for the session to flush
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything needed to open a broker session
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherOptions {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    pub status_topic: String,
    pub ping_topic: String,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub ping_interval: Duration,
    /// Capacity of the client's request queue
    pub request_capacity: usize,
}

impl PublisherOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let (reconnect_min_delay, reconnect_max_delay) = settings.reconnect_delays();
        Self {
            broker: settings.mqtt.broker.clone(),
            port: settings.mqtt.port,
            client_id: settings.mqtt.client_id.clone(),
            keepalive: settings.keepalive(),
            status_topic: settings.mqtt.topics.status.clone(),
            ping_topic: settings.mqtt.topics.ping.clone(),
            reconnect_min_delay,
            reconnect_max_delay,
            ping_interval: PING_INTERVAL,
            request_capacity: 64,
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.broker.clone(), self.port);
        options.set_keep_alive(self.keepalive);
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            self.status_topic.clone(),
            offline_payload(&self.status_topic),
            QoS::AtLeastOnce,
            true,
        ));
        options
    }
}

fn offline_payload(status_topic: &str) -> Vec<u8> {
    OutboundEvent::status(status_topic, Presence::Offline)
        .to_bytes()
        .unwrap_or_else(|_| br#"{"status":"offline"}"#.to_vec())
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the publisher handle, the session driver and the probe
struct Session {
    client: AsyncClient,
    tracker: Mutex<ConnectionTracker>,
    outbox: Mutex<Outbox>,
    stats: Mutex<PublisherStats>,
}

impl Session {
    fn new(client: AsyncClient, backoff: Backoff) -> Self {
        Self {
            client,
            tracker: Mutex::new(ConnectionTracker::new(backoff)),
            outbox: Mutex::new(Outbox::default()),
            stats: Mutex::new(PublisherStats::default()),
        }
    }

    fn state(&self) -> ConnectionState {
        lock(&self.tracker).state()
    }

    fn apply(&self, event: LinkEvent) -> Option<Duration> {
        lock(&self.tracker).apply(event)
    }

    /// Lock order is outbox then tracker, shared with `on_connected`, so an
    /// event cannot be held after the flush that should have carried it.
    fn admit(&self, event: OutboundEvent) {
        let (admission, state) = {
            let mut outbox = lock(&self.outbox);
            let state = self.state();
            (outbox.admit(event, state), state)
        };
        match admission {
            Admission::Send(event) => {
                self.send(event);
            }
            Admission::Held => trace!(%state, "Holding durable event until reconnect"),
            Admission::Dropped => lock(&self.stats).record_dropped(),
        }
    }

    /// Hand an event to the client's request queue without waiting
    ///
    /// Returns whether the client accepted it.
    fn send(&self, event: OutboundEvent) -> bool {
        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %event.topic, error = %PublishError::from(e), "Dropping event");
                lock(&self.stats).record_dropped();
                return false;
            }
        };

        match self
            .client
            .try_publish(event.topic.clone(), to_mqtt_qos(event.qos), event.retain, payload)
        {
            Ok(()) => {
                trace!(topic = %event.topic, "Published event");
                lock(&self.stats).record_sent(&event, unix_timestamp());
                true
            }
            Err(e) => {
                trace!(topic = %event.topic, error = %e, "Request queue rejected event");
                if event.is_durable() {
                    lock(&self.outbox).hold(event);
                } else {
                    lock(&self.stats).record_dropped();
                }
                false
            }
        }
    }

    fn on_connected(&self, status_topic: &str) {
        let held = {
            let mut outbox = lock(&self.outbox);
            self.apply(LinkEvent::Connected);
            outbox.take_held()
        };
        if !held.is_empty() {
            debug!(count = held.len(), "Flushing held events");
        }
        for event in held {
            self.send(event);
        }
        self.send(OutboundEvent::status(status_topic, Presence::Online));
    }
}

/// Publisher that keeps a broker session alive in the background
///
/// `connect` returns immediately; the session is established, lost and
/// re-established by a driver task. Level events published while the session
/// is down are dropped, status events are held for the next session.
pub struct ResilientPublisher {
    session: Arc<Session>,
    options: PublisherOptions,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientPublisher {
    /// Start the session driver and the probe; must be called inside a runtime
    pub fn connect(options: PublisherOptions) -> Arc<Self> {
        info!(
            broker = %options.broker,
            port = options.port,
            client_id = %options.client_id,
            "Starting broker session"
        );

        let (client, eventloop) =
            AsyncClient::new(options.mqtt_options(), options.request_capacity.max(1));
        let backoff = Backoff::new(options.reconnect_min_delay, options.reconnect_max_delay);
        let session = Arc::new(Session::new(client, backoff));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(drive_session(
            eventloop,
            Arc::clone(&session),
            options.status_topic.clone(),
            shutdown_rx.clone(),
        ));
        let probe = tokio::spawn(run_probe(
            Arc::clone(&session),
            options.ping_topic.clone(),
            options.ping_interval,
            shutdown_rx,
        ));

        Arc::new(Self {
            session,
            options,
            shutdown,
            driver: Mutex::new(Some(driver)),
            probe: Mutex::new(Some(probe)),
        })
    }
}

#[async_trait]
impl Publisher for ResilientPublisher {
    fn publish(&self, event: OutboundEvent) {
        self.session.admit(event);
    }

    fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    fn stats(&self) -> PublisherStats {
        let mut stats = lock(&self.session.stats).clone();
        stats.reconnect_attempts = lock(&self.session.tracker).reconnect_attempts();
        stats
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        let probe = lock(&self.probe).take();
        let driver = lock(&self.driver).take();
        if let Some(probe) = probe {
            probe.abort();
        }

        let mut outcome = Ok(());
        if self.session.state() == ConnectionState::Connected {
            let offline = OutboundEvent::status(&self.options.status_topic, Presence::Offline);
            let payload = offline.to_bytes()?;
            match self
                .session
                .client
                .publish(offline.topic.clone(), QoS::AtLeastOnce, true, payload)
                .await
            {
                Ok(()) => lock(&self.session.stats).record_sent(&offline, unix_timestamp()),
                Err(e) => outcome = Err(PublishError::Connection(e.to_string())),
            }
            if let Err(e) = self.session.client.disconnect().await {
                outcome = outcome.and(Err(PublishError::Connection(e.to_string())));
            }
        } else {
            info!(state = %self.session.state(), "Not connected, leaving offline status to the last will");
        }

        if let Some(mut driver) = driver {
            if self.session.state() != ConnectionState::Connected {
                let _ = self.shutdown.send(true);
            }
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut driver).await.is_err() {
                warn!("Broker session did not close in time");
                let _ = self.shutdown.send(true);
                driver.abort();
                outcome = outcome.and(Err(PublishError::Timeout(DISCONNECT_TIMEOUT)));
            }
        }
        let _ = self.shutdown.send(true);

        self.session.apply(LinkEvent::Closed);
        info!("Broker session closed");
        outcome
    }
}

/// Poll the event loop, translating its outcomes into link events
async fn drive_session(
    mut eventloop: EventLoop,
    session: Arc<Session>,
    status_topic: String,
    mut shutdown: watch::Receiver<bool>,
) {
    session.apply(LinkEvent::Connecting);

    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                info!("Connected to broker");
                session.on_connected(&status_topic);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping session driver");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let link_event = if session.state() == ConnectionState::Connected {
                    warn!(error = %e, "Lost connection to broker");
                    LinkEvent::ConnectionLost
                } else {
                    warn!(error = %e, "Failed to connect to broker");
                    LinkEvent::ConnectFailed
                };

                if let Some(delay) = session.apply(link_event) {
                    debug!(?delay, "Waiting before reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                session.apply(LinkEvent::Connecting);
            }
        }
    }
}

/// Periodic connectivity probe
async fn run_probe(
    session: Arc<Session>,
    ping_topic: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        if session.state() != ConnectionState::Connected {
            continue;
        }

        if session.send(OutboundEvent::ping(ping_topic.as_str())) {
            failures = 0;
        } else {
            failures += 1;
            if failures == PING_FAILURE_WARN {
                warn!(failures, "Connectivity probe keeps failing");
            }
        }
    }
}
