//! Broker session behaviour of the rumqttc publisher
//!
//! One test points the publisher at a port nobody listens on; the others run a
//! minimal in-process broker that acknowledges sessions and records every
//! byte the client sends.

use micmon_core::domain::config::Settings;
use micmon_core::domain::event::{OutboundEvent, Presence};
use micmon_core::domain::publish::{ConnectionState, Publisher};
use micmon_infra::mqtt::{PublisherOptions, ResilientPublisher};
use micmon_tests::wait_until;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(10);

fn options(port: u16) -> PublisherOptions {
    let mut options = PublisherOptions::from_settings(&Settings::default());
    options.broker = "127.0.0.1".to_string();
    options.port = port;
    options.reconnect_min_delay = Duration::from_millis(20);
    options.reconnect_max_delay = Duration::from_millis(100);
    options.ping_interval = Duration::from_millis(50);
    options
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

/// Accept a session, answer its CONNECT with an accepting CONNACK
async fn accept_session(listener: &TcpListener) -> TcpStream {
    let (mut socket, _) = listener.accept().await.unwrap();
    let connect = read_packet(&mut socket).await;
    assert_eq!(connect[0] >> 4, 1, "first packet is CONNECT");
    socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
    socket
}

/// Read one MQTT packet: fixed header byte, remaining length, body
async fn read_packet(socket: &mut TcpStream) -> Vec<u8> {
    let mut packet = vec![socket.read_u8().await.unwrap()];
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = socket.read_u8().await.unwrap();
        packet.push(byte);
        remaining |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let start = packet.len();
    packet.resize(start + remaining, 0);
    socket.read_exact(&mut packet[start..]).await.unwrap();
    packet
}

// ============================================================================
// UNREACHABLE BROKER
// ============================================================================

#[tokio::test]
async fn test_unreachable_broker_backs_off_and_drops_levels() {
    let publisher = ResilientPublisher::connect(options(unused_port().await));

    assert!(wait_until(WAIT, || publisher.stats().reconnect_attempts >= 2).await);
    assert_ne!(publisher.connection_state(), ConnectionState::Connected);

    publisher.publish(OutboundEvent::level("microphones/left", 1, 600.0, 1));
    publisher.publish(OutboundEvent::level("microphones/left", 1, 610.0, 2));
    publisher.publish(OutboundEvent::status("microphones/status", Presence::Online));

    let stats = publisher.stats();
    assert_eq!(stats.messages_dropped, 2);
    assert_eq!(stats.messages_sent, 0);
    assert!(stats.last_message.is_none());

    // Nothing to flush without a session; the last will covers presence
    tokio::time::timeout(WAIT, publisher.disconnect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(publisher.connection_state(), ConnectionState::Disconnected);
}

// ============================================================================
// LIVE SESSION
// ============================================================================

#[tokio::test]
async fn test_session_announces_presence_and_disconnects_gracefully() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let connect = read_packet(&mut socket).await;
        assert_eq!(connect[0] >> 4, 1, "first packet is CONNECT");

        // CONNACK, session not present, accepted
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
        (connect, rest)
    });

    let publisher = ResilientPublisher::connect(options(port));
    assert!(wait_until(WAIT, || publisher.connection_state() == ConnectionState::Connected).await);
    assert!(
        wait_until(WAIT, || publisher
            .stats()
            .last_message
            .map(|m| m.summary.contains("online"))
            .unwrap_or(false))
        .await
    );

    publisher.publish(OutboundEvent::level("microphones/left", 1, 612.5, 7));
    assert!(wait_until(WAIT, || publisher.stats().messages_sent >= 2).await);

    tokio::time::timeout(WAIT, publisher.disconnect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(publisher.connection_state(), ConnectionState::Disconnected);

    let (connect, rest) = tokio::time::timeout(WAIT, broker).await.unwrap().unwrap();

    // The last will is registered with the session
    assert!(find(&connect, b"microphones/status", 0).is_some());
    assert!(find(&connect, br#"{"status":"offline"}"#, 0).is_some());
    assert!(find(&connect, b"mic_monitor", 0).is_some());

    let online = find(&rest, br#"{"status":"online"}"#, 0).expect("online status sent");
    let level = find(&rest, b"microphones/left", online).expect("level event sent");
    let offline = find(&rest, br#"{"status":"offline"}"#, level).expect("offline status sent");
    assert!(online < level && level < offline);
    assert_eq!(&rest[rest.len() - 2..], &[0xE0, 0x00], "session ends with DISCONNECT");
}

#[tokio::test]
async fn test_lost_session_reconnects_and_flushes_held_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (drop_first, first_dropped) = oneshot::channel::<()>();
    let (accept_second, second_accepted) = oneshot::channel::<()>();

    let broker = tokio::spawn(async move {
        let first = accept_session(&listener).await;
        first_dropped.await.unwrap();
        drop(first);

        // The client's next attempt waits in the backlog until released
        second_accepted.await.unwrap();
        let mut second = accept_session(&listener).await;
        let mut rest = Vec::new();
        let _ = second.read_to_end(&mut rest).await;
        rest
    });

    let publisher = ResilientPublisher::connect(options(port));
    assert!(wait_until(WAIT, || publisher.connection_state() == ConnectionState::Connected).await);
    assert_eq!(publisher.stats().reconnect_attempts, 0);

    drop_first.send(()).unwrap();
    assert!(wait_until(WAIT, || publisher.connection_state() != ConnectionState::Connected).await);
    assert!(wait_until(WAIT, || publisher.stats().reconnect_attempts >= 1).await);

    let dropped_before = publisher.stats().messages_dropped;
    publisher.publish(OutboundEvent::level("microphones/left", 1, 520.0, 2));
    publisher.publish(OutboundEvent::status("lab/presence", Presence::Online));
    assert_eq!(publisher.stats().messages_dropped, dropped_before + 1);

    accept_second.send(()).unwrap();
    assert!(wait_until(WAIT, || publisher.connection_state() == ConnectionState::Connected).await);
    assert_eq!(publisher.stats().reconnect_attempts, 0);

    publisher.publish(OutboundEvent::level("microphones/left", 0, 480.0, 3));
    // Leave room for a few connectivity pings on the new session
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(WAIT, publisher.disconnect())
        .await
        .unwrap()
        .unwrap();
    let rest = tokio::time::timeout(WAIT, broker).await.unwrap().unwrap();

    let held = find(&rest, b"lab/presence", 0).expect("held status flushed");
    let online = find(&rest, br#"{"status":"online"}"#, held).expect("online re-announced");
    let level = find(&rest, br#""level":480.0"#, online).expect("level delivered after reconnect");
    assert!(held < online && online < level);
    assert!(find(&rest, br#""level":520.0"#, 0).is_none(), "level from the outage was dropped");
    assert!(find(&rest, b"microphones/ping", 0).is_some(), "pings sent while connected");
}
