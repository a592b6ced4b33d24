//! Integration tests for the subnet-flood gaze exchange.
//!
//! Peers run in one process and find each other on the loopback interface
//! through a fixed candidate list covering a free port range.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use wayl_core::{EndpointKey, GazePosition, SenderId, GAZE_TOPIC, HEARTBEAT_TOPIC};
use wayl_peer::application::exchange::{ExchangeError, GazeExchange};
use wayl_peer::application::subnet_stream::{Candidates, SubnetFloodConfig, SubnetFloodExchange};
use wayl_peer::infrastructure::network::discovery::PortRange;
use wayl_peer::infrastructure::network::liveness::LivenessConfig;
use wayl_peer::infrastructure::transport::publisher::Publisher;
use wayl_peer::infrastructure::transport::subscriber::Subscriber;
use wayl_peer::infrastructure::transport::{ConnectionSettings, TransportError};

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Finds `count` consecutive ports that are currently free.
fn free_range(count: u16) -> PortRange {
    for _ in 0..50 {
        let probe = std::net::TcpListener::bind("0.0.0.0:0").expect("probe");
        let start = probe.local_addr().unwrap().port();
        drop(probe);
        let Some(end) = start.checked_add(count - 1) else { continue };
        if (start..=end).all(|p| std::net::TcpListener::bind(("0.0.0.0", p)).is_ok()) {
            return PortRange::new(start, end);
        }
    }
    panic!("could not find {count} consecutive free ports");
}

fn loopback_candidates(range: PortRange) -> Candidates {
    Candidates::Fixed(
        range
            .iter()
            .map(|port| EndpointKey::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            .collect(),
    )
}

/// Fast timings so liveness decisions land within a test's patience.
fn fast_config(range: PortRange, liveness_timeout: Duration) -> SubnetFloodConfig {
    SubnetFloodConfig {
        ports: range,
        heartbeat_interval: Duration::from_millis(100),
        receive_timeout: Duration::from_millis(50),
        liveness: LivenessConfig {
            timeout: liveness_timeout,
            check_interval: Duration::from_millis(100),
            disconnect_pause: Duration::ZERO,
            rediscovery_interval: None,
        },
        connection: ConnectionSettings {
            reconnect_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(200),
        },
        candidates: loopback_candidates(range),
    }
}

fn pos(x: f64, y: f64) -> GazePosition {
    GazePosition::new(x, y).unwrap()
}

/// Keeps sending `position` from `sender` until `receiver` has it.
async fn send_until_seen(sender: &SubnetFloodExchange, receiver: &SubnetFloodExchange, position: GazePosition) {
    let sender_id = sender.local_id().expect("sender publishes");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        sender.send(position).await.expect("send");
        if receiver.read().expect("running").get(&sender_id) == Some(&position) {
            return;
        }
        assert!(Instant::now() < deadline, "{sender_id} never reached the receiver");
        sleep(Duration::from_millis(50)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_peers_exchange_gaze_over_loopback() {
    // Arrange
    let range = free_range(2);
    let a = SubnetFloodExchange::new(fast_config(range, Duration::from_secs(3)));
    let b = SubnetFloodExchange::new(fast_config(range, Duration::from_secs(3)));
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Act
    send_until_seen(&a, &b, pos(0.25, 0.75)).await;
    send_until_seen(&b, &a, pos(0.6, 0.4)).await;

    // Assert: each side sees exactly the other, never itself
    let seen_by_a = a.read().unwrap();
    assert_eq!(seen_by_a.len(), 1);
    assert_eq!(seen_by_a.get(&b.local_id().unwrap()), Some(&pos(0.6, 0.4)));
    let seen_by_b = b.read().unwrap();
    assert_eq!(seen_by_b.len(), 1);
    assert_eq!(seen_by_b.get(&a.local_id().unwrap()), Some(&pos(0.25, 0.75)));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_second_peer_falls_back_to_next_port() {
    // Arrange
    let range = free_range(3);
    let a = SubnetFloodExchange::new(fast_config(range, Duration::from_secs(3)));
    let b = SubnetFloodExchange::new(fast_config(range, Duration::from_secs(3)));

    // Act
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Assert
    assert_eq!(a.publish_port(), Some(range.start));
    assert_eq!(b.publish_port(), Some(range.start + 1));
    let a_id = a.local_id().unwrap().to_string();
    assert!(a_id.ends_with(&format!("_{}", range.start)), "unexpected id {a_id}");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_exhausted_port_range_fails_start() {
    // Arrange: occupy the only port
    let range = free_range(1);
    let _blocker = std::net::TcpListener::bind(("0.0.0.0", range.start)).unwrap();
    let exchange = SubnetFloodExchange::new(fast_config(range, Duration::from_secs(3)));

    // Act
    let result = exchange.start().await;

    // Assert
    assert!(matches!(result, Err(ExchangeError::Transport(TransportError::NoFreePort { .. }))));
    assert!(!exchange.is_running());
}

#[tokio::test]
async fn test_silent_peer_is_evicted_and_its_gaze_cleared() {
    // Arrange
    let range = free_range(2);
    let a = SubnetFloodExchange::new(fast_config(range, Duration::from_millis(800)));
    let b = SubnetFloodExchange::new(fast_config(range, Duration::from_millis(800)));
    a.start().await.unwrap();
    b.start().await.unwrap();
    send_until_seen(&b, &a, pos(0.5, 0.5)).await;
    let b_id: SenderId = b.local_id().unwrap();

    // Act: b disappears
    b.stop().await;
    drop(b);

    // Assert: a forgets b's gaze once the liveness timeout has passed
    let cleared = timeout(Duration::from_secs(5), async {
        while a.read().unwrap().contains_key(&b_id) {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(cleared.is_ok(), "gaze of a silent peer was never cleared");
    assert!(a.is_running());

    a.stop().await;
}

#[tokio::test]
async fn test_lifecycle_errors() {
    // Arrange
    let range = free_range(1);
    let exchange = SubnetFloodExchange::new(fast_config(range, Duration::from_secs(3)));

    // Assert: nothing to read before start
    assert!(matches!(exchange.read(), Err(ExchangeError::NotRunning)));

    // Act
    exchange.start().await.unwrap();
    exchange.start().await.unwrap();
    assert!(exchange.read().unwrap().is_empty());
    exchange.stop().await;

    // Assert: a stopped exchange stays stopped
    assert!(matches!(exchange.read(), Err(ExchangeError::NotRunning)));
    assert!(matches!(exchange.start().await, Err(ExchangeError::Stopped)));
    assert!(matches!(exchange.send(pos(0.1, 0.1)).await, Err(ExchangeError::Stopped)));
}

#[tokio::test]
async fn test_send_before_start_binds_publisher() {
    // Arrange
    let range = free_range(1);
    let exchange = SubnetFloodExchange::new(fast_config(range, Duration::from_secs(3)));

    // Act
    exchange.send(pos(0.2, 0.2)).await.unwrap();

    // Assert: advertised, but not yet receiving
    assert_eq!(exchange.publish_port(), Some(range.start));
    assert!(exchange.local_id().is_some());
    assert!(!exchange.is_running());
    exchange.stop().await;
}

#[tokio::test]
async fn test_heartbeat_topic_is_reserved_on_both_ends() {
    // Arrange
    let range = free_range(1);
    let publisher = Publisher::bind(range).unwrap();
    let mut subscriber = Subscriber::new(ConnectionSettings::default());

    // Act
    let sent = publisher.send(HEARTBEAT_TOPIC, "10.0.0.1:9000");
    let subscribed = subscriber.subscribe(&[GAZE_TOPIC, HEARTBEAT_TOPIC]);

    // Assert
    assert!(matches!(sent, Err(TransportError::ReservedTopic(_))));
    assert!(matches!(subscribed, Err(TransportError::ReservedTopic(_))));
    publisher.close();
}
