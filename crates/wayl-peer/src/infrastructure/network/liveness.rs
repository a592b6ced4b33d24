//! Heartbeat-driven liveness tracking for subscriber endpoints.
//!
//! # State machine (for beginners)
//!
//! Every candidate endpoint produced by discovery starts out *unverified*.
//!
//! ```text
//!   register ──▶ Unverified ──heartbeat──▶ Alive ──heartbeat──▶ Alive
//!                    │                       │
//!                    └── silent for T ───────┴──▶ Evicted (forgotten)
//! ```
//!
//! An unverified endpoint ages from the moment it was registered, so the
//! thousands of dead candidates of a subnet sweep are pruned after one
//! timeout `T` just like a peer that stopped heartbeating.
//!
//! [`EndpointTracker`] is the pure state machine; it takes `Instant`s from
//! the caller and is unit-tested without any clock.  [`LivenessMonitor`] is
//! the async task that feeds it from the subscriber's heartbeat stream,
//! disconnects evicted endpoints and reports each eviction on a channel so
//! the single writer of the gaze table can clear that peer's entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};
use wayl_core::{EndpointKey, PeerEndpoint};

use crate::infrastructure::transport::subscriber::ConnectionSet;
use crate::infrastructure::transport::InboundHeartbeat;

/// Observable state of a tracked endpoint.  Evicted endpoints are untracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Unverified,
    Alive,
}

/// Pure bookkeeping of endpoint freshness.
#[derive(Debug, Default)]
pub struct EndpointTracker {
    endpoints: HashMap<EndpointKey, PeerEndpoint>,
}

impl EndpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `key` as unverified.  Returns `false` if it was
    /// already tracked (its state is left alone).
    pub fn register(&mut self, key: EndpointKey, now: Instant) -> bool {
        if self.endpoints.contains_key(&key) {
            return false;
        }
        self.endpoints.insert(key, PeerEndpoint::new(key, now));
        true
    }

    /// Marks `key` alive at `now`.  Returns `false` for untracked endpoints.
    pub fn record_heartbeat(&mut self, key: &EndpointKey, now: Instant) -> bool {
        match self.endpoints.get_mut(key) {
            Some(endpoint) => {
                endpoint.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, key: &EndpointKey) -> Option<EndpointState> {
        self.endpoints.get(key).map(|endpoint| {
            if endpoint.is_verified() {
                EndpointState::Alive
            } else {
                EndpointState::Unverified
            }
        })
    }

    /// Endpoints silent for at least `timeout` as of `now`, in key order.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<EndpointKey> {
        let mut keys: Vec<EndpointKey> = self
            .endpoints
            .values()
            .filter(|endpoint| now.saturating_duration_since(endpoint.freshness()) >= timeout)
            .map(|endpoint| endpoint.key)
            .collect();
        keys.sort();
        keys
    }

    pub fn evict(&mut self, key: &EndpointKey) -> Option<PeerEndpoint> {
        self.endpoints.remove(key)
    }

    /// Forgets every endpoint and returns their keys in key order.
    pub fn evict_all(&mut self) -> Vec<EndpointKey> {
        let mut keys: Vec<EndpointKey> = self.endpoints.drain().map(|(key, _)| key).collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &EndpointKey) -> bool {
        self.endpoints.contains_key(key)
    }

    /// Number of endpoints that have heartbeated at least once.
    pub fn alive_count(&self) -> usize {
        self.endpoints.values().filter(|e| e.is_verified()).count()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Timing of the liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Silence after which an endpoint is evicted (`T`).
    pub timeout: Duration,
    /// How often the tracker is scanned for expired endpoints.
    pub check_interval: Duration,
    /// Pause between successive disconnects of one scan.
    pub disconnect_pause: Duration,
    /// How often evicted candidates are re-registered; `None` disables it.
    pub rediscovery_interval: Option<Duration>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            disconnect_pause: Duration::from_millis(10),
            rediscovery_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Produces the current candidate endpoints for rediscovery.
pub type CandidateSource = Box<dyn Fn() -> Vec<EndpointKey> + Send + Sync>;

/// Async task that keeps the tracker and the subscriber's connections in step.
pub struct LivenessMonitor {
    tracker: EndpointTracker,
    config: LivenessConfig,
    heartbeats: mpsc::Receiver<InboundHeartbeat>,
    connections: ConnectionSet,
    evictions: mpsc::UnboundedSender<EndpointKey>,
    running: Arc<AtomicBool>,
    rediscover: Option<CandidateSource>,
}

impl LivenessMonitor {
    pub fn new(
        config: LivenessConfig,
        heartbeats: mpsc::Receiver<InboundHeartbeat>,
        connections: ConnectionSet,
        evictions: mpsc::UnboundedSender<EndpointKey>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tracker: EndpointTracker::new(),
            config,
            heartbeats,
            connections,
            evictions,
            running,
            rediscover: None,
        }
    }

    /// Re-registers and reconnects candidates from `source` every
    /// `rediscovery_interval`, so peers that join late are still found.
    pub fn with_rediscovery(mut self, source: CandidateSource) -> Self {
        self.rediscover = Some(source);
        self
    }

    /// Starts tracking `keys`, all unverified as of now.
    pub fn register_all(&mut self, keys: impl IntoIterator<Item = EndpointKey>) {
        let now = Instant::now();
        for key in keys {
            self.tracker.register(key, now);
        }
    }

    pub fn tracker(&self) -> &EndpointTracker {
        &self.tracker
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the running flag is cleared or the heartbeat stream ends.
    pub async fn run(mut self) {
        info!(
            "liveness monitor started: {} endpoint(s), timeout {:?}",
            self.tracker.len(),
            self.config.timeout
        );
        let mut last_scan = Instant::now();
        let mut last_rediscovery = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            match time::timeout(self.config.timeout, self.heartbeats.recv()).await {
                Ok(Some(inbound)) => self.on_heartbeat(inbound, Instant::now()),
                Ok(None) => {
                    debug!("heartbeat stream closed");
                    break;
                }
                Err(_) => self.on_total_silence(),
            }

            if last_scan.elapsed() >= self.config.check_interval {
                self.scan(Instant::now()).await;
                last_scan = Instant::now();
            }

            if let Some(interval) = self.config.rediscovery_interval {
                if last_rediscovery.elapsed() >= interval {
                    self.rediscover();
                    last_rediscovery = Instant::now();
                }
            }
        }
        info!("liveness monitor stopped");
    }

    /// Refreshes only the endpoint that delivered the heartbeat.
    ///
    /// The announced addresses are not trusted for liveness: every peer also
    /// announces `127.0.0.1:<port>`, which names a different process on each
    /// host sharing the port range.
    fn on_heartbeat(&mut self, inbound: InboundHeartbeat, now: Instant) {
        if !self.tracker.record_heartbeat(&inbound.via, now) {
            trace!("heartbeat via untracked endpoint {}", inbound.via);
        }
        if let Some(heartbeat) = inbound.heartbeat {
            trace!("heartbeat via {} announces {}", inbound.via, heartbeat.endpoint());
        }
    }

    fn on_total_silence(&mut self) {
        if self.tracker.is_empty() {
            trace!("no heartbeats and nothing tracked");
            return;
        }
        let evicted = self.tracker.evict_all();
        warn!(
            "no heartbeat for {:?}; evicting all {} endpoint(s)",
            self.config.timeout,
            evicted.len()
        );
        self.connections.close_all();
        for key in evicted {
            self.report_eviction(key);
        }
    }

    async fn scan(&mut self, now: Instant) {
        let expired = self.tracker.expired(now, self.config.timeout);
        if expired.is_empty() {
            return;
        }
        debug!("evicting {} silent endpoint(s)", expired.len());
        for (i, key) in expired.into_iter().enumerate() {
            if i > 0 && !self.config.disconnect_pause.is_zero() {
                time::sleep(self.config.disconnect_pause).await;
            }
            let was_alive = self.tracker.state(&key) == Some(EndpointState::Alive);
            self.tracker.evict(&key);
            self.connections.disconnect(&key);
            if was_alive {
                info!("peer endpoint {key} went silent; evicted");
            }
            self.report_eviction(key);
        }
    }

    fn rediscover(&mut self) {
        let Some(source) = &self.rediscover else { return };
        let now = Instant::now();
        let mut added = 0;
        for key in source() {
            if self.tracker.register(key, now) {
                self.connections.connect(key);
                added += 1;
            }
        }
        if added > 0 {
            debug!("rediscovery re-registered {added} endpoint(s)");
        }
    }

    fn report_eviction(&self, key: EndpointKey) {
        // The receiver is gone only while shutting down.
        let _ = self.evictions.send(key);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::subscriber::Subscriber;
    use crate::infrastructure::transport::ConnectionSettings;
    use std::net::{IpAddr, Ipv4Addr};
    use wayl_core::HeartbeatMessage;

    const T: Duration = Duration::from_secs(5);

    fn key(port: u16) -> EndpointKey {
        EndpointKey::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    // ── EndpointTracker ───────────────────────────────────────────────────────

    #[test]
    fn test_registered_endpoint_starts_unverified() {
        let mut tracker = EndpointTracker::new();
        assert!(tracker.register(key(1), Instant::now()));
        assert_eq!(tracker.state(&key(1)), Some(EndpointState::Unverified));
    }

    #[test]
    fn test_register_twice_keeps_existing_state() {
        // Arrange
        let t0 = Instant::now();
        let mut tracker = EndpointTracker::new();
        tracker.register(key(1), t0);
        tracker.record_heartbeat(&key(1), t0);

        // Act
        let added = tracker.register(key(1), t0 + Duration::from_secs(1));

        // Assert
        assert!(!added);
        assert_eq!(tracker.state(&key(1)), Some(EndpointState::Alive));
    }

    #[test]
    fn test_unverified_endpoint_expires_after_timeout_from_registration() {
        // Arrange
        let t0 = Instant::now();
        let mut tracker = EndpointTracker::new();
        tracker.register(key(1), t0);

        // Act / Assert
        assert!(tracker.expired(t0 + T - Duration::from_millis(1), T).is_empty());
        assert_eq!(tracker.expired(t0 + T, T), vec![key(1)]);
    }

    #[test]
    fn test_heartbeating_endpoint_is_never_expired() {
        // Arrange: heartbeats every second for twenty seconds
        let t0 = Instant::now();
        let mut tracker = EndpointTracker::new();
        tracker.register(key(1), t0);

        // Act / Assert
        for second in 1..=20 {
            let now = t0 + Duration::from_secs(second);
            tracker.record_heartbeat(&key(1), now);
            assert!(tracker.expired(now, T).is_empty(), "expired at {second}s");
        }
        assert_eq!(tracker.state(&key(1)), Some(EndpointState::Alive));
    }

    #[test]
    fn test_silent_peer_expires_while_live_peer_stays() {
        // Arrange: both alive at t0, only key(2) keeps heartbeating
        let t0 = Instant::now();
        let mut tracker = EndpointTracker::new();
        for k in [key(1), key(2)] {
            tracker.register(k, t0);
            tracker.record_heartbeat(&k, t0);
        }
        let later = t0 + Duration::from_secs(6);
        tracker.record_heartbeat(&key(2), later);

        // Act
        let expired = tracker.expired(later, T);

        // Assert
        assert_eq!(expired, vec![key(1)]);
    }

    #[test]
    fn test_heartbeat_for_untracked_endpoint_is_ignored() {
        let mut tracker = EndpointTracker::new();
        assert!(!tracker.record_heartbeat(&key(9), Instant::now()));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_evict_and_evict_all() {
        let now = Instant::now();
        let mut tracker = EndpointTracker::new();
        for p in [3, 1, 2] {
            tracker.register(key(p), now);
        }

        assert!(tracker.evict(&key(2)).is_some());
        assert!(tracker.state(&key(2)).is_none());
        assert_eq!(tracker.evict_all(), vec![key(1), key(3)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_alive_count() {
        let now = Instant::now();
        let mut tracker = EndpointTracker::new();
        tracker.register(key(1), now);
        tracker.register(key(2), now);
        tracker.record_heartbeat(&key(2), now);
        assert_eq!(tracker.alive_count(), 1);
        assert_eq!(tracker.len(), 2);
    }

    // ── LivenessMonitor ───────────────────────────────────────────────────────

    fn fast_config() -> LivenessConfig {
        LivenessConfig {
            timeout: Duration::from_millis(300),
            check_interval: Duration::from_millis(50),
            disconnect_pause: Duration::from_millis(1),
            rediscovery_interval: None,
        }
    }

    #[tokio::test]
    async fn test_monitor_evicts_silent_endpoint_and_keeps_live_one() {
        // Arrange
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        let (hb_tx, hb_rx) = mpsc::channel(16);
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let mut monitor =
            LivenessMonitor::new(fast_config(), hb_rx, subscriber.connections(), evict_tx, Arc::clone(&running));
        monitor.register_all([key(1), key(2)]);
        subscriber.add_endpoints([key(1), key(2)]);
        subscriber.start();
        let handle = monitor.spawn();

        // Act: only key(2) heartbeats
        let feeder = tokio::spawn(async move {
            for _ in 0..20 {
                let beat = InboundHeartbeat {
                    via: key(2),
                    heartbeat: Some(HeartbeatMessage::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2)),
                };
                if hb_tx.send(beat).await.is_err() {
                    break;
                }
                time::sleep(Duration::from_millis(50)).await;
            }
        });
        let evicted = time::timeout(Duration::from_secs(2), evict_rx.recv()).await.expect("eviction reported");

        // Assert
        assert_eq!(evicted, Some(key(1)));
        let connections = subscriber.connections();
        assert!(!connections.contains(&key(1)));
        assert!(connections.contains(&key(2)));

        running.store(false, Ordering::Relaxed);
        feeder.await.unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn test_monitor_evicts_everything_on_total_silence() {
        // Arrange
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        let (_hb_tx, hb_rx) = mpsc::channel(16);
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let mut monitor =
            LivenessMonitor::new(fast_config(), hb_rx, subscriber.connections(), evict_tx, Arc::clone(&running));
        monitor.register_all([key(1), key(2)]);
        subscriber.add_endpoints([key(1), key(2)]);
        subscriber.start();

        // Act
        let handle = monitor.spawn();
        let mut evicted = Vec::new();
        while evicted.len() < 2 {
            let next = time::timeout(Duration::from_secs(2), evict_rx.recv()).await.expect("eviction reported");
            evicted.extend(next);
        }

        // Assert
        evicted.sort();
        assert_eq!(evicted, vec![key(1), key(2)]);
        assert!(subscriber.connections().is_empty());

        running.store(false, Ordering::Relaxed);
        handle.abort();
    }

    #[tokio::test]
    async fn test_rediscovery_reregisters_evicted_candidates() {
        // Arrange
        let subscriber = Subscriber::new(ConnectionSettings::default());
        let (_hb_tx, hb_rx) = mpsc::channel(16);
        let (evict_tx, _evict_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let mut monitor =
            LivenessMonitor::new(fast_config(), hb_rx, subscriber.connections(), evict_tx, running)
                .with_rediscovery(Box::new(|| vec![key(7)]));

        // Act
        monitor.rediscover();

        // Assert
        assert_eq!(monitor.tracker().state(&key(7)), Some(EndpointState::Unverified));
        assert!(subscriber.connections().contains(&key(7)));
    }

    fn remote(port: u16) -> EndpointKey {
        EndpointKey::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port)
    }

    /// Heartbeat from the remote peer on `port`, announcing both of its addresses.
    fn remote_beats(port: u16) -> [InboundHeartbeat; 2] {
        [
            InboundHeartbeat {
                via: remote(port),
                heartbeat: Some(HeartbeatMessage::new(remote(port).address, port)),
            },
            InboundHeartbeat {
                via: remote(port),
                heartbeat: Some(HeartbeatMessage::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
            },
        ]
    }

    #[test]
    fn test_loopback_announcement_from_remote_peer_does_not_refresh_local_endpoint() {
        // Arrange: a dead local peer and a live remote peer share port 9001
        let subscriber = Subscriber::new(ConnectionSettings::default());
        let (_hb_tx, hb_rx) = mpsc::channel(16);
        let (evict_tx, _evict_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let mut monitor = LivenessMonitor::new(fast_config(), hb_rx, subscriber.connections(), evict_tx, running);
        let t0 = Instant::now();
        monitor.tracker.register(key(9001), t0);
        monitor.tracker.register(remote(9001), t0);

        // Act: two seconds of remote heartbeats
        for tick in 1..=40 {
            let now = t0 + Duration::from_millis(50 * tick);
            for beat in remote_beats(9001) {
                monitor.on_heartbeat(beat, now);
            }
        }

        // Assert
        let now = t0 + Duration::from_secs(2);
        let timeout = fast_config().timeout;
        assert_eq!(monitor.tracker().expired(now, timeout), vec![key(9001)]);
        assert_eq!(monitor.tracker().state(&key(9001)), Some(EndpointState::Unverified));
        assert_eq!(monitor.tracker().state(&remote(9001)), Some(EndpointState::Alive));
    }

    #[tokio::test]
    async fn test_monitor_evicts_silent_local_endpoint_despite_remote_loopback_announcements() {
        // Arrange
        let subscriber = Subscriber::new(ConnectionSettings::default());
        let (hb_tx, hb_rx) = mpsc::channel(16);
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let config = fast_config();
        let mut monitor =
            LivenessMonitor::new(config, hb_rx, subscriber.connections(), evict_tx, Arc::clone(&running));
        monitor.register_all([key(9001), remote(9001)]);
        let handle = monitor.spawn();

        // Act: only the remote peer heartbeats
        let feeder = tokio::spawn(async move {
            for _ in 0..30 {
                for beat in remote_beats(9001) {
                    if hb_tx.send(beat).await.is_err() {
                        return;
                    }
                }
                time::sleep(Duration::from_millis(50)).await;
            }
        });
        let evicted = time::timeout(config.timeout + config.check_interval * 4, evict_rx.recv())
            .await
            .expect("local endpoint evicted within the liveness timeout");

        // Assert
        assert_eq!(evicted, Some(key(9001)));

        running.store(false, Ordering::Relaxed);
        feeder.abort();
        handle.abort();
    }
}
