//! Subscribing side of the transport.
//!
//! A [`Subscriber`] maintains one connection task per endpoint.  Each task
//! runs the same loop:
//!
//! 1. Connect (bounded by `connect_timeout`).
//! 2. Read frames: 8-byte header first, then exactly `topic + payload` bytes.
//! 3. Route the frame: heartbeats go to the heartbeat channel tagged with the
//!    endpoint, matching application frames go to the application channel,
//!    everything else is dropped.
//! 4. On any disconnect, wait `reconnect_interval` and go back to step 1.
//!
//! Both channels are written with `try_send`: a consumer that stops reading
//! must never stall the socket readers, otherwise live peers would stop
//! heartbeating from the monitor's point of view.
//!
//! The set of connection tasks is shared through [`ConnectionSet`] so the
//! liveness monitor can disconnect evicted endpoints from its own task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};
use wayl_core::protocol::codec::{decode_frame_body, decode_frame_header, decode_text_payload};
use wayl_core::protocol::messages::{is_reserved_topic, FRAME_HEADER_SIZE};
use wayl_core::{EndpointKey, Frame, HeartbeatMessage, HEARTBEAT_TOPIC};

use super::{ConnectionSettings, InboundHeartbeat, TopicMessage, TransportError};

/// Capacity of the application message channel.
const APP_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the heartbeat channel.
const HEARTBEAT_CHANNEL_CAPACITY: usize = 1024;

/// A multi-endpoint TCP subscriber.
pub struct Subscriber {
    pending: Vec<EndpointKey>,
    filters: Vec<String>,
    started: bool,
    connections: ConnectionSet,
    app_rx: mpsc::Receiver<TopicMessage>,
    heartbeat_rx: Option<mpsc::Receiver<InboundHeartbeat>>,
}

impl Subscriber {
    pub fn new(settings: ConnectionSettings) -> Self {
        let (app_tx, app_rx) = mpsc::channel(APP_CHANNEL_CAPACITY);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(HEARTBEAT_CHANNEL_CAPACITY);
        Self {
            pending: Vec::new(),
            filters: Vec::new(),
            started: false,
            connections: ConnectionSet::new(settings, app_tx, heartbeat_tx),
            app_rx,
            heartbeat_rx: Some(heartbeat_rx),
        }
    }

    /// Adds endpoints to connect to.
    ///
    /// Before [`start`](Self::start) they are queued; afterwards they are
    /// connected immediately.  Duplicates are ignored.
    pub fn add_endpoints(&mut self, endpoints: impl IntoIterator<Item = EndpointKey>) {
        for key in endpoints {
            if self.started {
                self.connections.connect(key);
            } else if !self.pending.contains(&key) {
                self.pending.push(key);
            }
        }
    }

    /// Sets the topic prefixes delivered by [`receive`](Self::receive).
    ///
    /// # Errors
    ///
    /// - [`TransportError::ReservedTopic`] if a prefix overlaps the heartbeat
    ///   topic.  Nothing is changed and no socket activity happens.
    /// - [`TransportError::AlreadyStarted`] after [`start`](Self::start).
    pub fn subscribe(&mut self, prefixes: &[&str]) -> Result<(), TransportError> {
        if let Some(reserved) = prefixes.iter().find(|p| is_reserved_topic(p)) {
            return Err(TransportError::ReservedTopic((*reserved).to_string()));
        }
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        self.filters.extend(prefixes.iter().map(|p| (*p).to_string()));
        Ok(())
    }

    /// Opens connections to every queued endpoint.
    ///
    /// Idempotent: a second call does nothing and returns 0.  Must be called
    /// inside a Tokio runtime.
    pub fn start(&mut self) -> usize {
        if self.started {
            return 0;
        }
        self.started = true;
        self.connections.set_filters(self.filters.clone());
        let mut spawned = 0;
        for key in self.pending.drain(..) {
            if self.connections.connect(key) {
                spawned += 1;
            }
        }
        info!("subscriber started: {spawned} endpoint(s), filters {:?}", self.filters);
        spawned
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Waits for the next application message.
    ///
    /// Returns `None` when `timeout` elapses first; `None` as timeout waits
    /// indefinitely.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Option<TopicMessage> {
        match timeout {
            Some(limit) => time::timeout(limit, self.app_rx.recv()).await.ok().flatten(),
            None => self.app_rx.recv().await,
        }
    }

    /// Hands out the heartbeat stream (once).
    pub fn take_heartbeats(&mut self) -> Option<mpsc::Receiver<InboundHeartbeat>> {
        self.heartbeat_rx.take()
    }

    /// Shared handle to the connection tasks.
    pub fn connections(&self) -> ConnectionSet {
        self.connections.clone()
    }

    /// Closes every connection.
    pub fn close(&mut self) {
        let closed = self.connections.close_all();
        debug!("subscriber closed {closed} connection(s)");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.connections.close_all();
    }
}

// ── Connection set ────────────────────────────────────────────────────────────

/// Shared registry of per-endpoint connection tasks.
#[derive(Clone)]
pub struct ConnectionSet {
    inner: Arc<ConnectionSetInner>,
}

struct ConnectionSetInner {
    settings: ConnectionSettings,
    filters: RwLock<Arc<Vec<String>>>,
    app_tx: mpsc::Sender<TopicMessage>,
    heartbeat_tx: mpsc::Sender<InboundHeartbeat>,
    tasks: Mutex<HashMap<EndpointKey, JoinHandle<()>>>,
}

impl ConnectionSet {
    fn new(
        settings: ConnectionSettings,
        app_tx: mpsc::Sender<TopicMessage>,
        heartbeat_tx: mpsc::Sender<InboundHeartbeat>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionSetInner {
                settings,
                filters: RwLock::new(Arc::new(Vec::new())),
                app_tx,
                heartbeat_tx,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn set_filters(&self, filters: Vec<String>) {
        *self.inner.filters.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(filters);
    }

    /// Spawns a connection task for `key` unless one is already running.
    ///
    /// Returns `true` if a task was spawned.
    pub fn connect(&self, key: EndpointKey) -> bool {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.get(&key).is_some_and(|task| !task.is_finished()) {
            return false;
        }
        let filters = Arc::clone(&self.inner.filters.read().unwrap_or_else(|e| e.into_inner()));
        let task = tokio::spawn(connection_loop(
            key,
            filters,
            self.inner.settings,
            self.inner.app_tx.clone(),
            self.inner.heartbeat_tx.clone(),
        ));
        tasks.insert(key, task);
        true
    }

    /// Stops the connection task for `key`.  Returns `false` if none existed.
    pub fn disconnect(&self, key: &EndpointKey) -> bool {
        let removed = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        match removed {
            Some(task) => {
                task.abort();
                trace!("disconnected {key}");
                true
            }
            None => false,
        }
    }

    /// Stops every connection task and returns how many there were.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, task) in &drained {
            task.abort();
        }
        drained.len()
    }

    pub fn contains(&self, key: &EndpointKey) -> bool {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Connection task ───────────────────────────────────────────────────────────

enum ReadOutcome {
    /// The socket closed or the stream desynchronized; reconnect.
    Disconnected,
    /// The subscriber is gone; stop for good.
    ReceiverGone,
}

async fn connection_loop(
    key: EndpointKey,
    filters: Arc<Vec<String>>,
    settings: ConnectionSettings,
    app_tx: mpsc::Sender<TopicMessage>,
    heartbeat_tx: mpsc::Sender<InboundHeartbeat>,
) {
    loop {
        match time::timeout(settings.connect_timeout, TcpStream::connect(key.socket_addr())).await {
            Ok(Ok(stream)) => {
                debug!("connected to {key}");
                match read_frames(stream, key, &filters, &app_tx, &heartbeat_tx).await {
                    ReadOutcome::Disconnected => debug!("connection to {key} lost"),
                    ReadOutcome::ReceiverGone => return,
                }
            }
            Ok(Err(e)) => trace!("connect to {key} failed: {e}"),
            Err(_) => trace!("connect to {key} timed out"),
        }
        if app_tx.is_closed() {
            return;
        }
        time::sleep(settings.reconnect_interval).await;
    }
}

async fn read_frames(
    mut stream: TcpStream,
    key: EndpointKey,
    filters: &[String],
    app_tx: &mpsc::Sender<TopicMessage>,
    heartbeat_tx: &mpsc::Sender<InboundHeartbeat>,
) -> ReadOutcome {
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut header_buf).await {
            trace!("read from {key} ended: {e}");
            return ReadOutcome::Disconnected;
        }
        let header = match decode_frame_header(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                // Frame boundaries are lost; only a fresh connection recovers.
                warn!("bad frame header from {key}: {e}");
                return ReadOutcome::Disconnected;
            }
        };
        let mut body = vec![0u8; header.body_len()];
        if let Err(e) = stream.read_exact(&mut body).await {
            trace!("read from {key} ended mid-frame: {e}");
            return ReadOutcome::Disconnected;
        }
        let frame = match decode_frame_body(header, &body) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping undecodable frame from {key}: {e}");
                continue;
            }
        };

        if let Err(outcome) = route_frame(frame, key, filters, app_tx, heartbeat_tx) {
            return outcome;
        }
    }
}

fn route_frame(
    frame: Frame,
    key: EndpointKey,
    filters: &[String],
    app_tx: &mpsc::Sender<TopicMessage>,
    heartbeat_tx: &mpsc::Sender<InboundHeartbeat>,
) -> Result<(), ReadOutcome> {
    if frame.topic == HEARTBEAT_TOPIC {
        let heartbeat = decode_text_payload(&frame.payload)
            .ok()
            .and_then(|text| HeartbeatMessage::parse(&text).ok());
        // Lossy on purpose: the monitor only needs *some* heartbeats.
        let _ = heartbeat_tx.try_send(InboundHeartbeat { via: key, heartbeat });
        return Ok(());
    }

    if !filters.iter().any(|prefix| frame.topic.starts_with(prefix.as_str())) {
        return Ok(());
    }

    let message = TopicMessage {
        topic: frame.topic,
        payload: frame.payload,
        origin: key,
    };
    match app_tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!("application queue full; dropping frame from {key}");
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(ReadOutcome::ReceiverGone),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn key(port: u16) -> EndpointKey {
        EndpointKey::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn channels() -> (
        mpsc::Sender<TopicMessage>,
        mpsc::Receiver<TopicMessage>,
        mpsc::Sender<InboundHeartbeat>,
        mpsc::Receiver<InboundHeartbeat>,
    ) {
        let (app_tx, app_rx) = mpsc::channel(4);
        let (hb_tx, hb_rx) = mpsc::channel(4);
        (app_tx, app_rx, hb_tx, hb_rx)
    }

    fn frame(topic: &str, text: &str) -> Frame {
        Frame {
            topic: topic.to_string(),
            payload: wayl_core::protocol::codec::encode_payload(text).unwrap(),
        }
    }

    #[test]
    fn test_subscribe_rejects_heartbeat_topic_before_start() {
        // Arrange
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        subscriber.add_endpoints([key(9000)]);

        // Act
        let result = subscriber.subscribe(&["_alive"]);

        // Assert: rejected, nothing started, no connection task spawned
        assert!(matches!(result, Err(TransportError::ReservedTopic(_))));
        assert!(!subscriber.is_started());
        assert!(subscriber.connections().is_empty());
    }

    #[test]
    fn test_subscribe_rejects_prefix_of_heartbeat_topic() {
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        assert!(matches!(subscriber.subscribe(&["_al"]), Err(TransportError::ReservedTopic(_))));
    }

    #[tokio::test]
    async fn test_subscribe_after_start_is_rejected() {
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        subscriber.subscribe(&["gaze"]).unwrap();
        subscriber.start();
        assert!(matches!(subscriber.subscribe(&["other"]), Err(TransportError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        // Arrange
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        subscriber.add_endpoints([key(1), key(2), key(1)]);

        // Act
        let first = subscriber.start();
        let second = subscriber.start();

        // Assert
        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(subscriber.connections().len(), 2);
    }

    #[tokio::test]
    async fn test_receive_returns_none_on_timeout() {
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        subscriber.start();
        assert!(subscriber.receive(Some(Duration::from_millis(20))).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_and_close_all() {
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        subscriber.add_endpoints([key(1), key(2), key(3)]);
        subscriber.start();
        let connections = subscriber.connections();

        assert!(connections.disconnect(&key(1)));
        assert!(!connections.disconnect(&key(1)));
        assert!(!connections.contains(&key(1)));
        assert_eq!(connections.close_all(), 2);
        assert!(connections.is_empty());
    }

    #[test]
    fn test_take_heartbeats_only_once() {
        let mut subscriber = Subscriber::new(ConnectionSettings::default());
        assert!(subscriber.take_heartbeats().is_some());
        assert!(subscriber.take_heartbeats().is_none());
    }

    #[test]
    fn test_route_frame_sends_heartbeats_to_heartbeat_channel() {
        // Arrange
        let (app_tx, mut app_rx, hb_tx, mut hb_rx) = channels();
        let filters = vec!["gaze".to_string()];

        // Act
        let result = route_frame(frame(HEARTBEAT_TOPIC, "10.0.0.2:9001"), key(9001), &filters, &app_tx, &hb_tx);

        // Assert
        assert!(result.is_ok());
        let hb = hb_rx.try_recv().expect("heartbeat routed");
        assert_eq!(hb.via, key(9001));
        assert_eq!(hb.heartbeat, Some(HeartbeatMessage::new("10.0.0.2".parse().unwrap(), 9001)));
        assert!(app_rx.try_recv().is_err());
    }

    #[test]
    fn test_route_frame_keeps_unparseable_heartbeat_as_liveness_signal() {
        let (app_tx, _app_rx, hb_tx, mut hb_rx) = channels();
        let _ = route_frame(frame(HEARTBEAT_TOPIC, "garbage"), key(9001), &[], &app_tx, &hb_tx);
        let hb = hb_rx.try_recv().expect("heartbeat routed");
        assert_eq!(hb.heartbeat, None);
    }

    #[test]
    fn test_route_frame_filters_by_prefix() {
        // Arrange
        let (app_tx, mut app_rx, hb_tx, _hb_rx) = channels();
        let filters = vec!["gaze".to_string()];

        // Act
        let _ = route_frame(frame("gaze_exchange", "a:0.1,0.1"), key(1), &filters, &app_tx, &hb_tx);
        let _ = route_frame(frame("chat", "hello"), key(1), &filters, &app_tx, &hb_tx);

        // Assert
        let msg = app_rx.try_recv().expect("gaze frame delivered");
        assert_eq!(msg.topic, "gaze_exchange");
        assert_eq!(msg.origin, key(1));
        assert_eq!(msg.text().unwrap(), "a:0.1,0.1");
        assert!(app_rx.try_recv().is_err());
    }

    #[test]
    fn test_route_frame_drops_when_application_queue_full() {
        let (app_tx, _app_rx, hb_tx, _hb_rx) = channels();
        let filters = vec![String::new()];
        for _ in 0..10 {
            assert!(route_frame(frame("t", "x"), key(1), &filters, &app_tx, &hb_tx).is_ok());
        }
    }

    #[test]
    fn test_route_frame_reports_closed_receiver() {
        let (app_tx, app_rx, hb_tx, _hb_rx) = channels();
        drop(app_rx);
        let result = route_frame(frame("t", "x"), key(1), &[String::new()], &app_tx, &hb_tx);
        assert!(matches!(result, Err(ReadOutcome::ReceiverGone)));
    }
}
