//! Publishing side of the transport.
//!
//! The publisher owns a TCP listener.  An accept task hands every new
//! connection its own writer task, and all writer tasks are fed from one
//! `tokio::sync::broadcast` channel.  That gives the send semantics we want:
//!
//! - `send` never waits for the network; it only pushes into the channel.
//! - A subscriber that falls behind loses the oldest frames (`Lagged`)
//!   instead of stalling everyone else.
//! - A subscriber that disappears only ends its own writer task.
//!
//! The heartbeat task announces `"<address>:<port>"` on the reserved topic
//! once per local interface address per interval.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};
use wayl_core::protocol::codec::{encode_frame, encode_payload};
use wayl_core::protocol::messages::is_reserved_topic;
use wayl_core::{HeartbeatMessage, HEARTBEAT_TOPIC};

use super::TransportError;
use crate::infrastructure::network::discovery::{self, DiscoveryError, PortRange};

/// Frames buffered per subscriber before the oldest are dropped.
const FRAME_BUFFER: usize = 256;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type SharedFrame = Arc<Vec<u8>>;

/// A bound TCP publisher.
///
/// Must be created inside a Tokio runtime.  Dropping the publisher stops its
/// accept and heartbeat tasks; connected subscribers then see end-of-stream.
pub struct Publisher {
    port: u16,
    frames: broadcast::Sender<SharedFrame>,
    subscribers: Arc<AtomicUsize>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Binds the first free port of `range` on all interfaces and starts
    /// accepting subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoFreePort`] when every port is taken.
    pub fn bind(range: PortRange) -> Result<Self, TransportError> {
        let (std_listener, port) = discovery::find_free_publish_port(range).map_err(|e| match e {
            DiscoveryError::NoFreePort { range } => TransportError::NoFreePort { range },
            DiscoveryError::Interfaces(io) => TransportError::Io(io),
        })?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;

        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        let subscribers = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_loop(listener, frames.clone(), Arc::clone(&subscribers)));

        info!("publisher listening on port {port}");
        Ok(Self {
            port,
            frames,
            subscribers,
            accept_task: Mutex::new(Some(accept_task)),
            heartbeat_task: Mutex::new(None),
        })
    }

    /// The port this publisher is bound to.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Publishes `payload` on `topic`.
    ///
    /// Delivery is best-effort: with no subscriber connected the frame is
    /// simply discarded.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ReservedTopic`] for the heartbeat topic.
    /// - [`TransportError::Protocol`] if the frame cannot be encoded.
    pub fn send<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<(), TransportError> {
        if is_reserved_topic(topic) {
            return Err(TransportError::ReservedTopic(topic.to_string()));
        }
        publish(&self.frames, topic, payload)
    }

    /// Starts (or restarts) the heartbeat task.
    ///
    /// Every `interval` the task publishes one heartbeat per entry of
    /// `addresses`, each carrying this publisher's port.
    pub fn start_heartbeat(&self, interval: Duration, addresses: Vec<IpAddr>) {
        let frames = self.frames.clone();
        let port = self.port;
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for address in &addresses {
                    let heartbeat = HeartbeatMessage::new(*address, port);
                    if let Err(e) = publish(&frames, HEARTBEAT_TOPIC, &heartbeat.to_wire()) {
                        warn!("failed to publish heartbeat {heartbeat}: {e}");
                    }
                }
            }
        });

        let mut slot = self.heartbeat_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        debug!("heartbeat started on port {port} every {interval:?}");
    }

    /// Stops accepting subscribers and stops heartbeating.
    pub fn close(&self) {
        for slot in [&self.accept_task, &self.heartbeat_task] {
            if let Some(task) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task.abort();
            }
        }
        debug!("publisher on port {} closed", self.port);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Encodes one frame and hands it to every writer task.
fn publish<T: Serialize + ?Sized>(
    frames: &broadcast::Sender<SharedFrame>,
    topic: &str,
    payload: &T,
) -> Result<(), TransportError> {
    let bytes = encode_frame(topic, &encode_payload(payload)?)?;
    // An error only means that nobody is connected right now.
    if frames.send(Arc::new(bytes)).is_err() {
        trace!("no subscriber for topic {topic:?}");
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    frames: broadcast::Sender<SharedFrame>,
    subscribers: Arc<AtomicUsize>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("subscriber connected from {peer}");
                let rx = frames.subscribe();
                tokio::spawn(writer_loop(stream, peer.to_string(), rx, Arc::clone(&subscribers)));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn writer_loop(
    mut stream: TcpStream,
    peer: String,
    mut rx: broadcast::Receiver<SharedFrame>,
    subscribers: Arc<AtomicUsize>,
) {
    subscribers.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = stream.set_nodelay(true) {
        trace!("set_nodelay failed for {peer}: {e}");
    }

    loop {
        match rx.recv().await {
            Ok(frame) => {
                if let Err(e) = stream.write_all(&frame).await {
                    debug!("subscriber {peer} gone: {e}");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("subscriber {peer} lagging, dropped {skipped} frame(s)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    subscribers.fetch_sub(1, Ordering::Relaxed);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use wayl_core::protocol::codec::{decode_frame_body, decode_frame_header, decode_text_payload};
    use wayl_core::protocol::messages::FRAME_HEADER_SIZE;
    use wayl_core::Frame;

    /// Finds a port with `count` consecutive free ports after it.
    fn free_range(count: u16) -> PortRange {
        for _ in 0..50 {
            let probe = std::net::TcpListener::bind("0.0.0.0:0").expect("probe");
            let start = probe.local_addr().unwrap().port();
            drop(probe);
            let Some(end) = start.checked_add(count - 1) else { continue };
            let all_free = (start..=end).all(|p| std::net::TcpListener::bind(("0.0.0.0", p)).is_ok());
            if all_free {
                return PortRange::new(start, end);
            }
        }
        panic!("could not find {count} consecutive free ports");
    }

    async fn read_frame(stream: &mut TcpStream) -> Frame {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header).await.expect("header");
        let header = decode_frame_header(&header).expect("valid header");
        let mut body = vec![0u8; header.body_len()];
        stream.read_exact(&mut body).await.expect("body");
        decode_frame_body(header, &body).expect("valid body")
    }

    async fn wait_for_subscribers(publisher: &Publisher, count: usize) {
        for _ in 0..100 {
            if publisher.subscriber_count() >= count {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber never registered");
    }

    #[tokio::test]
    async fn test_bind_takes_first_free_port() {
        let range = free_range(3);
        let publisher = Publisher::bind(range).expect("bind");
        assert_eq!(publisher.local_port(), range.start);
    }

    #[tokio::test]
    async fn test_bind_skips_occupied_port() {
        // Arrange
        let range = free_range(2);
        let _held = std::net::TcpListener::bind(("0.0.0.0", range.start)).expect("hold first port");

        // Act
        let publisher = Publisher::bind(range).expect("bind");

        // Assert
        assert_eq!(publisher.local_port(), range.end);
    }

    #[tokio::test]
    async fn test_bind_reports_exhausted_range() {
        let range = free_range(1);
        let _held = std::net::TcpListener::bind(("0.0.0.0", range.start)).expect("hold port");
        assert!(matches!(Publisher::bind(range), Err(TransportError::NoFreePort { .. })));
    }

    #[tokio::test]
    async fn test_send_rejects_heartbeat_topic() {
        let publisher = Publisher::bind(free_range(1)).expect("bind");
        let result = publisher.send(HEARTBEAT_TOPIC, "10.0.0.1:9000");
        assert!(matches!(result, Err(TransportError::ReservedTopic(_))));
    }

    #[tokio::test]
    async fn test_send_without_subscribers_succeeds() {
        let publisher = Publisher::bind(free_range(1)).expect("bind");
        assert!(publisher.send("gaze_exchange", "a:0.1,0.2").is_ok());
    }

    #[tokio::test]
    async fn test_connected_subscriber_receives_published_frame() {
        // Arrange
        let publisher = Publisher::bind(free_range(1)).expect("bind");
        let mut stream = TcpStream::connect(("127.0.0.1", publisher.local_port())).await.expect("connect");
        wait_for_subscribers(&publisher, 1).await;

        // Act
        publisher.send("gaze_exchange", "a:0.1,0.2").expect("send");

        // Assert
        let frame = read_frame(&mut stream).await;
        assert_eq!(frame.topic, "gaze_exchange");
        assert_eq!(decode_text_payload(&frame.payload).unwrap(), "a:0.1,0.2");
    }

    #[tokio::test]
    async fn test_heartbeat_announces_each_address() {
        // Arrange
        let publisher = Publisher::bind(free_range(1)).expect("bind");
        let mut stream = TcpStream::connect(("127.0.0.1", publisher.local_port())).await.expect("connect");
        wait_for_subscribers(&publisher, 1).await;
        let addresses: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap(), "10.0.0.7".parse().unwrap()];

        // Act
        publisher.start_heartbeat(Duration::from_millis(50), addresses);

        // Assert
        let first = read_frame(&mut stream).await;
        let second = read_frame(&mut stream).await;
        assert_eq!(first.topic, HEARTBEAT_TOPIC);
        let port = publisher.local_port();
        assert_eq!(decode_text_payload(&first.payload).unwrap(), format!("127.0.0.1:{port}"));
        assert_eq!(decode_text_payload(&second.payload).unwrap(), format!("10.0.0.7:{port}"));
    }

    #[tokio::test]
    async fn test_close_ends_subscriber_streams() {
        // Arrange
        let publisher = Publisher::bind(free_range(1)).expect("bind");
        let mut stream = TcpStream::connect(("127.0.0.1", publisher.local_port())).await.expect("connect");
        wait_for_subscribers(&publisher, 1).await;

        // Act
        drop(publisher);

        // Assert: the writer task sees the channel close and drops the socket
        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await.expect("read completes");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
