//! Topic-based publish/subscribe over TCP.
//!
//! # Shape of the transport (for beginners)
//!
//! Every peer runs exactly one [`publisher::Publisher`]: a TCP listener on the
//! first free port of the configured range.  Anyone who connects receives
//! every frame the peer publishes.  Sending never blocks; a subscriber that
//! is slow or gone simply misses frames.
//!
//! Every peer also runs one [`subscriber::Subscriber`] that keeps a
//! connection to each candidate endpoint open (and re-opens it when it
//! drops).  Frames whose topic starts with one of the subscribed prefixes are
//! delivered to the application; frames on the reserved heartbeat topic are
//! routed to the liveness monitor instead and never reach the application.
//!
//! ```text
//!   Peer A                                  Peer B
//!   Publisher :9000  ───── frames ─────▶   Subscriber ──▶ gaze table
//!   Subscriber      ◀───── frames ─────    Publisher :9001
//! ```

pub mod publisher;
pub mod subscriber;

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use wayl_core::protocol::codec::{decode_payload, decode_text_payload};
use wayl_core::{EndpointKey, HeartbeatMessage, ProtocolError};

use crate::infrastructure::network::discovery::PortRange;

/// Default wait between reconnection attempts to one endpoint.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for a single TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Every port of the publish range is in use.
    #[error("no free port in range {range}")]
    NoFreePort { range: PortRange },

    /// The topic collides with the reserved heartbeat topic.
    #[error("topic {0:?} is reserved for heartbeats")]
    ReservedTopic(String),

    /// Topic filters were changed after the subscriber started.
    #[error("subscriber already started; topics must be set before start()")]
    AlreadyStarted,

    /// The heartbeat stream was already handed to another consumer.
    #[error("heartbeat stream already taken")]
    HeartbeatsTaken,

    /// A frame or payload could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A socket operation failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Timing knobs for subscriber connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// One application frame delivered by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Endpoint whose connection delivered the frame.
    pub origin: EndpointKey,
}

impl TopicMessage {
    /// Decodes the payload as a bincode value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] when the bytes do not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode_payload(&self.payload)
    }

    /// Decodes the payload as a string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] when the payload is not a string.
    pub fn text(&self) -> Result<String, ProtocolError> {
        decode_text_payload(&self.payload)
    }
}

/// A heartbeat observed on one subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundHeartbeat {
    /// Endpoint whose connection delivered the heartbeat.
    pub via: EndpointKey,
    /// Decoded payload; `None` when the payload was not `"address:port"`.
    pub heartbeat: Option<HeartbeatMessage>,
}
