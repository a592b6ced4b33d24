//! WAYL application messages and protocol constants.
//!
//! Two message kinds travel over the subnet-flood transport:
//!
//! - **Gaze** on [`GAZE_TOPIC`]: the text `"<senderId>:<x>,<y>"`.
//! - **Heartbeat** on [`HEARTBEAT_TOPIC`]: the text `"<address>:<port>"`.
//!
//! Both are carried as bincode-encoded strings inside a frame (see
//! [`crate::protocol::codec`]).  The group overlay shouts the same gaze text.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::domain::endpoint::EndpointKey;
use crate::domain::gaze::{GazePosition, SenderId};
use crate::protocol::codec::ProtocolError;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current frame format version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Longest topic a frame can carry (the length field is one byte).
pub const MAX_TOPIC_LEN: usize = u8::MAX as usize;

/// Largest payload accepted by the decoder.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Reserved topic for liveness heartbeats.  Application code must never
/// subscribe to or publish on it.
pub const HEARTBEAT_TOPIC: &str = "_alive";

/// Topic carrying gaze samples on the subnet-flood transport.
pub const GAZE_TOPIC: &str = "gaze_exchange";

/// Group joined by peers on the group-overlay transport.
pub const GAZE_GROUP: &str = "GAZE_EXCHANGE";

/// Returns `true` if subscribing to `prefix` would match the heartbeat topic.
///
/// The empty prefix is allowed: it means "every application topic", and the
/// transport keeps heartbeats away from application subscribers anyway.
pub fn is_reserved_topic(prefix: &str) -> bool {
    !prefix.is_empty()
        && (HEARTBEAT_TOPIC.starts_with(prefix) || prefix.starts_with(HEARTBEAT_TOPIC))
}

// ── Gaze message ──────────────────────────────────────────────────────────────

/// A gaze sample attributed to its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct GazeMessage {
    pub sender: SenderId,
    pub position: GazePosition,
}

impl GazeMessage {
    pub fn new(sender: SenderId, position: GazePosition) -> Self {
        Self { sender, position }
    }

    /// Renders the `"<senderId>:<x>,<y>"` wire text.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    /// Parses the `"<senderId>:<x>,<y>"` wire text.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MissingSeparator`] when there is no `:`.
    /// - [`ProtocolError::EmptySenderId`] when nothing precedes the `:`.
    /// - [`ProtocolError::WrongFieldCount`] unless exactly two coordinates follow.
    /// - [`ProtocolError::InvalidCoordinate`] when a coordinate is not a number.
    /// - [`ProtocolError::Position`] when a coordinate lies outside `[0, 1]`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (sender, coords) = text
            .split_once(':')
            .ok_or_else(|| ProtocolError::MissingSeparator(text.to_string()))?;
        if sender.is_empty() {
            return Err(ProtocolError::EmptySenderId);
        }

        let fields: Vec<&str> = coords.split(',').collect();
        if fields.len() != 2 {
            return Err(ProtocolError::WrongFieldCount {
                expected: 2,
                found: fields.len(),
            });
        }

        let x = parse_coordinate(fields[0])?;
        let y = parse_coordinate(fields[1])?;
        let position = GazePosition::new(x, y)?;
        Ok(Self::new(SenderId::new(sender), position))
    }
}

fn parse_coordinate(field: &str) -> Result<f64, ProtocolError> {
    field
        .trim()
        .parse::<f64>()
        .map_err(|_| ProtocolError::InvalidCoordinate(field.to_string()))
}

impl fmt::Display for GazeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{},{}", self.sender, self.position.x(), self.position.y())
    }
}

impl FromStr for GazeMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Heartbeat message ─────────────────────────────────────────────────────────

/// Liveness proof naming one of the publisher's `(address, port)` endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeartbeatMessage {
    pub address: IpAddr,
    pub port: u16,
}

impl HeartbeatMessage {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// The endpoint this heartbeat vouches for.
    pub fn endpoint(&self) -> EndpointKey {
        EndpointKey::new(self.address, self.port)
    }

    /// Renders the `"<address>:<port>"` wire text.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    /// Parses the `"<address>:<port>"` wire text.
    ///
    /// The port is taken after the *last* colon so IPv6 addresses parse too.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidHeartbeat`] for anything else.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidHeartbeat(text.to_string());
        let (address, port) = text.rsplit_once(':').ok_or_else(invalid)?;
        let address: IpAddr = address.parse().map_err(|_| invalid())?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(address, port))
    }
}

impl fmt::Display for HeartbeatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for HeartbeatMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
