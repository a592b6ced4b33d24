//! Group-messaging overlay.
//!
//! # What a group overlay is (for beginners)
//!
//! Instead of connecting to every possible endpoint, peers in this variant
//! join a named group.  A node discovers other nodes on its own, tells the
//! application when a peer enters or leaves, and delivers messages that a
//! peer *shouts* to the whole group or *whispers* to one node.
//!
//! The application only sees [`GroupEvent`]s through the [`GroupNode`] trait,
//! so the overlay underneath can be swapped:
//!
//! - **`beacon`** – [`beacon::BeaconNode`], UDP beacons on a port range plus
//!   unicast shouts.  Works across a LAN.
//! - **`hub`** – [`hub::LocalHub`], an in-process overlay used by the tests
//!   and for running several peers in one process.

pub mod beacon;
pub mod hub;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Error type for group overlay operations.
#[derive(Debug, Error)]
pub enum GroupError {
    /// The node has not been started, or was stopped.
    #[error("group node is not started")]
    NotStarted,

    /// A whisper addressed a peer this node has never seen.
    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),

    /// No beacon port in the range could be bound.
    #[error("no free beacon port in range {0}")]
    NoFreePort(String),

    /// A node frame could not be encoded.
    #[error("failed to encode node frame: {0}")]
    Encode(String),

    /// A socket operation failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened in the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEventKind {
    /// A peer was discovered; carries the headers it advertised.
    Enter { headers: HashMap<String, String> },
    /// A peer left or stopped responding.
    Exit,
    /// A peer sent `payload` to `group`.
    Shout { group: String, payload: Vec<u8> },
    /// A peer sent `payload` to this node only.
    Whisper { payload: Vec<u8> },
}

/// An event delivered by a [`GroupNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEvent {
    pub peer: Uuid,
    pub name: String,
    pub kind: GroupEventKind,
}

impl GroupEvent {
    /// Upper-case event tag, as used in logs.
    pub fn tag(&self) -> &'static str {
        match self.kind {
            GroupEventKind::Enter { .. } => "ENTER",
            GroupEventKind::Exit => "EXIT",
            GroupEventKind::Shout { .. } => "SHOUT",
            GroupEventKind::Whisper { .. } => "WHISPER",
        }
    }
}

impl fmt::Display for GroupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} ({})", self.tag(), self.name, self.peer)
    }
}

/// A member of a group overlay.
///
/// Configuration (`set_header`, `join`) is expected before [`start`](Self::start);
/// events are pulled with [`recv`](Self::recv).
#[async_trait]
pub trait GroupNode: Send {
    /// Unique identity of this node.
    fn uuid(&self) -> Uuid;

    /// Human-readable node name.
    fn name(&self) -> &str;

    /// Sets a header advertised to peers on discovery.
    fn set_header(&mut self, key: &str, value: &str);

    /// Joins `group`.
    fn join(&mut self, group: &str);

    /// Starts discovery and message delivery.
    async fn start(&mut self) -> Result<(), GroupError>;

    /// Waits for the next event; `None` once the node is stopped.
    async fn recv(&mut self) -> Option<GroupEvent>;

    /// Sends `payload` to every known peer in `group`.
    async fn shout(&self, group: &str, payload: &[u8]) -> Result<(), GroupError>;

    /// Sends `payload` to a single peer.
    async fn whisper(&self, peer: Uuid, payload: &[u8]) -> Result<(), GroupError>;

    /// Leaves `group`.
    async fn leave(&mut self, group: &str) -> Result<(), GroupError>;

    /// Announces departure and releases the node's resources.
    async fn stop(&mut self);
}
