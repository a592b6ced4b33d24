//! # wayl-core
//!
//! Shared library for WAYL ("where are you looking") containing the domain
//! entities and the wire protocol used by every peer.
//!
//! This crate has zero dependencies on sockets, threads or the async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! Several people look at the same picture.  Each one's eye tracker produces a
//! point of regard, and every peer shows an overlay of where all the *others*
//! are looking.  Peers find each other on the LAN without a server.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`domain`** – What is exchanged: normalized [`GazePosition`]s attributed
//!   to a [`SenderId`], the last-value-wins [`PeerGazeTable`], and the
//!   [`PeerEndpoint`] candidates that discovery produces.
//!
//! - **`protocol`** – How it travels: the 8-byte-header frame that carries a
//!   topic plus a bincode payload, the `"id:x,y"` gaze text and the
//!   `"address:port"` heartbeat text.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `wayl_core::GazePosition` instead of `wayl_core::domain::gaze::GazePosition`.
pub use domain::endpoint::{EndpointKey, PeerEndpoint};
pub use domain::gaze::{GazePosition, PeerGazeTable, PositionError, SenderId};
pub use protocol::codec::{decode_frame, encode_frame, Frame, ProtocolError};
pub use protocol::messages::{GazeMessage, HeartbeatMessage, GAZE_GROUP, GAZE_TOPIC, HEARTBEAT_TOPIC};
