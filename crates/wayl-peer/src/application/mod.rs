//! Application layer for the peer.
//!
//! # What lives here (for beginners)
//!
//! The infrastructure layer knows how to move bytes: TCP frames, UDP
//! beacons, heartbeats.  This layer turns that into the one thing the user
//! cares about: *where is everybody looking right now?*
//!
//! - **`exchange`** – The [`exchange::GazeExchange`] capability every variant
//!   implements, its error type, and the shared gaze-text parsing helper.
//!
//! - **`subnet_stream`** – Gaze exchange over subnet-flood pub/sub with
//!   heartbeat liveness.
//!
//! - **`group_stream`** – Gaze exchange over a group overlay, driven by a
//!   single event-loop task.
//!
//! - **`mock_stream`** – Decorator adding synthetic `Mock_<i>` players.
//!
//! - **`render_loop`** – The periodic read-and-draw / send cycle.

pub mod exchange;
pub mod group_stream;
pub mod mock_stream;
pub mod render_loop;
pub mod subnet_stream;
