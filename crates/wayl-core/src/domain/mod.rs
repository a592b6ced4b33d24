//! Domain entities for WAYL.
//!
//! This module contains pure data types and rules with no infrastructure
//! dependencies: nothing in here opens a socket, spawns a task or reads the
//! clock on its own (callers pass `Instant`s in).  That keeps the rules easy to
//! test in isolation.

/// Peer endpoints and their heartbeat freshness.
pub mod endpoint;

/// Gaze positions, sender identities and the peer gaze table.
pub mod gaze;
