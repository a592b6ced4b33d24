//! Gaze domain entities: positions, sender identities and the peer gaze table.
//!
//! A gaze position is a point on the shared stimulus expressed in normalized
//! coordinates: `(0.0, 0.0)` is the top-left corner of the image and
//! `(1.0, 1.0)` the bottom-right corner.  Using normalized coordinates means
//! peers with different screen resolutions still agree on where everyone is
//! looking.
//!
//! # Last value wins
//!
//! The [`PeerGazeTable`] keeps exactly one position per sender.  Every update
//! overwrites the previous one; there is no history.  Gaze samples arrive many
//! times per second, so an older sample is never more useful than a newer one.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing a [`GazePosition`].
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum PositionError {
    /// A coordinate was NaN or infinite.
    #[error("gaze coordinate is not a finite number: ({x}, {y})")]
    NotFinite { x: f64, y: f64 },

    /// A coordinate lies outside the normalized `[0, 1]` range.
    #[error("gaze coordinate out of range [0, 1]: ({x}, {y})")]
    OutOfRange { x: f64, y: f64 },
}

/// A normalized point of regard on the shared stimulus.
///
/// Both coordinates are guaranteed to lie in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazePosition {
    x: f64,
    y: f64,
}

impl GazePosition {
    /// Creates a position after validating both coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError::NotFinite`] for NaN/infinite input and
    /// [`PositionError::OutOfRange`] for values outside `[0, 1]`.
    pub fn new(x: f64, y: f64) -> Result<Self, PositionError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(PositionError::NotFinite { x, y });
        }
        if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
            return Err(PositionError::OutOfRange { x, y });
        }
        Ok(Self { x, y })
    }

    /// Creates a position, clamping finite coordinates into `[0, 1]`.
    ///
    /// Non-finite coordinates are mapped to the image centre.  Eye trackers
    /// routinely report samples slightly off the tracked surface; this is the
    /// constructor for those.
    pub fn clamped(x: f64, y: f64) -> Self {
        let fix = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.5 };
        Self { x: fix(x), y: fix(y) }
    }

    /// Horizontal coordinate in `[0, 1]`.
    pub fn x(&self) -> f64 {
        self.x
    }

    /// Vertical coordinate in `[0, 1]`.
    pub fn y(&self) -> f64 {
        self.y
    }

    /// Mirrors the vertical axis (`y -> 1 - y`).
    ///
    /// Surface trackers report with the origin at the bottom-left, renderers
    /// draw with the origin at the top-left.
    pub fn flipped_y(self) -> Self {
        Self {
            x: self.x,
            y: 1.0 - self.y,
        }
    }

    /// Maps the position to integer pixel coordinates on an image of the given size.
    pub fn to_pixel(&self, width: u32, height: u32) -> (u32, u32) {
        let px = (self.x * f64::from(width)) as u32;
        let py = (self.y * f64::from(height)) as u32;
        (px.min(width.saturating_sub(1)), py.min(height.saturating_sub(1)))
    }
}

impl fmt::Display for GazePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Stable identifier of the peer that produced a gaze sample.
///
/// Subnet-flood peers derive it from their publisher's address and port
/// (`"192.168.1.20_9003"`); group-overlay peers use their node UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderId(String);

impl SenderId {
    /// Wraps an arbitrary identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the identifier of a subnet-flood publisher.
    pub fn from_endpoint(address: IpAddr, port: u16) -> Self {
        Self(format!("{address}_{port}"))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SenderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Mapping from sender to its most recent gaze position.
///
/// Internally synchronized: the table is shared behind an `Arc` between the
/// task that receives network messages and the render loop that reads
/// snapshots.  The group-overlay variant writes from two contexts (local
/// publish and remote shout), so writes always go through the lock.
#[derive(Debug, Default)]
pub struct PeerGazeTable {
    entries: RwLock<HashMap<SenderId, GazePosition>>,
}

impl PeerGazeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `position` for `sender`, returning the value it replaced.
    pub fn upsert(&self, sender: SenderId, position: GazePosition) -> Option<GazePosition> {
        self.write().insert(sender, position)
    }

    /// Removes the entry for `sender`, returning it if present.
    pub fn remove(&self, sender: &SenderId) -> Option<GazePosition> {
        self.write().remove(sender)
    }

    /// Returns the current position of `sender`.
    pub fn get(&self, sender: &SenderId) -> Option<GazePosition> {
        self.read().get(sender).copied()
    }

    /// Returns a copy of the whole table.
    pub fn snapshot(&self) -> HashMap<SenderId, GazePosition> {
        self.read().clone()
    }

    /// Returns all positions ordered by sender id.
    pub fn positions(&self) -> Vec<GazePosition> {
        let guard = self.read();
        let mut entries: Vec<(&SenderId, &GazePosition)> = guard.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, pos)| *pos).collect()
    }

    /// Number of senders currently in the table.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` when no sender has been observed (or all were cleared).
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.write().clear();
    }

    // A panicking writer cannot leave a HashMap half-updated in a way that
    // matters here, so a poisoned lock is simply recovered.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SenderId, GazePosition>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SenderId, GazePosition>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
