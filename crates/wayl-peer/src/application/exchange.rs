//! The gaze exchange capability shared by every transport variant.
//!
//! A gaze exchange does four things: start its background work, publish this
//! peer's gaze, hand out a snapshot of every peer's latest gaze, and stop.
//! The render loop only talks to [`GazeExchange`]; which network sits
//! underneath is decided once at startup.
//!
//! # Table discipline
//!
//! Every variant owns a [`PeerGazeTable`].  Entries are last-value-wins per
//! sender and are removed when the transport reports that the sender is gone
//! (endpoint eviction or group EXIT).  Readers always get a copy, never a view
//! into the live table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use wayl_core::{GazeMessage, GazePosition, PeerGazeTable, SenderId};

use crate::infrastructure::group::GroupError;
use crate::infrastructure::network::discovery::DiscoveryError;
use crate::infrastructure::transport::TransportError;

/// Snapshot of the latest gaze per sender.
pub type GazeSnapshot = HashMap<SenderId, GazePosition>;

/// Error type for gaze exchange operations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// `read` was called before `start` or after `stop`.
    #[error("gaze exchange is not running")]
    NotRunning,

    /// The exchange was stopped and cannot be used again.
    #[error("gaze exchange has been stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("group overlay error: {0}")]
    Group(#[from] GroupError),
}

/// Publish-and-collect access to the shared gaze of all peers.
#[async_trait]
pub trait GazeExchange: Send + Sync {
    /// Starts background discovery and receiving.  Calling it twice is a no-op.
    async fn start(&self) -> Result<(), ExchangeError>;

    /// Publishes this peer's gaze.  Best effort: never waits on other peers.
    async fn send(&self, position: GazePosition) -> Result<(), ExchangeError>;

    /// Copy of the latest gaze per sender.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::NotRunning`] before `start` or after `stop`.
    fn read(&self) -> Result<GazeSnapshot, ExchangeError>;

    /// The positions of [`read`](Self::read) ordered by sender id.
    fn read_list(&self) -> Result<Vec<GazePosition>, ExchangeError> {
        Ok(sorted_positions(self.read()?))
    }

    /// Identity under which this peer's gaze is published, once known.
    fn local_id(&self) -> Option<SenderId>;

    fn is_running(&self) -> bool;

    /// Requests shutdown of the background work.
    async fn stop(&self);
}

/// Lets a transport chosen at runtime be wrapped by decorators such as the
/// mock overlay.
#[async_trait]
impl GazeExchange for Box<dyn GazeExchange> {
    async fn start(&self) -> Result<(), ExchangeError> {
        self.as_ref().start().await
    }

    async fn send(&self, position: GazePosition) -> Result<(), ExchangeError> {
        self.as_ref().send(position).await
    }

    fn read(&self) -> Result<GazeSnapshot, ExchangeError> {
        self.as_ref().read()
    }

    fn local_id(&self) -> Option<SenderId> {
        self.as_ref().local_id()
    }

    fn is_running(&self) -> bool {
        self.as_ref().is_running()
    }

    async fn stop(&self) {
        self.as_ref().stop().await
    }
}

/// Orders snapshot positions by sender id.
pub fn sorted_positions(snapshot: GazeSnapshot) -> Vec<GazePosition> {
    let mut entries: Vec<(SenderId, GazePosition)> = snapshot.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().map(|(_, position)| position).collect()
}

/// Parses `"<sender_id>:<x>,<y>"` and stores it in `table`.
///
/// Malformed text is logged and dropped; the table is left unchanged.
/// Returns the sender id on success.
pub fn apply_gaze_text(table: &PeerGazeTable, text: &str) -> Option<SenderId> {
    match GazeMessage::parse(text) {
        Ok(message) => {
            let sender = message.sender.clone();
            table.upsert(message.sender, message.position);
            Some(sender)
        }
        Err(e) => {
            warn!("dropping malformed gaze message {text:?}: {e}");
            None
        }
    }
}

/// Exchange without a network: only this peer's own gaze is recorded.
///
/// Used for offline runs, usually wrapped in a mock overlay.
pub struct LocalExchange {
    local_id: SenderId,
    table: Arc<PeerGazeTable>,
    running: AtomicBool,
}

impl LocalExchange {
    pub fn new(local_id: SenderId) -> Self {
        Self {
            local_id,
            table: Arc::new(PeerGazeTable::new()),
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl GazeExchange for LocalExchange {
    async fn start(&self) -> Result<(), ExchangeError> {
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn send(&self, position: GazePosition) -> Result<(), ExchangeError> {
        self.table.upsert(self.local_id.clone(), position);
        debug!("local gaze {position}");
        Ok(())
    }

    fn read(&self) -> Result<GazeSnapshot, ExchangeError> {
        if !self.is_running() {
            return Err(ExchangeError::NotRunning);
        }
        Ok(self.table.snapshot())
    }

    fn local_id(&self) -> Option<SenderId> {
        Some(self.local_id.clone())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
