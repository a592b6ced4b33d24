//! Synthetic players layered over any gaze exchange.
//!
//! Useful for demos and for developing the overlay without a room full of
//! eye trackers.  [`MockOverlay`] forwards everything to the wrapped exchange
//! and adds `Mock_<i>` entries to every snapshot it hands out.  The wrapped
//! exchange's table is never touched.

use async_trait::async_trait;
use rand::Rng;
use wayl_core::{GazePosition, SenderId};

use super::exchange::{ExchangeError, GazeExchange, GazeSnapshot};

/// Which synthetic players to add.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MockPlayers {
    count: usize,
    /// Fixed positions in bottom-left-origin coordinates.
    positions: Vec<GazePosition>,
}

impl MockPlayers {
    /// `count` players; the first `positions.len()` of them are fixed, given
    /// with a bottom-left origin.  The rest move randomly on every read.
    pub fn new(count: usize, positions: Vec<GazePosition>) -> Self {
        Self { count, positions }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sender id of the `index`-th mock player.
    pub fn sender_id(index: usize) -> SenderId {
        SenderId::new(format!("Mock_{index}"))
    }

    /// Position of player `index` for this read, in top-left-origin coordinates.
    fn position(&self, index: usize, rng: &mut impl Rng) -> GazePosition {
        match self.positions.get(index) {
            Some(fixed) => fixed.flipped_y(),
            None => {
                let mut coordinate = || (rng.gen_range(0.0..=1.0_f64) * 100.0).round() / 100.0;
                GazePosition::clamped(coordinate(), coordinate())
            }
        }
    }
}

/// Decorator adding [`MockPlayers`] to another exchange's snapshots.
pub struct MockOverlay<S> {
    inner: S,
    players: MockPlayers,
}

impl<S: GazeExchange> MockOverlay<S> {
    pub fn new(inner: S, players: MockPlayers) -> Self {
        Self { inner, players }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: GazeExchange> GazeExchange for MockOverlay<S> {
    async fn start(&self) -> Result<(), ExchangeError> {
        self.inner.start().await
    }

    async fn send(&self, position: GazePosition) -> Result<(), ExchangeError> {
        self.inner.send(position).await
    }

    fn read(&self) -> Result<GazeSnapshot, ExchangeError> {
        let mut snapshot = self.inner.read()?;
        let mut rng = rand::thread_rng();
        for index in 0..self.players.count {
            snapshot.insert(MockPlayers::sender_id(index), self.players.position(index, &mut rng));
        }
        Ok(snapshot)
    }

    fn local_id(&self) -> Option<SenderId> {
        self.inner.local_id()
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    async fn stop(&self) {
        self.inner.stop().await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
