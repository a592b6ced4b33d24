//! Periodic redraw of the shared gaze overlay.
//!
//! The loop ticks every `screen_update_interval`.  On each tick it reads the
//! snapshot of all peers' gaze, converts the positions to pixels and hands
//! them to an [`OverlaySink`].  Every `send_interval` it also publishes this
//! peer's own gaze taken from a [`GazeSource`].
//!
//! A frame whose snapshot cannot be read (exchange not running yet, or
//! already stopped) is skipped rather than treated as an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::time;
use tracing::{debug, trace, warn};
use wayl_core::GazePosition;

use super::exchange::{ExchangeError, GazeExchange};

/// Produces this peer's current gaze, e.g. from an eye tracker.
pub trait GazeSource: Send {
    /// Latest gaze sample, or `None` when the tracker has lost the eyes.
    fn current_gaze(&mut self) -> Option<GazePosition>;
}

/// Draws the overlay.  Pixel coordinates have a top-left origin.
pub trait OverlaySink: Send {
    fn draw(&mut self, points: &[(u32, u32)]);
}

/// Deterministic gaze that sweeps a Lissajous figure across the image.
#[derive(Debug, Default)]
pub struct SyntheticGaze {
    step: u64,
}

impl SyntheticGaze {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GazeSource for SyntheticGaze {
    fn current_gaze(&mut self) -> Option<GazePosition> {
        let t = self.step as f64 * 0.05;
        self.step += 1;
        Some(GazePosition::clamped(0.5 + 0.4 * t.sin(), 0.5 + 0.4 * (2.0 * t).cos()))
    }
}

/// Sink that logs every frame at debug level.
#[derive(Debug, Default)]
pub struct LogOverlay {
    frames: u64,
}

impl LogOverlay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverlaySink for LogOverlay {
    fn draw(&mut self, points: &[(u32, u32)]) {
        self.frames += 1;
        debug!("frame {}: {} gaze point(s) {:?}", self.frames, points.len(), points);
    }
}

/// Timing and geometry of the render loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    pub screen_update_interval: Duration,
    pub send_interval: Duration,
    pub image_width: u32,
    pub image_height: u32,
    /// Stop after this many ticks; `None` runs until the flag clears.
    pub frame_limit: Option<u64>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            screen_update_interval: Duration::from_millis(100),
            send_interval: Duration::from_millis(500),
            image_width: 1000,
            image_height: 562,
            frame_limit: None,
        }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_drawn: u64,
    pub frames_skipped: u64,
    pub samples_sent: u64,
}

/// Runs the render loop until `running` is cleared or the frame limit is hit.
pub async fn run_render_loop(
    exchange: &dyn GazeExchange,
    source: &mut dyn GazeSource,
    sink: &mut dyn OverlaySink,
    settings: &RenderSettings,
    running: &AtomicBool,
) -> RenderStats {
    let mut stats = RenderStats::default();
    let mut redraw = time::interval(settings.screen_update_interval);
    redraw.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    let mut last_send: Option<Instant> = None;
    let mut ticks = 0u64;

    while running.load(Ordering::Relaxed) {
        if settings.frame_limit.is_some_and(|limit| ticks >= limit) {
            break;
        }
        redraw.tick().await;
        ticks += 1;

        if last_send.map_or(true, |sent| sent.elapsed() >= settings.send_interval) {
            last_send = Some(Instant::now());
            if let Some(gaze) = source.current_gaze() {
                match exchange.send(gaze).await {
                    Ok(()) => stats.samples_sent += 1,
                    Err(e) => warn!("gaze sample not sent: {e}"),
                }
            }
        }

        match exchange.read_list() {
            Ok(positions) => {
                let points: Vec<(u32, u32)> = positions
                    .iter()
                    .map(|p| p.to_pixel(settings.image_width, settings.image_height))
                    .collect();
                sink.draw(&points);
                stats.frames_drawn += 1;
            }
            Err(ExchangeError::NotRunning) => {
                trace!("exchange not running; frame skipped");
                stats.frames_skipped += 1;
            }
            Err(e) => {
                warn!("could not read gaze snapshot: {e}");
                stats.frames_skipped += 1;
            }
        }
    }
    debug!("render loop finished: {stats:?}");
    stats
}

// ── Tests ─────────────────────────────────────────────────────────────────────
