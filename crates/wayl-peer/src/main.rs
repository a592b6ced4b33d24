//! WAYL peer entry point.
//!
//! Starts one peer of a shared-gaze session: loads the configuration, picks
//! the transport, starts the gaze exchange and runs the render loop until
//! Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! wayl-peer [OPTIONS]
//!
//! Options:
//!   --config <PATH>          Config file [default: platform config dir]
//!   --transport <KIND>       subnet-flood | group-overlay | offline
//!   --port-start <PORT>      First publish port
//!   --port-end <PORT>        Last publish port
//!   --peer <IP:PORT>         Static peer (repeatable); skips subnet scanning
//!   --group <NAME>           Group name for the group overlay
//!   --mock-players <N>       Synthetic players added to the overlay
//!   --log-level <FILTER>     tracing filter, e.g. `debug`
//!   --write-config           Save the effective config and exit
//! ```
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load AppConfig (TOML) + CLI overrides
//!  └─ build GazeExchange
//!       ├─ SubnetFloodExchange   (Publisher + Subscriber + LivenessMonitor)
//!       ├─ GroupOverlayExchange  (BeaconNode event loop)
//!       └─ LocalExchange         (offline)
//!       (optionally wrapped in MockOverlay)
//!  └─ run_render_loop (SyntheticGaze → exchange → LogOverlay)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wayl_core::{GazePosition, SenderId};

use wayl_peer::application::exchange::{GazeExchange, LocalExchange};
use wayl_peer::application::group_stream::GroupOverlayExchange;
use wayl_peer::application::mock_stream::{MockOverlay, MockPlayers};
use wayl_peer::application::render_loop::{run_render_loop, LogOverlay, RenderSettings, SyntheticGaze};
use wayl_peer::application::subnet_stream::{Candidates, SubnetFloodConfig, SubnetFloodExchange};
use wayl_peer::infrastructure::group::beacon::BeaconNode;
use wayl_peer::infrastructure::group::GroupNode;
use wayl_peer::infrastructure::storage::config::{self, AppConfig, TransportKind};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    SubnetFlood,
    GroupOverlay,
    Offline,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::SubnetFlood => TransportKind::SubnetFlood,
            TransportArg::GroupOverlay => TransportKind::GroupOverlay,
            TransportArg::Offline => TransportKind::Offline,
        }
    }
}

/// Shared-gaze peer.
///
/// Publishes this machine's gaze and shows where every other peer on the
/// local network is looking.
#[derive(Debug, Parser)]
#[command(name = "wayl-peer", about = "Shared gaze exchange peer", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "WAYL_CONFIG")]
    config: Option<PathBuf>,

    /// Transport used to exchange gaze.
    #[arg(long, value_enum, env = "WAYL_TRANSPORT")]
    transport: Option<TransportArg>,

    /// First port of the publish range.
    #[arg(long, env = "WAYL_PORT_START")]
    port_start: Option<u16>,

    /// Last port of the publish range.
    #[arg(long, env = "WAYL_PORT_END")]
    port_end: Option<u16>,

    /// Static peer endpoint (`ip:port`); may be repeated.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Group name for the group overlay.
    #[arg(long, env = "WAYL_GROUP")]
    group: Option<String>,

    /// Number of synthetic players added to the overlay.
    #[arg(long, env = "WAYL_MOCK_PLAYERS")]
    mock_players: Option<usize>,

    /// `tracing` filter; `RUST_LOG` takes precedence.
    #[arg(long, env = "WAYL_LOG")]
    log_level: Option<String>,

    /// Write the effective configuration to the config file and exit.
    #[arg(long)]
    write_config: bool,
}

impl Cli {
    /// Loads the config file and applies the command-line overrides.
    fn resolve_config(&self) -> anyhow::Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => config::load_config().unwrap_or_else(|e| {
                eprintln!("using default configuration: {e}");
                AppConfig::default()
            }),
        };

        if let Some(transport) = self.transport {
            cfg.general.transport = transport.into();
        }
        if let Some(start) = self.port_start {
            cfg.network.port_range_start = start;
        }
        if let Some(end) = self.port_end {
            cfg.network.port_range_end = end;
        }
        if !self.peers.is_empty() {
            cfg.network.static_peers = self.peers.clone();
        }
        if let Some(group) = &self.group {
            cfg.group.name = group.clone();
        }
        if let Some(players) = self.mock_players {
            cfg.mock.players = players;
        }
        if let Some(level) = &self.log_level {
            cfg.general.log_level = level.clone();
        }

        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }

    /// Target of `--write-config`: `--config`, else the platform config file.
    fn config_target(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config::config_file_path().context("no config path; pass --config"),
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

fn build_exchange(cfg: &AppConfig) -> anyhow::Result<Box<dyn GazeExchange>> {
    let base: Box<dyn GazeExchange> = match cfg.general.transport {
        TransportKind::SubnetFlood => {
            let static_peers = cfg.network.static_peer_endpoints()?;
            let candidates = if static_peers.is_empty() {
                Candidates::LocalSubnets
            } else {
                Candidates::Fixed(static_peers)
            };
            Box::new(SubnetFloodExchange::new(SubnetFloodConfig {
                ports: cfg.network.port_range(),
                heartbeat_interval: cfg.network.heartbeat_interval(),
                receive_timeout: cfg.network.receive_timeout(),
                liveness: cfg.network.liveness(),
                connection: cfg.network.connection(),
                candidates,
            }))
        }
        TransportKind::GroupOverlay => {
            let mut node = BeaconNode::new(&cfg.group.node_name, cfg.group.beacon());
            node.set_header("X-WAYL-VERSION", env!("CARGO_PKG_VERSION"));
            Box::new(GroupOverlayExchange::new(node, &cfg.group.name))
        }
        TransportKind::Offline => Box::new(LocalExchange::new(SenderId::new(cfg.group.node_name.clone()))),
    };

    if cfg.mock.players == 0 {
        return Ok(base);
    }
    let positions = cfg
        .mock
        .positions
        .iter()
        .map(|[x, y]| GazePosition::new(*x, *y))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid mock position")?;
    Ok(Box::new(MockOverlay::new(base, MockPlayers::new(cfg.mock.players, positions))))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = cli.resolve_config()?;

    if cli.write_config {
        let path = cli.config_target()?;
        config::save_config_to(&cfg, &path)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        println!("configuration written to {}", path.display());
        return Ok(());
    }

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.general.log_level)),
        )
        .init();

    info!("WAYL peer starting ({:?})", cfg.general.transport);

    let exchange = build_exchange(&cfg)?;
    exchange.start().await.context("failed to start gaze exchange")?;
    if let Some(id) = exchange.local_id() {
        info!("local sender id: {id}");
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!("WAYL peer ready.  Press Ctrl-C to exit.");

    let settings = RenderSettings {
        screen_update_interval: cfg.display.screen_update_interval(),
        send_interval: cfg.display.send_interval(),
        image_width: cfg.display.image_width,
        image_height: cfg.display.image_height,
        frame_limit: None,
    };
    let stats = run_render_loop(
        exchange.as_ref(),
        &mut SyntheticGaze::new(),
        &mut LogOverlay::new(),
        &settings,
        &running,
    )
    .await;

    exchange.stop().await;
    if stats.frames_drawn == 0 {
        warn!("no frame was drawn during this session");
    }
    info!(
        "WAYL peer stopped: {} frame(s) drawn, {} sample(s) sent",
        stats.frames_drawn, stats.samples_sent
    );
    Ok(())
}
