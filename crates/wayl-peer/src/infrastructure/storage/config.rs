//! TOML-based configuration persistence for the peer application.
//!
//! Reads and writes [`AppConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\WAYL\config.toml`
//! - Linux:    `~/.config/wayl/config.toml`
//! - macOS:    `~/Library/Application Support/WAYL/config.toml`
//!
//! A different file can be given explicitly with [`load_config_from`].
//!
//! # Example file
//!
//! ```toml
//! [general]
//! transport = "subnet_flood"
//! log_level = "info"
//!
//! [network]
//! port_range_start = 9000
//! port_range_end = 9009
//! liveness_timeout_ms = 5000
//!
//! [group]
//! name = "GAZE_EXCHANGE"
//!
//! [display]
//! send_interval_ms = 500
//!
//! [mock]
//! players = 2
//! positions = [[0.25, 0.25], [0.75, 0.5]]
//! ```
//!
//! Every field has a serde default, so an empty file (or no file at all) is a
//! valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wayl_core::{EndpointKey, GAZE_GROUP};

use crate::infrastructure::group::beacon::BeaconConfig;
use crate::infrastructure::network::discovery::PortRange;
use crate::infrastructure::network::liveness::LivenessConfig;
use crate::infrastructure::transport::ConnectionSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The values parse but do not make sense together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Which gaze exchange the peer runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Connect to every endpoint of the local subnets.
    #[default]
    SubnetFlood,
    /// Join a group overlay discovered with UDP beacons.
    GroupOverlay,
    /// No network at all; only local and mock positions.
    Offline,
}

/// Top-level application configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub mock: MockConfig,
}

/// General peer behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Schema version string; bump when breaking changes are introduced.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// `tracing` filter, e.g. `"info"` or `"wayl_peer=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Subnet-flood transport and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// First port of the publish range.
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last port of the publish range (inclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence after which an endpoint is evicted.
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Pause between disconnects when many endpoints expire at once.
    #[serde(default = "default_disconnect_pause_ms")]
    pub disconnect_pause_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How often evicted candidates are retried; 0 disables rediscovery.
    #[serde(default = "default_rediscovery_interval_ms")]
    pub rediscovery_interval_ms: u64,
    /// How long one receive waits before re-checking the stop flag.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Explicit `"host:port"` peers.  When non-empty, subnet enumeration is
    /// skipped and only these endpoints are contacted.
    #[serde(default)]
    pub static_peers: Vec<String>,
}

/// Group-overlay settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    /// Group joined by every peer.
    #[serde(default = "default_group_name")]
    pub name: String,
    /// Name this node advertises.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_beacon_port_start")]
    pub beacon_port_start: u16,
    #[serde(default = "default_beacon_port_end")]
    pub beacon_port_end: u16,
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Silence after which a peer is reported as EXIT.
    #[serde(default = "default_peer_expiry_ms")]
    pub peer_expiry_ms: u64,
}

/// Render loop timing and overlay geometry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    #[serde(default = "default_screen_update_interval_ms")]
    pub screen_update_interval_ms: u64,
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    #[serde(default = "default_image_width")]
    pub image_width: u32,
    #[serde(default = "default_image_height")]
    pub image_height: u32,
}

/// Synthetic players added to every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MockConfig {
    /// Number of `Mock_<i>` players; 0 disables the overlay.
    #[serde(default)]
    pub players: usize,
    /// Fixed `[x, y]` positions with a bottom-left origin.  Players beyond
    /// this list get a random position on every read.
    #[serde(default)]
    pub positions: Vec<[f64; 2]>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_port_range_start() -> u16 {
    9000
}
fn default_port_range_end() -> u16 {
    9009
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_liveness_timeout_ms() -> u64 {
    5000
}
fn default_check_interval_ms() -> u64 {
    1000
}
fn default_disconnect_pause_ms() -> u64 {
    10
}
fn default_reconnect_interval_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    500
}
fn default_rediscovery_interval_ms() -> u64 {
    30_000
}
fn default_receive_timeout_ms() -> u64 {
    200
}
fn default_group_name() -> String {
    GAZE_GROUP.to_string()
}
fn default_node_name() -> String {
    "wayl".to_string()
}
fn default_beacon_port_start() -> u16 {
    5670
}
fn default_beacon_port_end() -> u16 {
    5679
}
fn default_beacon_interval_ms() -> u64 {
    1000
}
fn default_peer_expiry_ms() -> u64 {
    5000
}
fn default_screen_update_interval_ms() -> u64 {
    100
}
fn default_send_interval_ms() -> u64 {
    500
}
fn default_image_width() -> u32 {
    1000
}
fn default_image_height() -> u32 {
    562
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            transport: TransportKind::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
            disconnect_pause_ms: default_disconnect_pause_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rediscovery_interval_ms: default_rediscovery_interval_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            static_peers: Vec::new(),
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: default_group_name(),
            node_name: default_node_name(),
            beacon_port_start: default_beacon_port_start(),
            beacon_port_end: default_beacon_port_end(),
            beacon_interval_ms: default_beacon_interval_ms(),
            peer_expiry_ms: default_peer_expiry_ms(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            screen_update_interval_ms: default_screen_update_interval_ms(),
            send_interval_ms: default_send_interval_ms(),
            image_width: default_image_width(),
            image_height: default_image_height(),
        }
    }
}

// ── Conversions to runtime settings ───────────────────────────────────────────

impl NetworkConfig {
    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.port_range_start, self.port_range_end)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            timeout: Duration::from_millis(self.liveness_timeout_ms),
            check_interval: Duration::from_millis(self.check_interval_ms),
            disconnect_pause: Duration::from_millis(self.disconnect_pause_ms),
            rediscovery_interval: (self.rediscovery_interval_ms > 0)
                .then(|| Duration::from_millis(self.rediscovery_interval_ms)),
        }
    }

    pub fn connection(&self) -> ConnectionSettings {
        ConnectionSettings {
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    /// Parses [`static_peers`](Self::static_peers).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an entry that is not `"ip:port"`.
    pub fn static_peer_endpoints(&self) -> Result<Vec<EndpointKey>, ConfigError> {
        self.static_peers
            .iter()
            .map(|entry| {
                entry
                    .parse::<SocketAddr>()
                    .map(EndpointKey::from)
                    .map_err(|_| ConfigError::Invalid(format!("static peer {entry:?} is not ip:port")))
            })
            .collect()
    }
}

impl GroupConfig {
    pub fn beacon(&self) -> BeaconConfig {
        BeaconConfig {
            port_range: PortRange::new(self.beacon_port_start, self.beacon_port_end),
            interval: Duration::from_millis(self.beacon_interval_ms),
            peer_expiry: Duration::from_millis(self.peer_expiry_ms),
            targets: None,
        }
    }
}

impl DisplayConfig {
    pub fn screen_update_interval(&self) -> Duration {
        Duration::from_millis(self.screen_update_interval_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }
}

impl AppConfig {
    /// Checks the relations between fields that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        if net.port_range().is_empty() {
            return Err(ConfigError::Invalid(format!("empty publish port range {}", net.port_range())));
        }
        if net.heartbeat_interval_ms == 0 || net.check_interval_ms == 0 || net.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid("network intervals must be positive".into()));
        }
        if net.liveness_timeout_ms <= net.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness timeout ({} ms) must exceed the heartbeat interval ({} ms)",
                net.liveness_timeout_ms, net.heartbeat_interval_ms
            )));
        }
        net.static_peer_endpoints()?;

        let group = &self.group;
        if group.name.is_empty() {
            return Err(ConfigError::Invalid("group name must not be empty".into()));
        }
        if group.beacon_port_start > group.beacon_port_end {
            return Err(ConfigError::Invalid("empty beacon port range".into()));
        }
        if group.beacon_interval_ms == 0 || group.peer_expiry_ms <= group.beacon_interval_ms {
            return Err(ConfigError::Invalid(
                "peer expiry must exceed a positive beacon interval".into(),
            ));
        }

        let display = &self.display;
        if display.screen_update_interval_ms == 0 || display.send_interval_ms == 0 {
            return Err(ConfigError::Invalid("display intervals must be positive".into()));
        }

        for [x, y] in &self.mock.positions {
            if !(0.0..=1.0).contains(x) || !(0.0..=1.0).contains(y) {
                return Err(ConfigError::Invalid(format!("mock position [{x}, {y}] outside [0, 1]")));
            }
        }
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the platform config file, returning
/// `AppConfig::default()` if the file does not yet exist.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory including the `WAYL` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("WAYL"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("wayl"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("WAYL"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
