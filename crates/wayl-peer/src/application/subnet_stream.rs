//! Gaze exchange over subnet-flood publish/subscribe.
//!
//! # Moving parts
//!
//! ```text
//!   send() ──▶ Publisher ──"gaze_exchange"──▶ other peers
//!                 └── heartbeat task ──"_alive"──▶ other peers
//!
//!   other peers ──▶ Subscriber ─┬─ gaze frames ──▶ receive loop ──▶ PeerGazeTable
//!                               └─ heartbeats ───▶ LivenessMonitor
//!                                                      │ evicted endpoint
//!                                                      └──────▶ receive loop
//! ```
//!
//! The publisher is created on first use by either `start` or `send`, so a
//! peer that only sends still advertises itself.  The receive loop is the
//! only writer of the gaze table: it applies gaze messages and, when the
//! monitor evicts an endpoint, removes every sender last heard through it.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wayl_core::{EndpointKey, GazeMessage, GazePosition, PeerGazeTable, SenderId, GAZE_TOPIC};

use super::exchange::{apply_gaze_text, ExchangeError, GazeExchange, GazeSnapshot};
use crate::infrastructure::network::discovery::{self, PortRange};
use crate::infrastructure::network::liveness::{CandidateSource, LivenessConfig, LivenessMonitor};
use crate::infrastructure::transport::publisher::Publisher;
use crate::infrastructure::transport::subscriber::Subscriber;
use crate::infrastructure::transport::{ConnectionSettings, TopicMessage, TransportError};

/// Where candidate endpoints come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// Every host of every local subnet, crossed with the port range.
    LocalSubnets,
    /// A fixed list, e.g. configured static peers.
    Fixed(Vec<EndpointKey>),
}

/// Settings of a [`SubnetFloodExchange`].
#[derive(Debug, Clone)]
pub struct SubnetFloodConfig {
    pub ports: PortRange,
    pub heartbeat_interval: Duration,
    /// Upper bound on one receive wait; bounds how long `stop` takes to land.
    pub receive_timeout: Duration,
    pub liveness: LivenessConfig,
    pub connection: ConnectionSettings,
    pub candidates: Candidates,
}

impl Default for SubnetFloodConfig {
    fn default() -> Self {
        Self {
            ports: PortRange::new(9000, 9009),
            heartbeat_interval: Duration::from_secs(1),
            receive_timeout: Duration::from_millis(200),
            liveness: LivenessConfig::default(),
            connection: ConnectionSettings::default(),
            candidates: Candidates::LocalSubnets,
        }
    }
}

struct LocalPublisher {
    id: SenderId,
    publisher: Publisher,
    addresses: Vec<IpAddr>,
}

/// Subnet-flood implementation of [`GazeExchange`].
pub struct SubnetFloodExchange {
    config: SubnetFloodConfig,
    table: Arc<PeerGazeTable>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    publisher: OnceCell<LocalPublisher>,
    start_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubnetFloodExchange {
    pub fn new(config: SubnetFloodConfig) -> Self {
        Self {
            config,
            table: Arc::new(PeerGazeTable::new()),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            publisher: OnceCell::new(),
            start_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Port of the local publisher, once bound.
    pub fn publish_port(&self) -> Option<u16> {
        self.publisher.get().map(|local| local.publisher.local_port())
    }

    async fn local_publisher(&self) -> Result<&LocalPublisher, ExchangeError> {
        self.publisher
            .get_or_try_init(|| async {
                let publisher = Publisher::bind(self.config.ports)?;
                let addresses = match discovery::enumerate_local_addresses() {
                    Ok(addresses) if !addresses.is_empty() => addresses,
                    Ok(_) => vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                    Err(e) => {
                        warn!("heartbeating on loopback only: {e}");
                        vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
                    }
                };
                let id = SenderId::from_endpoint(discovery::primary_address(&addresses), publisher.local_port());
                publisher.start_heartbeat(self.config.heartbeat_interval, addresses.clone());
                info!("publishing gaze as {id}");
                Ok::<_, ExchangeError>(LocalPublisher { id, publisher, addresses })
            })
            .await
    }

    fn initial_candidates(&self, local: &LocalPublisher) -> Result<Vec<EndpointKey>, ExchangeError> {
        let own_port = local.publisher.local_port();
        match &self.config.candidates {
            Candidates::LocalSubnets => Ok(discovery::enumerate_candidate_endpoints(self.config.ports, Some(own_port))?),
            Candidates::Fixed(list) => Ok(without_own(list, own_port, &local.addresses)),
        }
    }

    fn rediscovery_source(&self, local: &LocalPublisher) -> CandidateSource {
        let own_port = local.publisher.local_port();
        match &self.config.candidates {
            Candidates::LocalSubnets => {
                let ports = self.config.ports;
                Box::new(move || {
                    discovery::enumerate_candidate_endpoints(ports, Some(own_port)).unwrap_or_else(|e| {
                        warn!("rediscovery skipped: {e}");
                        Vec::new()
                    })
                })
            }
            Candidates::Fixed(list) => {
                let list = without_own(list, own_port, &local.addresses);
                Box::new(move || list.clone())
            }
        }
    }
}

/// Drops the endpoints that are this peer's own publisher.
fn without_own(list: &[EndpointKey], own_port: u16, own_addresses: &[IpAddr]) -> Vec<EndpointKey> {
    list.iter()
        .filter(|key| {
            let is_own_host =
                key.address.is_loopback() || key.address.is_unspecified() || own_addresses.contains(&key.address);
            !(is_own_host && key.port == own_port)
        })
        .copied()
        .collect()
}

#[async_trait]
impl GazeExchange for SubnetFloodExchange {
    async fn start(&self) -> Result<(), ExchangeError> {
        let _guard = self.start_lock.lock().await;
        if self.stopped.load(Ordering::Relaxed) {
            return Err(ExchangeError::Stopped);
        }
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let local = self.local_publisher().await?;
        let candidates = self.initial_candidates(local)?;

        let mut subscriber = Subscriber::new(self.config.connection);
        subscriber.subscribe(&[GAZE_TOPIC])?;
        subscriber.add_endpoints(candidates.iter().copied());
        let heartbeats = subscriber.take_heartbeats().ok_or(TransportError::HeartbeatsTaken)?;

        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let mut monitor = LivenessMonitor::new(
            self.config.liveness,
            heartbeats,
            subscriber.connections(),
            evict_tx,
            Arc::clone(&self.running),
        );
        monitor.register_all(candidates.iter().copied());
        if self.config.liveness.rediscovery_interval.is_some() {
            monitor = monitor.with_rediscovery(self.rediscovery_source(local));
        }

        self.running.store(true, Ordering::Relaxed);
        subscriber.start();
        let receive = tokio::spawn(receive_loop(
            subscriber,
            evict_rx,
            Arc::clone(&self.table),
            Arc::clone(&self.running),
            self.config.receive_timeout,
        ));
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(monitor.spawn());
        tasks.push(receive);

        info!("subnet gaze exchange started with {} candidate endpoint(s)", candidates.len());
        Ok(())
    }

    async fn send(&self, position: GazePosition) -> Result<(), ExchangeError> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(ExchangeError::Stopped);
        }
        let local = self.local_publisher().await?;
        let message = GazeMessage::new(local.id.clone(), position);
        local.publisher.send(GAZE_TOPIC, &message.to_wire())?;
        Ok(())
    }

    fn read(&self) -> Result<GazeSnapshot, ExchangeError> {
        if !self.is_running() {
            return Err(ExchangeError::NotRunning);
        }
        Ok(self.table.snapshot())
    }

    fn local_id(&self) -> Option<SenderId> {
        self.publisher.get().map(|local| local.id.clone())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(local) = self.publisher.get() {
            local.publisher.close();
        }
        info!("subnet gaze exchange stopping");
    }
}

impl Drop for SubnetFloodExchange {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

async fn receive_loop(
    mut subscriber: Subscriber,
    mut evictions: mpsc::UnboundedReceiver<EndpointKey>,
    table: Arc<PeerGazeTable>,
    running: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut origins: HashMap<SenderId, EndpointKey> = HashMap::new();
    while running.load(Ordering::Relaxed) {
        tokio::select! {
            message = subscriber.receive(Some(poll)) => {
                if let Some(message) = message {
                    apply_message(&table, &mut origins, &message);
                }
            }
            Some(evicted) = evictions.recv() => {
                clear_origin(&table, &mut origins, evicted);
            }
        }
    }
    subscriber.close();
    debug!("gaze receive loop stopped");
}

/// Applies one gaze message and remembers which endpoint delivered it.
fn apply_message(table: &PeerGazeTable, origins: &mut HashMap<SenderId, EndpointKey>, message: &TopicMessage) {
    match message.text() {
        Ok(text) => {
            if let Some(sender) = apply_gaze_text(table, &text) {
                origins.insert(sender, message.origin);
            }
        }
        Err(e) => warn!("undecodable gaze payload from {}: {e}", message.origin),
    }
}

/// Removes every sender last heard through `evicted`.  Returns how many.
fn clear_origin(table: &PeerGazeTable, origins: &mut HashMap<SenderId, EndpointKey>, evicted: EndpointKey) -> usize {
    let mut cleared = 0;
    origins.retain(|sender, origin| {
        if *origin != evicted {
            return true;
        }
        table.remove(sender);
        cleared += 1;
        false
    });
    if cleared > 0 {
        info!("endpoint {evicted} evicted; cleared {cleared} gaze entries");
    }
    cleared
}

// ── Tests ─────────────────────────────────────────────────────────────────────
