//! UDP beacon group node.
//!
//! # How peers find each other
//!
//! Each node binds one UDP socket on the first free port of the beacon port
//! range.  Every `interval` it sends a beacon (uuid, name, joined groups,
//! headers) to every port of the range on every target address.  Targets are
//! the subnet broadcast addresses of the local interfaces plus `127.0.0.1`,
//! so nodes on the same host and on the same LAN both hear it.
//!
//! The source address of a received beacon is the sender's *mailbox*.
//! Shouts and whispers are unicast there.
//!
//! - First beacon from a uuid: ENTER.
//! - A `Leaving` frame, or no beacon for `peer_expiry`: EXIT.
//!
//! # Datagram format
//!
//! `b"WAYL"` magic, one version byte, then a bincode [`NodeFrame`].  Anything
//! else arriving on the port is ignored.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{GroupError, GroupEvent, GroupEventKind, GroupNode};
use crate::infrastructure::network::discovery::{self, PortRange};

const MAGIC: &[u8; 4] = b"WAYL";
const NODE_PROTOCOL_VERSION: u8 = 1;
const MAX_DATAGRAM: usize = 65_507;
const EVENT_CAPACITY: usize = 256;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Timing and addressing of a [`BeaconNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconConfig {
    pub port_range: PortRange,
    pub interval: Duration,
    pub peer_expiry: Duration,
    /// Beacon destinations; `None` derives them from the local interfaces.
    pub targets: Option<Vec<IpAddr>>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::new(5670, 5679),
            interval: Duration::from_secs(1),
            peer_expiry: Duration::from_secs(5),
            targets: None,
        }
    }
}

/// Datagram payloads exchanged between beacon nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum NodeFrame {
    Beacon {
        uuid: Uuid,
        name: String,
        groups: Vec<String>,
        /// Headers as a JSON object.
        headers: String,
    },
    Shout {
        uuid: Uuid,
        group: String,
        payload: Vec<u8>,
    },
    Whisper {
        uuid: Uuid,
        payload: Vec<u8>,
    },
    Leaving {
        uuid: Uuid,
    },
}

fn encode_node_frame(frame: &NodeFrame) -> Result<Vec<u8>, GroupError> {
    let body = bincode::serialize(frame).map_err(|e| GroupError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(MAGIC.len() + 1 + body.len());
    out.extend_from_slice(MAGIC);
    out.push(NODE_PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_node_frame(bytes: &[u8]) -> Option<NodeFrame> {
    let rest = bytes.strip_prefix(MAGIC.as_slice())?;
    let (&version, body) = rest.split_first()?;
    if version != NODE_PROTOCOL_VERSION {
        return None;
    }
    bincode::deserialize(body).ok()
}

#[derive(Debug, Clone)]
struct KnownPeer {
    name: String,
    mailbox: SocketAddr,
    groups: HashSet<String>,
    last_seen: Instant,
}

type PeerMap = Arc<Mutex<HashMap<Uuid, KnownPeer>>>;
type GroupSet = Arc<RwLock<BTreeSet<String>>>;

/// Applies one received frame to the peer map, returning the event to emit.
fn handle_frame(
    frame: NodeFrame,
    src: SocketAddr,
    own: Uuid,
    own_groups: &BTreeSet<String>,
    peers: &mut HashMap<Uuid, KnownPeer>,
    now: Instant,
) -> Option<GroupEvent> {
    match frame {
        NodeFrame::Beacon {
            uuid,
            name,
            groups,
            headers,
        } => {
            if uuid == own {
                return None;
            }
            let is_new = !peers.contains_key(&uuid);
            peers.insert(
                uuid,
                KnownPeer {
                    name: name.clone(),
                    mailbox: src,
                    groups: groups.into_iter().collect(),
                    last_seen: now,
                },
            );
            if !is_new {
                return None;
            }
            let headers = serde_json::from_str(&headers).unwrap_or_default();
            Some(GroupEvent {
                peer: uuid,
                name,
                kind: GroupEventKind::Enter { headers },
            })
        }
        NodeFrame::Shout { uuid, group, payload } => {
            if uuid == own || !own_groups.contains(&group) {
                return None;
            }
            let name = peers.get(&uuid).map(|p| p.name.clone()).unwrap_or_default();
            Some(GroupEvent {
                peer: uuid,
                name,
                kind: GroupEventKind::Shout { group, payload },
            })
        }
        NodeFrame::Whisper { uuid, payload } => {
            let name = peers.get(&uuid).map(|p| p.name.clone()).unwrap_or_default();
            Some(GroupEvent {
                peer: uuid,
                name,
                kind: GroupEventKind::Whisper { payload },
            })
        }
        NodeFrame::Leaving { uuid } => peers.remove(&uuid).map(|gone| GroupEvent {
            peer: uuid,
            name: gone.name,
            kind: GroupEventKind::Exit,
        }),
    }
}

/// Removes peers silent for `expiry` and returns their EXIT events.
fn expire_peers(peers: &mut HashMap<Uuid, KnownPeer>, now: Instant, expiry: Duration) -> Vec<GroupEvent> {
    let expired: Vec<Uuid> = peers
        .iter()
        .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= expiry)
        .map(|(uuid, _)| *uuid)
        .collect();
    expired
        .into_iter()
        .filter_map(|uuid| peers.remove(&uuid).map(|gone| (uuid, gone)))
        .map(|(uuid, gone)| GroupEvent {
            peer: uuid,
            name: gone.name,
            kind: GroupEventKind::Exit,
        })
        .collect()
}

/// A LAN group node that discovers peers with UDP beacons.
pub struct BeaconNode {
    uuid: Uuid,
    name: String,
    headers: HashMap<String, String>,
    config: BeaconConfig,
    groups: GroupSet,
    peers: PeerMap,
    socket: Option<Arc<UdpSocket>>,
    events: Option<mpsc::Receiver<GroupEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BeaconNode {
    pub fn new(name: &str, config: BeaconConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            headers: HashMap::new(),
            config,
            groups: Arc::new(RwLock::new(BTreeSet::new())),
            peers: Arc::new(Mutex::new(HashMap::new())),
            socket: None,
            events: None,
            tasks: Vec::new(),
        }
    }

    /// Local UDP port, once started.
    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok()).map(|a| a.port())
    }

    /// Number of peers currently known.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn bind(&self) -> Result<UdpSocket, GroupError> {
        for port in self.config.port_range.iter() {
            match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) => trace!("beacon port {port} unavailable: {e}"),
            }
        }
        Err(GroupError::NoFreePort(self.config.port_range.to_string()))
    }

    fn beacon_destinations(&self) -> Vec<SocketAddr> {
        let addresses = match &self.config.targets {
            Some(targets) => targets.clone(),
            None => match discovery::list_local_interfaces() {
                Ok(interfaces) => discovery::beacon_targets(&interfaces),
                Err(e) => {
                    warn!("falling back to loopback beacons: {e}");
                    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
                }
            },
        };
        addresses
            .iter()
            .flat_map(|ip| self.config.port_range.iter().map(move |port| SocketAddr::new(*ip, port)))
            .collect()
    }

    fn mailboxes(&self, filter: impl Fn(&Uuid, &KnownPeer) -> bool) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(uuid, peer)| filter(uuid, peer))
            .map(|(_, peer)| peer.mailbox)
            .collect()
    }

    async fn send_all(socket: &UdpSocket, bytes: &[u8], destinations: &[SocketAddr]) {
        for dest in destinations {
            if let Err(e) = socket.send_to(bytes, dest).await {
                trace!("send to {dest} failed: {e}");
            }
        }
    }
}

#[async_trait]
impl GroupNode for BeaconNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    fn join(&mut self, group: &str) {
        self.groups.write().unwrap_or_else(|e| e.into_inner()).insert(group.to_string());
    }

    async fn start(&mut self) -> Result<(), GroupError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = self.bind().await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let destinations = self.beacon_destinations();
        let headers = serde_json::to_string(&self.headers).map_err(|e| GroupError::Encode(e.to_string()))?;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        self.tasks.push(tokio::spawn(receive_loop(
            Arc::clone(&socket),
            self.uuid,
            Arc::clone(&self.groups),
            Arc::clone(&self.peers),
            tx.clone(),
        )));
        self.tasks.push(tokio::spawn(beacon_loop(
            Arc::clone(&socket),
            destinations,
            BeaconIdentity {
                uuid: self.uuid,
                name: self.name.clone(),
                headers,
            },
            Arc::clone(&self.groups),
            Arc::clone(&self.peers),
            tx,
            self.config.interval,
            self.config.peer_expiry,
        )));

        info!(
            "beacon node {} ({}) listening on UDP port {}",
            self.name,
            self.uuid,
            socket.local_addr()?.port()
        );
        self.socket = Some(socket);
        self.events = Some(rx);
        Ok(())
    }

    async fn recv(&mut self) -> Option<GroupEvent> {
        self.events.as_mut()?.recv().await
    }

    async fn shout(&self, group: &str, payload: &[u8]) -> Result<(), GroupError> {
        let socket = self.socket.as_ref().ok_or(GroupError::NotStarted)?;
        let bytes = encode_node_frame(&NodeFrame::Shout {
            uuid: self.uuid,
            group: group.to_string(),
            payload: payload.to_vec(),
        })?;
        let destinations = self.mailboxes(|_, peer| peer.groups.contains(group));
        Self::send_all(socket, &bytes, &destinations).await;
        Ok(())
    }

    async fn whisper(&self, peer: Uuid, payload: &[u8]) -> Result<(), GroupError> {
        let socket = self.socket.as_ref().ok_or(GroupError::NotStarted)?;
        let destinations = self.mailboxes(|uuid, _| *uuid == peer);
        if destinations.is_empty() {
            return Err(GroupError::UnknownPeer(peer));
        }
        let bytes = encode_node_frame(&NodeFrame::Whisper {
            uuid: self.uuid,
            payload: payload.to_vec(),
        })?;
        Self::send_all(socket, &bytes, &destinations).await;
        Ok(())
    }

    async fn leave(&mut self, group: &str) -> Result<(), GroupError> {
        self.groups.write().unwrap_or_else(|e| e.into_inner()).remove(group);
        Ok(())
    }

    async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(socket) = self.socket.take() {
            let destinations = self.mailboxes(|_, _| true);
            match encode_node_frame(&NodeFrame::Leaving { uuid: self.uuid }) {
                Ok(bytes) => Self::send_all(&socket, &bytes, &destinations).await,
                Err(e) => warn!("could not announce departure: {e}"),
            }
            debug!("beacon node {} stopped", self.uuid);
        }
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.events = None;
    }
}

impl Drop for BeaconNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

struct BeaconIdentity {
    uuid: Uuid,
    name: String,
    headers: String,
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    own: Uuid,
    groups: GroupSet,
    peers: PeerMap,
    events: mpsc::Sender<GroupEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                trace!("beacon recv failed: {e}");
                time::sleep(RECV_ERROR_BACKOFF).await;
                continue;
            }
        };
        let Some(frame) = decode_node_frame(&buf[..len]) else {
            trace!("ignoring foreign datagram from {src}");
            continue;
        };
        let event = {
            let own_groups = groups.read().unwrap_or_else(|e| e.into_inner()).clone();
            let mut peers = peers.lock().unwrap_or_else(|e| e.into_inner());
            handle_frame(frame, src, own, &own_groups, &mut peers, Instant::now())
        };
        if let Some(event) = event {
            debug!("group event: {event}");
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn beacon_loop(
    socket: Arc<UdpSocket>,
    destinations: Vec<SocketAddr>,
    identity: BeaconIdentity,
    groups: GroupSet,
    peers: PeerMap,
    events: mpsc::Sender<GroupEvent>,
    interval: Duration,
    expiry: Duration,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        let beacon = NodeFrame::Beacon {
            uuid: identity.uuid,
            name: identity.name.clone(),
            groups: groups.read().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect(),
            headers: identity.headers.clone(),
        };
        match encode_node_frame(&beacon) {
            Ok(bytes) => BeaconNode::send_all(&socket, &bytes, &destinations).await,
            Err(e) => warn!("could not encode beacon: {e}"),
        }

        let expired = {
            let mut peers = peers.lock().unwrap_or_else(|e| e.into_inner());
            expire_peers(&mut peers, Instant::now(), expiry)
        };
        for event in expired {
            info!("peer {} ({}) expired", event.name, event.peer);
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
