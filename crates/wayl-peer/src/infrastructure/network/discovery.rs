//! Rendezvous-free endpoint discovery.
//!
//! There is no directory server.  Instead every peer works out the whole space
//! of places where another peer *could* be listening and connects to all of
//! them:
//!
//! 1. Enumerate the local IPv4 interfaces.
//! 2. For each interface derive the hosts of its subnet (a loopback interface
//!    contributes only `127.0.0.1`).
//! 3. Cross every host with the publish port range.
//! 4. Drop the caller's own `(address, port)`.
//!
//! On a /24 with a ten-port range that is roughly 2 500 candidates.  Almost
//! all of them are dead; they never send a heartbeat and the liveness monitor
//! prunes them without raising an error.  Trading connection attempts for
//! zero infrastructure is the whole point.
//!
//! # Subnet clamp
//!
//! A /16 office network would expand to 65 000 hosts.  Subnets wider than
//! [`MIN_PREFIX_LEN`] are therefore narrowed to the /24 that contains the
//! local address.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use wayl_core::EndpointKey;

/// Narrowest prefix that is expanded into candidates.
pub const MIN_PREFIX_LEN: u8 = 24;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Every port of the range is already taken.
    #[error("no free port in range {range}")]
    NoFreePort { range: PortRange },

    /// The local interfaces could not be listed.
    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[source] std::io::Error),
}

/// Inclusive range of TCP/UDP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Iterates the ports in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of ports in the range (zero when `start > end`).
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// An IPv4 address configured on a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub is_loopback: bool,
}

impl LocalInterface {
    /// The subnet this interface sits on, clamped to [`MIN_PREFIX_LEN`].
    fn clamped_net(&self) -> Ipv4Net {
        let prefix = self.prefix_len.max(MIN_PREFIX_LEN).min(32);
        // `prefix` is at most 32, so construction cannot fail.
        Ipv4Net::new(self.address, prefix)
            .map(|net| net.trunc())
            .unwrap_or_else(|_| Ipv4Net::from(self.address))
    }

    /// Hosts that may run a peer reachable through this interface.
    pub fn subnet_hosts(&self) -> Vec<Ipv4Addr> {
        if self.is_loopback {
            return vec![Ipv4Addr::LOCALHOST];
        }
        let net = self.clamped_net();
        if net.prefix_len() >= 31 {
            // Point-to-point links have no broadcast/network address to skip.
            return vec![self.address];
        }
        net.hosts().collect()
    }

    /// Subnet broadcast address, `None` for loopback and point-to-point links.
    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        if self.is_loopback || self.prefix_len >= 31 {
            return None;
        }
        let net = Ipv4Net::new(self.address, self.prefix_len).ok()?;
        Some(net.broadcast())
    }
}

/// Lists the IPv4 interfaces of this machine.
///
/// # Errors
///
/// Returns [`DiscoveryError::Interfaces`] if the OS query fails.
pub fn list_local_interfaces() -> Result<Vec<LocalInterface>, DiscoveryError> {
    let interfaces = if_addrs::get_if_addrs().map_err(DiscoveryError::Interfaces)?;
    let mut result = Vec::new();
    for iface in interfaces {
        let is_loopback = iface.is_loopback();
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            let prefix_len = ipnet::ipv4_mask_to_prefix(v4.netmask).unwrap_or(MIN_PREFIX_LEN);
            result.push(LocalInterface {
                name: iface.name,
                address: v4.ip,
                prefix_len,
                is_loopback,
            });
        }
    }
    trace!("found {} IPv4 interface(s)", result.len());
    Ok(result)
}

/// Returns one address per active local interface, loopback included.
///
/// # Errors
///
/// Returns [`DiscoveryError::Interfaces`] if the OS query fails.
pub fn enumerate_local_addresses() -> Result<Vec<IpAddr>, DiscoveryError> {
    Ok(local_addresses(&list_local_interfaces()?))
}

/// Deduplicated addresses of `interfaces`, in interface order.
pub fn local_addresses(interfaces: &[LocalInterface]) -> Vec<IpAddr> {
    let mut seen = BTreeSet::new();
    interfaces
        .iter()
        .filter(|iface| seen.insert(iface.address))
        .map(|iface| IpAddr::V4(iface.address))
        .collect()
}

/// Picks the address used to name this peer: the first non-loopback address,
/// falling back to loopback on an isolated machine.
pub fn primary_address(addresses: &[IpAddr]) -> IpAddr {
    addresses
        .iter()
        .copied()
        .find(|a| !a.is_loopback())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Derives the candidate endpoints for `interfaces` crossed with `ports`.
///
/// When `own_port` is given, `(address, own_port)` is excluded for every local
/// address: the local publisher listens on all interfaces.
pub fn candidate_endpoints(
    interfaces: &[LocalInterface],
    ports: PortRange,
    own_port: Option<u16>,
) -> Vec<EndpointKey> {
    let own_addresses: BTreeSet<Ipv4Addr> = interfaces.iter().map(|i| i.address).collect();
    let mut hosts = BTreeSet::new();
    for iface in interfaces {
        hosts.extend(iface.subnet_hosts());
    }

    let mut candidates = Vec::with_capacity(hosts.len() * ports.len());
    for host in hosts {
        let is_own_host = own_addresses.contains(&host) || host.is_loopback();
        for port in ports.iter() {
            if is_own_host && Some(port) == own_port {
                continue;
            }
            candidates.push(EndpointKey::new(IpAddr::V4(host), port));
        }
    }
    candidates
}

/// Enumerates candidate endpoints on every local subnet.
///
/// # Errors
///
/// Returns [`DiscoveryError::Interfaces`] if the OS query fails.
pub fn enumerate_candidate_endpoints(
    ports: PortRange,
    own_port: Option<u16>,
) -> Result<Vec<EndpointKey>, DiscoveryError> {
    let interfaces = list_local_interfaces()?;
    let candidates = candidate_endpoints(&interfaces, ports, own_port);
    info!(
        "discovery: {} candidate endpoint(s) across {} interface(s), ports {ports}",
        candidates.len(),
        interfaces.len()
    );
    Ok(candidates)
}

/// Broadcast targets for group beacons: every subnet broadcast address plus
/// loopback, so peers on the same host find each other as well.
pub fn beacon_targets(interfaces: &[LocalInterface]) -> Vec<IpAddr> {
    let mut targets: BTreeSet<Ipv4Addr> = interfaces.iter().filter_map(LocalInterface::broadcast).collect();
    targets.insert(Ipv4Addr::LOCALHOST);
    targets.into_iter().map(IpAddr::V4).collect()
}

/// Tries each port of `range` in order and returns the first listener that
/// binds on all interfaces.
///
/// # Errors
///
/// Returns [`DiscoveryError::NoFreePort`] when every port is taken.
pub fn find_free_publish_port(range: PortRange) -> Result<(TcpListener, u16), DiscoveryError> {
    for port in range.iter() {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        match TcpListener::bind(addr) {
            Ok(listener) => {
                debug!("bound publish port {port}");
                return Ok((listener, port));
            }
            Err(e) => trace!("port {port} unavailable: {e}"),
        }
    }
    Err(DiscoveryError::NoFreePort { range })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
