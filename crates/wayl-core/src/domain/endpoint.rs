//! Peer endpoint entity.
//!
//! An endpoint is an `(address, port)` pair that *might* host a peer's
//! publisher.  Discovery produces many more candidate endpoints than there are
//! peers; the liveness layer decides which of them are real by waiting for
//! heartbeats.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Identity of an endpoint: the `(address, port)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub address: IpAddr,
    pub port: u16,
}

impl EndpointKey {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Socket address used to open a transport connection.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for EndpointKey {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// A candidate peer location together with its heartbeat freshness.
///
/// `last_seen` is `None` until the first heartbeat arrives; such an endpoint is
/// *unverified*.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub key: EndpointKey,
    pub registered_at: Instant,
    pub last_seen: Option<Instant>,
}

impl PeerEndpoint {
    /// Creates an unverified endpoint registered at `now`.
    pub fn new(key: EndpointKey, now: Instant) -> Self {
        Self {
            key,
            registered_at: now,
            last_seen: None,
        }
    }

    /// Records a heartbeat observed at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = Some(now);
    }

    /// Returns `true` once at least one heartbeat has been observed.
    pub fn is_verified(&self) -> bool {
        self.last_seen.is_some()
    }

    /// Time reference used for staleness: the last heartbeat, or the
    /// registration time for endpoints that never heartbeated.
    pub fn freshness(&self) -> Instant {
        self.last_seen.unwrap_or(self.registered_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_endpoint_is_unverified() {
        let ep = PeerEndpoint::new(EndpointKey::new("10.0.0.2".parse().unwrap(), 9000), Instant::now());
        assert!(!ep.is_verified());
        assert_eq!(ep.freshness(), ep.registered_at);
    }

    #[test]
    fn test_touch_marks_endpoint_verified_and_moves_freshness() {
        // Arrange
        let t0 = Instant::now();
        let mut ep = PeerEndpoint::new(EndpointKey::new("10.0.0.2".parse().unwrap(), 9000), t0);

        // Act
        ep.touch(t0 + Duration::from_secs(3));

        // Assert
        assert!(ep.is_verified());
        assert_eq!(ep.freshness(), t0 + Duration::from_secs(3));
    }

    #[test]
    fn test_endpoint_key_displays_as_socket_address() {
        let key = EndpointKey::new("192.168.0.7".parse().unwrap(), 9005);
        assert_eq!(key.to_string(), "192.168.0.7:9005");
    }
}
