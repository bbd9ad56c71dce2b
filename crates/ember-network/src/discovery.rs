//! Local address discovery.
//!
//! Enumerates the host's IPv4 interfaces and splits them into "local"
//! addresses (loopback/unspecified, never advertised) and peer-advertisable
//! ones. With no enumerable interface at all the host cannot run.

use crate::{NetworkError, NetworkResult};
use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Addresses that are never advertised to peers.
fn is_reject_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => *v4 == Ipv4Addr::LOCALHOST || *v4 == Ipv4Addr::UNSPECIFIED,
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// The host's discovered addresses.
#[derive(Debug, Clone, Default)]
pub struct HostAddresses {
    /// Every IPv4 address bound to a local interface.
    pub addresses: Vec<Ipv4Addr>,
    /// The subset worth advertising to peers.
    pub peer_addresses: Vec<Ipv4Addr>,
}

impl HostAddresses {
    /// Enumerate local interfaces.
    pub fn discover() -> NetworkResult<Self> {
        let interfaces = list_afinet_netifas().map_err(|_| NetworkError::NoNetworking)?;
        let mut out = Self::default();

        for (name, addr) in interfaces {
            let IpAddr::V4(v4) = addr else { continue };
            let local = is_reject_address(&addr);
            debug!(
                interface = %name,
                address = %v4,
                kind = if local { "local" } else { "peer" },
                "Discovered address"
            );
            out.addresses.push(v4);
            if !local {
                out.peer_addresses.push(v4);
            }
        }

        if out.addresses.is_empty() {
            return Err(NetworkError::NoNetworking);
        }
        Ok(out)
    }

    /// Build from a fixed list, classifying the same way as `discover`.
    pub fn from_addresses(addresses: Vec<Ipv4Addr>) -> Self {
        let peer_addresses = addresses
            .iter()
            .copied()
            .filter(|a| !is_reject_address(&IpAddr::V4(*a)))
            .collect();
        Self {
            addresses,
            peer_addresses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_set() {
        assert!(is_reject_address(&"127.0.0.1".parse().unwrap()));
        assert!(is_reject_address(&"0.0.0.0".parse().unwrap()));
        assert!(is_reject_address(&"::1".parse().unwrap()));
        assert!(is_reject_address(&"::".parse().unwrap()));
        assert!(!is_reject_address(&"192.168.1.4".parse().unwrap()));
        assert!(!is_reject_address(&"93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_classification() {
        let addrs = HostAddresses::from_addresses(vec![
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(192, 168, 1, 4),
            Ipv4Addr::new(93, 184, 216, 34),
        ]);
        assert_eq!(addrs.addresses.len(), 3);
        assert_eq!(
            addrs.peer_addresses,
            vec![Ipv4Addr::new(192, 168, 1, 4), Ipv4Addr::new(93, 184, 216, 34)]
        );
    }
}
