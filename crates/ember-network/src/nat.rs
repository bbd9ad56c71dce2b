//! Best-effort NAT traversal via UPnP.
//!
//! Gateway discovery and the mapping request run on the blocking pool; the
//! igd client speaks HTTP to the router. Every failure here is benign: the
//! host simply runs without a mapping.

use crate::{NetworkError, NetworkResult};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::{info, warn};

/// Mapping lease requested from the router.
const MAPPING_LEASE_SECS: u32 = 3600;

/// Description shown in the router's mapping table.
const MAPPING_DESCRIPTION: &str = "ember-node";

/// An established port mapping.
#[derive(Debug, Clone)]
pub struct NatMapping {
    /// External IP the router reported. `0.0.0.0` means the router did not
    /// know its own WAN address.
    pub external_ip: Ipv4Addr,
    /// External port actually granted; the router may pick a different one
    /// than requested.
    pub external_port: u16,
}

impl NatMapping {
    /// True when the router could not tell us a usable WAN address.
    pub fn external_unspecified(&self) -> bool {
        self.external_ip.is_unspecified()
    }
}

/// Ask the gateway to map `listen_port` on `local_ip` to its WAN side.
pub async fn map_port(local_ip: Ipv4Addr, listen_port: u16) -> NetworkResult<NatMapping> {
    let local_addr = SocketAddr::V4(SocketAddrV4::new(local_ip, listen_port));

    let result = tokio::task::spawn_blocking(move || {
        use igd_next::{search_gateway, PortMappingProtocol, SearchOptions};

        let gateway = search_gateway(SearchOptions::default())
            .map_err(|e| NetworkError::NoUpnpDevice(e.to_string()))?;

        let external_ip = match gateway.get_external_ip() {
            Ok(std::net::IpAddr::V4(ip)) => ip,
            Ok(std::net::IpAddr::V6(_)) | Err(_) => Ipv4Addr::UNSPECIFIED,
        };

        let external_port = gateway
            .add_any_port(
                PortMappingProtocol::TCP,
                local_addr,
                MAPPING_LEASE_SECS,
                MAPPING_DESCRIPTION,
            )
            .map_err(|e| NetworkError::NoUpnpDevice(e.to_string()))?;

        Ok(NatMapping {
            external_ip,
            external_port,
        })
    })
    .await
    .map_err(|e| NetworkError::NoUpnpDevice(e.to_string()))?;

    match &result {
        Ok(mapping) => info!(
            external = %mapping.external_ip,
            port = mapping.external_port,
            local = listen_port,
            "Punched through NAT"
        ),
        Err(e) => warn!(error = %e, "No NAT mapping, assuming direct reachability"),
    }
    result
}

/// Drop a previously established mapping. Failures are ignored; the lease
/// expires on its own.
pub async fn unmap_port(mapping: NatMapping) {
    let _ = tokio::task::spawn_blocking(move || {
        use igd_next::{search_gateway, PortMappingProtocol, SearchOptions};

        if let Ok(gateway) = search_gateway(SearchOptions::default()) {
            let _ = gateway.remove_port(PortMappingProtocol::TCP, mapping.external_port);
            info!(port = mapping.external_port, "Removed NAT mapping");
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified_external() {
        let mapping = NatMapping {
            external_ip: Ipv4Addr::UNSPECIFIED,
            external_port: 30303,
        };
        assert!(mapping.external_unspecified());

        let mapping = NatMapping {
            external_ip: Ipv4Addr::new(93, 184, 216, 34),
            external_port: 30400,
        };
        assert!(!mapping.external_unspecified());
    }
}
