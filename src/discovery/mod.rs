//! Service discovery for finding other ClipMesh instances on the local network

pub mod mdns;
pub mod peers;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;

pub use mdns::MdnsDiscovery;
pub use peers::PeerRegistry;
pub use types::{DiscoveryEvent, HostCandidate, PeerRecord, RecordError, SERVICE_TYPE};

/// Trait for service discovery implementations
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start announcing and browsing
    async fn start(&mut self) -> Result<()>;

    /// Stop the discovery service
    async fn stop(&mut self) -> Result<()>;

    /// Currently advertised peers
    async fn peers(&self) -> Vec<PeerRecord>;
}

/// Non-loopback interface addresses with their prefix lengths
pub fn local_host_candidates() -> Result<Vec<HostCandidate>> {
    let mut candidates = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        let candidate = match &iface.addr {
            if_addrs::IfAddr::V4(v4) => {
                HostCandidate::new(IpAddr::V4(v4.ip), prefix_len(&v4.netmask.octets()))
            }
            if_addrs::IfAddr::V6(v6) => {
                HostCandidate::new(IpAddr::V6(v6.ip), prefix_len(&v6.netmask.octets()))
            }
        };
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

fn prefix_len(netmask: &[u8]) -> u8 {
    netmask.iter().map(|b| b.count_ones() as u8).sum()
}
