//! Per-peer connection state and the runtime record persisted for it

use crate::discovery::{HostCandidate, PeerRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Connection state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No reachable address known
    Disconnected,
    /// Reachable, session not yet confirmed
    Connecting,
    /// Heartbeat or handshake succeeded
    Connected,
    /// Peer requires manual pairing confirmation
    Unverified,
    /// A session exists but the peer rejects it
    Unmatched,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Unverified => "unverified",
            Self::Unmatched => "unmatched",
        };
        f.write_str(s)
    }
}

/// Durable runtime record for a tracked peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRuntimeInfo {
    pub instance_id: String,
    pub device_name: String,
    pub platform: String,
    pub app_version: String,
    pub protocol_version: u32,
    /// Advertised host candidates
    pub hosts: Vec<HostCandidate>,
    pub port: u16,
    pub state: ConnectionState,
    /// Candidate that answered the last reachability probe
    pub connect_host: Option<HostCandidate>,
    /// Whether the peer speaks our protocol version
    pub compatible: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl PeerRuntimeInfo {
    /// Fresh record for a discovered peer
    pub fn from_record(record: &PeerRecord, local_protocol: u32) -> Self {
        let now = Utc::now();
        Self {
            instance_id: record.instance_id.clone(),
            device_name: record.device_name.clone(),
            platform: record.platform.clone(),
            app_version: record.app_version.clone(),
            protocol_version: record.protocol_version,
            hosts: record.hosts.clone(),
            port: record.port,
            state: ConnectionState::Disconnected,
            connect_host: None,
            compatible: record.protocol_version == local_protocol,
            created_at: now,
            modified_at: now,
        }
    }

    /// Merge a newer advertisement. The resolved host is kept only while
    /// the peer still advertises it on the same port.
    pub fn apply_record(&mut self, record: &PeerRecord, local_protocol: u32) {
        let port_changed = self.port != record.port;
        self.device_name = record.device_name.clone();
        self.platform = record.platform.clone();
        self.app_version = record.app_version.clone();
        self.protocol_version = record.protocol_version;
        self.hosts = record.hosts.clone();
        self.port = record.port;
        self.compatible = record.protocol_version == local_protocol;

        let still_advertised = self
            .connect_host
            .map(|host| record.hosts.iter().any(|h| h.ip == host.ip))
            .unwrap_or(false);
        if port_changed || !still_advertised {
            self.connect_host = None;
        }
    }

    /// Address the sync server answered on
    pub fn connect_address(&self) -> Option<SocketAddr> {
        self.connect_host.map(|h| SocketAddr::new(h.ip, self.port))
    }

    /// Register an address a request arrived from when it is not advertised
    pub fn add_observed_host(&mut self, ip: IpAddr) {
        if !self.hosts.iter().any(|h| h.ip == ip) {
            self.hosts.push(HostCandidate::new(ip, u8::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(port: u16, hosts: &[&str]) -> PeerRecord {
        PeerRecord {
            instance_id: "peer".to_string(),
            device_name: "desk".to_string(),
            app_version: "0.1.0".to_string(),
            protocol_version: 1,
            platform: "linux".to_string(),
            hosts: hosts.iter().map(|h| h.parse().unwrap()).collect(),
            port,
        }
    }

    #[test]
    fn test_from_record_starts_disconnected() {
        let info = PeerRuntimeInfo::from_record(&record(7000, &["10.0.0.2/24"]), 1);
        assert_eq!(info.state, ConnectionState::Disconnected);
        assert!(info.compatible);
        assert_eq!(info.connect_address(), None);

        let info = PeerRuntimeInfo::from_record(&record(7000, &["10.0.0.2/24"]), 2);
        assert!(!info.compatible);
    }

    #[test]
    fn test_apply_record_keeps_advertised_host() {
        let mut info = PeerRuntimeInfo::from_record(&record(7000, &["10.0.0.2/24"]), 1);
        info.connect_host = Some("10.0.0.2/24".parse().unwrap());

        info.apply_record(&record(7000, &["10.0.0.2/24", "10.0.1.2/24"]), 1);
        assert_eq!(
            info.connect_address(),
            Some("10.0.0.2:7000".parse().unwrap())
        );

        info.apply_record(&record(7001, &["10.0.0.2/24"]), 1);
        assert_eq!(info.connect_address(), None);

        info.connect_host = Some("10.0.0.2/24".parse().unwrap());
        info.apply_record(&record(7001, &["10.0.9.9/24"]), 1);
        assert_eq!(info.connect_address(), None);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Unverified).unwrap(),
            "\"unverified\""
        );
    }
}
