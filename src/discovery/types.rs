//! Common types for service discovery

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// mDNS service type we publish and browse
pub const SERVICE_TYPE: &str = "_clipmesh._tcp.local.";

/// Prefix of the mDNS instance name, followed by the instance id
pub const INSTANCE_PREFIX: &str = "ClipMesh-";

/// TXT record errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// A required key is absent
    #[error("Missing TXT key: {0}")]
    MissingKey(&'static str),

    /// A value failed to parse
    #[error("Invalid TXT value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// One advertised address of a peer together with its network prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostCandidate {
    /// Interface address
    pub ip: IpAddr,
    /// Network prefix length
    pub prefix_len: u8,
}

impl HostCandidate {
    /// Build a candidate, clamping the prefix to the address family width
    pub fn new(ip: IpAddr, prefix_len: u8) -> Self {
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            ip,
            prefix_len: prefix_len.min(max),
        }
    }

    /// Whether `ip` falls in this candidate's network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.ip, ip) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                u32::from(a) & mask == u32::from(b) & mask
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                u128::from(a) & mask == u128::from(b) & mask
            }
            _ => false,
        }
    }

    /// Whether two candidates sit on the same network as seen from `self`
    pub fn same_subnet(&self, other: &HostCandidate) -> bool {
        self.contains(other.ip)
    }
}

impl fmt::Display for HostCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl FromStr for HostCandidate {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RecordError::InvalidValue {
            key: "hosts",
            value: s.to_string(),
        };
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };
        let ip: IpAddr = ip.trim().parse().map_err(|_| invalid())?;
        let prefix_len = match prefix {
            Some(p) => p.trim().parse().map_err(|_| invalid())?,
            None if ip.is_ipv4() => 32,
            None => 128,
        };
        Ok(Self::new(ip, prefix_len))
    }
}

/// Descriptor another instance publishes on the local network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable instance id
    pub instance_id: String,
    /// Human-readable device name
    pub device_name: String,
    /// Application version
    pub app_version: String,
    /// Sync protocol version
    pub protocol_version: u32,
    /// Platform (macos, linux, windows)
    pub platform: String,
    /// Reachable interface addresses
    pub hosts: Vec<HostCandidate>,
    /// Sync server port
    pub port: u16,
}

impl PeerRecord {
    /// Encode as TXT key/value pairs
    pub fn to_txt(&self) -> HashMap<String, String> {
        let hosts = self
            .hosts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        HashMap::from([
            ("id".to_string(), self.instance_id.clone()),
            ("version".to_string(), self.app_version.clone()),
            ("protocol".to_string(), self.protocol_version.to_string()),
            ("platform".to_string(), self.platform.clone()),
            ("name".to_string(), self.device_name.clone()),
            ("hosts".to_string(), hosts),
            ("port".to_string(), self.port.to_string()),
        ])
    }

    /// Decode from TXT key/value pairs. Unknown keys are ignored; an
    /// unparseable host entry is skipped rather than failing the record.
    pub fn from_txt(txt: &[(String, String)]) -> Result<Self, RecordError> {
        let get = |key: &str| {
            txt.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        };

        let instance_id = get("id")
            .filter(|v| !v.is_empty())
            .ok_or(RecordError::MissingKey("id"))?
            .to_string();
        let port_raw = get("port").ok_or(RecordError::MissingKey("port"))?;
        let port = port_raw.parse().map_err(|_| RecordError::InvalidValue {
            key: "port",
            value: port_raw.to_string(),
        })?;
        let protocol_raw = get("protocol").ok_or(RecordError::MissingKey("protocol"))?;
        let protocol_version = protocol_raw.parse().map_err(|_| RecordError::InvalidValue {
            key: "protocol",
            value: protocol_raw.to_string(),
        })?;

        let hosts = get("hosts")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();

        Ok(Self {
            device_name: get("name").unwrap_or(&instance_id).to_string(),
            instance_id,
            app_version: get("version").unwrap_or("unknown").to_string(),
            protocol_version,
            platform: get("platform").unwrap_or("unknown").to_string(),
            hosts,
            port,
        })
    }
}

/// Discovery events
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// New peer discovered
    PeerDiscovered(PeerRecord),
    /// Peer information updated
    PeerUpdated(PeerRecord),
    /// Peer is no longer advertised
    PeerLost(String),
}

/// Instance name used for our mDNS registration
pub fn instance_name(instance_id: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, instance_id)
}

/// Recover the instance id from a full service name such as
/// `ClipMesh-<id>._clipmesh._tcp.local.`
pub fn extract_instance_id(fullname: &str) -> Option<String> {
    let instance = fullname.strip_suffix(SERVICE_TYPE)?.trim_end_matches('.');
    instance
        .strip_prefix(INSTANCE_PREFIX)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
