//! mDNS/DNS-SD service discovery implementation

use crate::discovery::types::{extract_instance_id, instance_name, PeerRecord, SERVICE_TYPE};
use crate::discovery::{Discovery, PeerRegistry};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo as MdnsServiceInfo, TxtProperties};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// mDNS-based service discovery
pub struct MdnsDiscovery {
    local: PeerRecord,
    registry: PeerRegistry,
    daemon: Arc<Mutex<Option<ServiceDaemon>>>,
    service_handle: Arc<Mutex<Option<String>>>,
    browse_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl MdnsDiscovery {
    /// Create a discovery instance announcing `local` and feeding `registry`
    pub fn new(local: PeerRecord, registry: PeerRegistry) -> Self {
        Self {
            local,
            registry,
            daemon: Arc::new(Mutex::new(None)),
            service_handle: Arc::new(Mutex::new(None)),
            browse_handle: Arc::new(RwLock::new(None)),
        }
    }

    async fn announce(&self) -> Result<()> {
        let daemon = self.daemon.lock().await;
        let daemon = daemon
            .as_ref()
            .ok_or_else(|| anyhow!("mDNS daemon not started"))?;

        let mdns_info = Self::create_mdns_service_info(&self.local)?;
        let service_name = mdns_info.get_fullname().to_string();
        daemon.register(mdns_info)?;
        info!("Announced {} on port {}", service_name, self.local.port);

        *self.service_handle.lock().await = Some(service_name);
        Ok(())
    }

    async fn start_browsing(&self) -> Result<()> {
        let daemon = self.daemon.lock().await;
        let daemon = daemon
            .as_ref()
            .ok_or_else(|| anyhow!("mDNS daemon not started"))?;

        let receiver = daemon.browse(SERVICE_TYPE)?;
        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            Self::browse_loop(receiver, registry).await;
        });

        *self.browse_handle.write().await = Some(handle);
        Ok(())
    }

    async fn browse_loop(receiver: mdns_sd::Receiver<ServiceEvent>, registry: PeerRegistry) {
        while let Ok(event) = receiver.recv_async().await {
            Self::handle_service_event(event, &registry).await;
        }
        debug!("mDNS browse channel closed");
    }

    async fn handle_service_event(event: ServiceEvent, registry: &PeerRegistry) {
        match event {
            ServiceEvent::ServiceResolved(info) => match Self::parse_service_info(&info) {
                Ok(record) => {
                    registry.upsert(record).await;
                }
                Err(e) => warn!("Ignoring malformed record {}: {}", info.get_fullname(), e),
            },
            ServiceEvent::ServiceRemoved(_, full_name) => {
                if let Some(instance_id) = extract_instance_id(&full_name) {
                    registry.remove(&instance_id).await;
                }
            }
            _ => {}
        }
    }

    /// Parse a resolved service. Addresses from the TXT `hosts` entry carry
    /// prefixes; resolved addresses are only used when it is empty.
    fn parse_service_info(info: &MdnsServiceInfo) -> Result<PeerRecord> {
        let txt_data = Self::parse_txt_records(info.get_properties());
        let mut record = PeerRecord::from_txt(&txt_data)?;

        if record.hosts.is_empty() {
            record.hosts = info
                .get_addresses()
                .iter()
                .map(|ip| crate::discovery::HostCandidate::new(*ip, u8::MAX))
                .collect();
        }
        if record.hosts.is_empty() {
            return Err(anyhow!("No addresses found for service"));
        }
        Ok(record)
    }

    fn parse_txt_records(properties: &TxtProperties) -> Vec<(String, String)> {
        properties
            .iter()
            .map(|prop| {
                let value = prop
                    .val()
                    .map(|val| String::from_utf8_lossy(val).to_string())
                    .unwrap_or_default();
                (prop.key().to_string(), value)
            })
            .collect()
    }

    fn create_mdns_service_info(local: &PeerRecord) -> Result<MdnsServiceInfo> {
        if local.hosts.is_empty() {
            return Err(anyhow!("No local IP addresses found"));
        }

        let hostname = format!("{}.local.", sanitize_hostname(&local.device_name));
        let addresses = local
            .hosts
            .iter()
            .map(|h| h.ip.to_string())
            .collect::<Vec<_>>()
            .join(",");

        Ok(MdnsServiceInfo::new(
            SERVICE_TYPE,
            &instance_name(&local.instance_id),
            &hostname,
            addresses.as_str(),
            local.port,
            Some(local.to_txt()),
        )?)
    }
}

fn sanitize_hostname(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "clipmesh".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn start(&mut self) -> Result<()> {
        let daemon = ServiceDaemon::new()?;
        *self.daemon.lock().await = Some(daemon);

        self.start_browsing().await?;
        if let Err(e) = self.announce().await {
            // Browsing still works without an announcement
            error!("Failed to announce service: {}", e);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.browse_handle.write().await.take() {
            handle.abort();
        }

        if let Some(service_name) = self.service_handle.lock().await.take() {
            if let Some(daemon) = self.daemon.lock().await.as_ref() {
                daemon.unregister(&service_name)?;
            }
        }

        if let Some(daemon) = self.daemon.lock().await.take() {
            daemon.shutdown()?;
        }
        Ok(())
    }

    async fn peers(&self) -> Vec<PeerRecord> {
        self.registry.all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> PeerRecord {
        PeerRecord {
            instance_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            device_name: "Dev's Laptop".to_string(),
            app_version: "0.1.0".to_string(),
            protocol_version: 1,
            platform: "linux".to_string(),
            hosts: vec!["192.168.1.20/24".parse().unwrap()],
            port: 7171,
        }
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("Dev's Laptop"), "Dev-s-Laptop");
        assert_eq!(sanitize_hostname("!!!"), "clipmesh");
    }

    #[test]
    fn test_service_info_carries_record() {
        let info = MdnsDiscovery::create_mdns_service_info(&local()).unwrap();
        assert!(info.get_fullname().starts_with("ClipMesh-550e8400"));

        let parsed = MdnsDiscovery::parse_service_info(&info).unwrap();
        assert_eq!(parsed, local());
    }

    #[test]
    fn test_no_hosts_rejected() {
        let mut record = local();
        record.hosts.clear();
        assert!(MdnsDiscovery::create_mdns_service_info(&record).is_err());
    }
}
