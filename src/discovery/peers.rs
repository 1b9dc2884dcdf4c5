//! Registry of peers currently advertised on the network

use crate::discovery::types::{DiscoveryEvent, PeerRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

/// Tracks advertised peers and turns raw resolve/remove notifications into
/// [`DiscoveryEvent`]s
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    local_id: String,
    peers: RwLock<HashMap<String, PeerRecord>>,
    event_tx: mpsc::Sender<DiscoveryEvent>,
}

impl PeerRegistry {
    /// Create a registry that ignores records carrying `local_id`
    pub fn new(local_id: impl Into<String>) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let registry = Self {
            inner: Arc::new(RegistryInner {
                local_id: local_id.into(),
                peers: RwLock::new(HashMap::new()),
                event_tx,
            }),
        };
        (registry, event_rx)
    }

    /// Add or update a peer. Returns false for our own record.
    pub async fn upsert(&self, record: PeerRecord) -> bool {
        if record.instance_id == self.inner.local_id {
            trace!("Ignoring own advertisement");
            return false;
        }

        let mut peers = self.inner.peers.write().await;
        let event = match peers.get_mut(&record.instance_id) {
            Some(existing) if *existing == record => None,
            Some(existing) => {
                *existing = record.clone();
                Some(DiscoveryEvent::PeerUpdated(record))
            }
            None => {
                debug!("Discovered peer {} ({})", record.instance_id, record.device_name);
                peers.insert(record.instance_id.clone(), record.clone());
                Some(DiscoveryEvent::PeerDiscovered(record))
            }
        };
        drop(peers);

        if let Some(event) = event {
            self.send_event(event).await;
        }
        true
    }

    /// Remove a peer
    pub async fn remove(&self, instance_id: &str) {
        let removed = self.inner.peers.write().await.remove(instance_id).is_some();
        if removed {
            debug!("Peer {} is no longer advertised", instance_id);
            self.send_event(DiscoveryEvent::PeerLost(instance_id.to_string()))
                .await;
        }
    }

    /// Snapshot of all advertised peers
    pub async fn all(&self) -> Vec<PeerRecord> {
        self.inner
            .peers
            .read()
            .await
            .values()
            .cloned()
            .collect()
    }

    async fn send_event(&self, event: DiscoveryEvent) {
        if self.inner.event_tx.send(event).await.is_err() {
            trace!("No discovery event listener");
        }
    }
}
