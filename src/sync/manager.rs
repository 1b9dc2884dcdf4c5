//! Registry of tracked peers
//!
//! Discovery records for peers we track refresh their handlers. Records of
//! peers we do not track yet, minus blocked ones, form the list of pairing
//! candidates shown to the user.

use crate::discovery::{DiscoveryEvent, HostCandidate, PeerRecord};
use crate::sync::client::PeerTarget;
use crate::sync::handler::SyncHandler;
use crate::sync::protocol::{SyncInfo, PROTOCOL_VERSION};
use crate::sync::server::ServerCallbacks;
use crate::sync::state::{ConnectionState, PeerRuntimeInfo};
use crate::sync::{Result, SyncContext, SyncError};
use crate::tasks::PeerLocator;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ManagerInner {
    ctx: Arc<SyncContext>,
    handlers: RwLock<HashMap<String, SyncHandler>>,
    discovered: RwLock<HashMap<String, PeerRecord>>,
    blacklist: RwLock<HashSet<String>>,
    candidates: watch::Sender<Vec<PeerRecord>>,
    cancel: CancellationToken,
}

/// Owns one [`SyncHandler`] per tracked peer
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let (candidates, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(ManagerInner {
                ctx,
                handlers: RwLock::new(HashMap::new()),
                discovered: RwLock::new(HashMap::new()),
                blacklist: RwLock::new(HashSet::new()),
                candidates,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.inner.ctx
    }

    /// Load the blacklist and resume tracking every stored peer
    pub async fn start(&self) -> Result<usize> {
        let blocked = self.inner.ctx.db.blacklist().await?;
        *self.inner.blacklist.write().await = blocked.into_iter().collect();

        let stored: Vec<PeerRuntimeInfo> = self.inner.ctx.db.list_peers().await?;
        let mut handlers = self.inner.handlers.write().await;
        for mut info in stored {
            if handlers.contains_key(&info.instance_id) {
                continue;
            }
            // The old address may be gone; probe again
            info.state = ConnectionState::Disconnected;
            info.connect_host = None;
            info.compatible = info.protocol_version == PROTOCOL_VERSION;
            let handler = SyncHandler::spawn(self.inner.ctx.clone(), info);
            handlers.insert(handler.peer_id().to_string(), handler);
        }
        let restored = handlers.len();
        drop(handlers);

        info!("Resumed tracking {} peer(s)", restored);
        self.recompute_candidates().await;
        Ok(restored)
    }

    /// Feed discovery events until the channel closes or we shut down
    pub fn spawn_discovery(&self, mut events: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.inner.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => manager.handle_discovery_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Discovery feed stopped");
        })
    }

    pub async fn handle_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerDiscovered(record) | DiscoveryEvent::PeerUpdated(record) => {
                self.inner
                    .discovered
                    .write()
                    .await
                    .insert(record.instance_id.clone(), record.clone());
                if let Some(handler) = self.handler(&record.instance_id).await {
                    handler.update_from_discovery(&record).await;
                }
            }
            DiscoveryEvent::PeerLost(instance_id) => {
                self.inner.discovered.write().await.remove(&instance_id);
            }
        }
        self.recompute_candidates().await;
    }

    async fn recompute_candidates(&self) {
        let handlers = self.inner.handlers.read().await;
        let blacklist = self.inner.blacklist.read().await;
        let discovered = self.inner.discovered.read().await;

        let mut candidates: Vec<PeerRecord> = discovered
            .values()
            .filter(|r| !handlers.contains_key(&r.instance_id))
            .filter(|r| !blacklist.contains(&r.instance_id))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.device_name
                .cmp(&b.device_name)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        self.inner.candidates.send_replace(candidates);
    }

    /// Discovered peers that are neither tracked nor blocked
    pub fn candidates(&self) -> watch::Receiver<Vec<PeerRecord>> {
        self.inner.candidates.subscribe()
    }

    pub fn pairing_candidates(&self) -> Vec<PeerRecord> {
        self.inner.candidates.borrow().clone()
    }

    pub async fn handler(&self, peer_id: &str) -> Option<SyncHandler> {
        self.inner.handlers.read().await.get(peer_id).cloned()
    }

    fn require(&self, handler: Option<SyncHandler>, peer_id: &str) -> Result<SyncHandler> {
        handler.ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))
    }

    /// Runtime records of every tracked peer
    pub async fn peers(&self) -> Vec<PeerRuntimeInfo> {
        let handlers: Vec<SyncHandler> =
            self.inner.handlers.read().await.values().cloned().collect();
        let mut peers = Vec::with_capacity(handlers.len());
        for handler in handlers {
            peers.push(handler.info().await);
        }
        peers.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        peers
    }

    /// Start tracking a discovered peer the user accepted
    pub async fn add_peer(&self, peer_id: &str) -> Result<SyncHandler> {
        if self.inner.blacklist.read().await.contains(peer_id) {
            return Err(SyncError::Blocked(peer_id.to_string()));
        }
        let record = self
            .inner
            .discovered
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;

        let handler = self
            .track(PeerRuntimeInfo::from_record(&record, PROTOCOL_VERSION))
            .await?;
        self.recompute_candidates().await;
        Ok(handler)
    }

    /// Persist the record, then start a handler for it
    async fn track(&self, info: PeerRuntimeInfo) -> Result<SyncHandler> {
        let mut handlers = self.inner.handlers.write().await;
        if let Some(existing) = handlers.get(&info.instance_id) {
            return Ok(existing.clone());
        }

        self.inner.ctx.db.save_peer(&info.instance_id, &info).await?;
        info!("Tracking {} ({})", info.instance_id, info.device_name);
        let handler = SyncHandler::spawn(self.inner.ctx.clone(), info);
        handlers.insert(handler.peer_id().to_string(), handler.clone());
        Ok(handler)
    }

    /// Ask the peer to display its pairing token, tracking it first if needed
    pub async fn verify(&self, peer_id: &str) -> Result<()> {
        let handler = match self.handler(peer_id).await {
            Some(handler) => handler,
            None => self.add_peer(peer_id).await?,
        };
        handler.show_token().await
    }

    pub async fn trust_by_token(&self, peer_id: &str, token: &str) -> Result<ConnectionState> {
        let handler = self.require(self.handler(peer_id).await, peer_id)?;
        handler.trust_by_token(token).await
    }

    /// Stop tracking a peer and discard its session
    pub async fn remove_handler(&self, peer_id: &str) -> Result<()> {
        let handler = self.inner.handlers.write().await.remove(peer_id);
        let handler = self.require(handler, peer_id)?;
        handler.clear_context().await;
        self.recompute_candidates().await;
        Ok(())
    }

    pub async fn resolve_sync(&self, peer_id: &str) -> Result<ConnectionState> {
        let handler = self.require(self.handler(peer_id).await, peer_id)?;
        Ok(handler.force_resolve().await)
    }

    /// Force-resolve every tracked peer concurrently
    pub async fn resolve_all(&self) -> Vec<(String, ConnectionState)> {
        let handlers: Vec<SyncHandler> =
            self.inner.handlers.read().await.values().cloned().collect();
        join_all(handlers.iter().map(|handler| async move {
            (handler.peer_id().to_string(), handler.force_resolve().await)
        }))
        .await
    }

    pub async fn connect_host_address(&self, peer_id: &str) -> Result<Option<SocketAddr>> {
        let handler = self.require(self.handler(peer_id).await, peer_id)?;
        Ok(handler.connect_host_address().await)
    }

    pub async fn connect_target(&self, peer_id: &str) -> Result<PeerTarget> {
        let handler = self.require(self.handler(peer_id).await, peer_id)?;
        handler.connect_target().await
    }

    /// Blacklist a peer, dropping its handler if tracked
    pub async fn block(&self, peer_id: &str) -> Result<()> {
        self.inner.ctx.db.block(peer_id).await?;
        self.inner
            .blacklist
            .write()
            .await
            .insert(peer_id.to_string());
        info!("Blocked {}", peer_id);

        if self.handler(peer_id).await.is_some() {
            self.remove_handler(peer_id).await?;
        } else {
            self.recompute_candidates().await;
        }
        Ok(())
    }

    pub async fn unblock(&self, peer_id: &str) -> Result<bool> {
        let removed = self.inner.ctx.db.unblock(peer_id).await?;
        self.inner.blacklist.write().await.remove(peer_id);
        self.recompute_candidates().await;
        Ok(removed)
    }

    pub async fn blocked(&self) -> Vec<String> {
        let mut blocked: Vec<String> = self.inner.blacklist.read().await.iter().cloned().collect();
        blocked.sort();
        blocked
    }

    /// Tell connected peers we are leaving and stop every loop
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handlers: Vec<SyncHandler> =
            self.inner.handlers.read().await.values().cloned().collect();
        join_all(handlers.iter().map(|handler| handler.notify_exit())).await;
        info!("Sync manager stopped");
    }

    /// Record for a peer that paired with us from its side
    async fn record_for_sender(&self, sender: &str, info: &SyncInfo, remote: IpAddr) -> PeerRuntimeInfo {
        let discovered = self.inner.discovered.read().await.get(sender).cloned();
        let mut runtime = match discovered {
            Some(record) => PeerRuntimeInfo::from_record(&record, PROTOCOL_VERSION),
            None => {
                let now = Utc::now();
                PeerRuntimeInfo {
                    instance_id: sender.to_string(),
                    device_name: info.device_name.clone(),
                    platform: info.platform.clone(),
                    app_version: info.app_version.clone(),
                    protocol_version: info.protocol_version,
                    hosts: vec![HostCandidate::new(remote, u8::MAX)],
                    port: info.port,
                    state: ConnectionState::Disconnected,
                    connect_host: None,
                    compatible: info.protocol_version == PROTOCOL_VERSION,
                    created_at: now,
                    modified_at: now,
                }
            }
        };
        runtime.add_observed_host(remote);
        runtime
    }
}

#[async_trait]
impl ServerCallbacks for SyncManager {
    async fn on_heartbeat(&self, sender: &str, _info: &SyncInfo, _remote: IpAddr) {
        match self.handler(sender).await {
            Some(handler) if handler.state().await != ConnectionState::Connected => {
                handler.trigger();
            }
            Some(_) => {}
            None => debug!("Heartbeat from untracked {}", sender),
        }
    }

    async fn on_session_created(&self, sender: &str, info: &SyncInfo, remote: IpAddr) {
        if self.inner.blacklist.read().await.contains(sender) {
            warn!("Session from blocked {} left untracked", sender);
            return;
        }
        if let Some(handler) = self.handler(sender).await {
            handler.trigger();
            return;
        }

        let runtime = self.record_for_sender(sender, info, remote).await;
        match self.track(runtime).await {
            Ok(_) => self.recompute_candidates().await,
            Err(e) => warn!("Failed to track {}: {}", sender, e),
        }
    }

    async fn on_peer_exit(&self, sender: &str) {
        if let Some(handler) = self.handler(sender).await {
            tokio::spawn(async move {
                handler.force_resolve().await;
            });
        }
    }

    async fn on_peer_removed(&self, sender: &str) {
        let channel = self.inner.ctx.channel.clone();
        let handler = self.handler(sender).await;
        let sender = sender.to_string();
        tokio::spawn(async move {
            if let Err(e) = channel.remove_session(&sender).await {
                warn!("Failed to drop session with {}: {}", sender, e);
            }
            if let Some(handler) = handler {
                handler.force_resolve().await;
            }
        });
    }
}

#[async_trait]
impl PeerLocator for SyncManager {
    async fn locate(&self, peer_id: &str) -> Option<PeerTarget> {
        match self.connect_target(peer_id).await {
            Ok(target) => Some(target),
            Err(e) => {
                debug!("Cannot locate {}: {}", peer_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::handler::tests::{context, remote_record, FakePeer};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn record(id: &str) -> PeerRecord {
        PeerRecord {
            instance_id: id.to_string(),
            device_name: id.to_string(),
            ..remote_record()
        }
    }

    async fn manager() -> (SyncManager, Arc<FakePeer>) {
        let peer = FakePeer::new(Duration::ZERO).await;
        peer.reachable
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let ctx = context(peer.clone()).await;
        (SyncManager::new(ctx), peer)
    }

    fn ids(records: &[PeerRecord]) -> Vec<&str> {
        records.iter().map(|r| r.instance_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_candidates_exclude_tracked_and_blocked() {
        let (manager, _peer) = manager().await;
        for id in ["a", "b", "c"] {
            manager
                .handle_discovery_event(DiscoveryEvent::PeerDiscovered(record(id)))
                .await;
        }
        assert_eq!(ids(&manager.pairing_candidates()), vec!["a", "b", "c"]);

        manager.add_peer("a").await.unwrap();
        manager.block("b").await.unwrap();
        assert_eq!(ids(&manager.pairing_candidates()), vec!["c"]);

        manager
            .handle_discovery_event(DiscoveryEvent::PeerLost("c".to_string()))
            .await;
        assert!(manager.pairing_candidates().is_empty());

        manager.unblock("b").await.unwrap();
        assert_eq!(ids(&manager.pairing_candidates()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_add_peer_errors() {
        let (manager, _peer) = manager().await;
        assert!(matches!(
            manager.add_peer("ghost").await,
            Err(SyncError::UnknownPeer(_))
        ));

        manager
            .handle_discovery_event(DiscoveryEvent::PeerDiscovered(record("x")))
            .await;
        manager.block("x").await.unwrap();
        assert!(matches!(
            manager.add_peer("x").await,
            Err(SyncError::Blocked(_))
        ));
        assert!(matches!(
            manager.resolve_sync("x").await,
            Err(SyncError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_start_restores_stored_peers() {
        let (manager, _peer) = manager().await;
        let mut info = PeerRuntimeInfo::from_record(&remote_record(), PROTOCOL_VERSION);
        info.state = ConnectionState::Connected;
        manager.context().db.save_peer("remote", &info).await.unwrap();
        manager.context().db.block("blocked").await.unwrap();

        assert_eq!(manager.start().await.unwrap(), 1);
        let handler = manager.handler("remote").await.unwrap();
        assert_eq!(handler.info().await.connect_host, None);
        assert_eq!(manager.blocked().await, vec!["blocked".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_handler_returns_peer_to_candidates() {
        let (manager, _peer) = manager().await;
        manager
            .handle_discovery_event(DiscoveryEvent::PeerDiscovered(record("remote")))
            .await;
        manager.add_peer("remote").await.unwrap();
        assert!(manager.pairing_candidates().is_empty());
        assert_eq!(manager.peers().await.len(), 1);

        manager.remove_handler("remote").await.unwrap();
        assert!(manager.handler("remote").await.is_none());
        assert_eq!(ids(&manager.pairing_candidates()), vec!["remote"]);
        assert!(manager
            .context()
            .db
            .load_peer::<PeerRuntimeInfo>("remote")
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            manager.remove_handler("remote").await,
            Err(SyncError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_session_from_unknown_sender_is_tracked() {
        let (manager, _peer) = manager().await;
        let info = SyncInfo {
            instance_id: "newcomer".to_string(),
            device_name: "tablet".to_string(),
            app_version: "0.1.0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            platform: "linux".to_string(),
            port: 7300,
        };
        let remote: IpAddr = "192.168.4.7".parse().unwrap();
        manager.on_session_created("newcomer", &info, remote).await;

        let handler = manager.handler("newcomer").await.unwrap();
        let runtime = handler.info().await;
        assert_eq!(runtime.device_name, "tablet");
        assert_eq!(runtime.port, 7300);
        assert_eq!(runtime.hosts, vec![HostCandidate::new(remote, 32)]);

        manager.block("newcomer").await.unwrap();
        manager.on_session_created("newcomer", &info, remote).await;
        assert!(manager.handler("newcomer").await.is_none());
    }

    #[tokio::test]
    async fn test_discovery_update_reaches_handler() {
        let (manager, _peer) = manager().await;
        manager
            .handle_discovery_event(DiscoveryEvent::PeerDiscovered(record("remote")))
            .await;
        manager.add_peer("remote").await.unwrap();

        let mut moved = record("remote");
        moved.port = 9100;
        manager
            .handle_discovery_event(DiscoveryEvent::PeerUpdated(moved))
            .await;
        let handler = manager.handler("remote").await.unwrap();
        assert_eq!(handler.info().await.port, 9100);
    }
}
