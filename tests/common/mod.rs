//! Two real nodes on loopback, wired together without mDNS

#![allow(dead_code)]

use std::time::Duration;

use anyhow::{anyhow, Result};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use clipmesh::config::Config;
use clipmesh::discovery::{DiscoveryEvent, PeerRecord};
use clipmesh::storage::SecretBackend;
use clipmesh::sync::{ConnectionState, SyncEvent, PROTOCOL_VERSION};
use clipmesh::tasks::{TaskEvent, TaskStatus};
use clipmesh::Node;

pub const WAIT: Duration = Duration::from_secs(15);

pub struct TestNode {
    pub node: Node,
    pub dir: TempDir,
}

impl TestNode {
    pub async fn start(id: &str) -> Result<Self> {
        let dir = TempDir::new()?;
        let root = dir.path();
        let mut config = Config::default();
        config.instance_id = Some(id.to_string());
        config.device_name = format!("device-{}", id);
        config.listen_port = 0;
        config.data_dir = root.join("data");
        config.sync.base_refresh_secs = 5;
        config.sync.shared_dir = root.join("shared");
        config.sync.icon_dir = root.join("icons");
        config.tasks.download_dir = root.join("downloads");
        config.tasks.chunk_size = 64 * 1024;
        config.secret.backend = SecretBackend::Memory;
        config.discovery.enabled = false;

        for dir in [&config.sync.shared_dir, &config.sync.icon_dir] {
            std::fs::create_dir_all(dir)?;
        }

        let node = Node::start(config).await?;
        Ok(Self { node, dir })
    }

    /// What this node would announce over mDNS
    pub fn record(&self) -> PeerRecord {
        let local = self.node.local_info();
        PeerRecord {
            instance_id: local.instance_id.clone(),
            device_name: local.device_name.clone(),
            app_version: local.app_version.clone(),
            protocol_version: PROTOCOL_VERSION,
            platform: local.platform.clone(),
            hosts: vec!["127.0.0.1/8".parse().expect("valid host")],
            port: self.node.local_addr().port(),
        }
    }

    /// Make `other` a pairing candidate of this node
    pub async fn discover(&self, other: &TestNode) {
        self.node
            .manager()
            .handle_discovery_event(DiscoveryEvent::PeerDiscovered(other.record()))
            .await;
    }

    /// Trust each other's identity without the token exchange
    pub async fn trust_mutually(&self, other: &TestNode) -> Result<()> {
        let ours = self.node.channel().store().identity().await?.public();
        let theirs = other.node.channel().store().identity().await?.public();
        self.node
            .channel()
            .store()
            .trust_identity(other.node.instance_id(), &theirs)
            .await?;
        other
            .node
            .channel()
            .store()
            .trust_identity(self.node.instance_id(), &ours)
            .await?;
        Ok(())
    }

    pub async fn state_of(&self, peer_id: &str) -> Option<ConnectionState> {
        match self.node.manager().handler(peer_id).await {
            Some(handler) => Some(handler.state().await),
            None => None,
        }
    }
}

/// Collect the states of `peer_id` until `target` shows up
pub async fn states_until(
    rx: &mut broadcast::Receiver<SyncEvent>,
    peer_id: &str,
    target: ConnectionState,
) -> Result<Vec<ConnectionState>> {
    let mut seen = Vec::new();
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::StateChanged { peer_id: id, state }) if id == peer_id => {
                    seen.push(state);
                    if state == target {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => return Err(anyhow!("event stream closed: {}", e)),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("{} never reached {:?}, saw {:?}", peer_id, target, seen))??;
    Ok(seen)
}

/// Wait for the token a peer asked this node to display
pub async fn next_token(rx: &mut broadcast::Receiver<SyncEvent>, requested_by: &str) -> Result<String> {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::ShowToken { requested_by: id, token }) if id == requested_by => {
                    return Ok(token);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => return Err(anyhow!("event stream closed: {}", e)),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no token shown for {}", requested_by))?
}

/// Wait for a task to reach a final status
pub async fn task_finished(
    rx: &mut broadcast::Receiver<TaskEvent>,
    task_id: &str,
) -> Result<(TaskStatus, Option<String>)> {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(TaskEvent::Finished {
                    task_id: id,
                    status,
                    error,
                    ..
                }) if id == task_id => return Ok((status, error)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => return Err(anyhow!("task events closed: {}", e)),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("task {} never finished", task_id))?
}

/// Two nodes that trust each other, with `a` tracking `b` and both connected
pub async fn connected_pair() -> Result<(TestNode, TestNode)> {
    let a = TestNode::start("node-a").await?;
    let b = TestNode::start("node-b").await?;
    a.trust_mutually(&b).await?;
    a.discover(&b).await;

    let mut a_events = a.node.subscribe();
    let mut b_events = b.node.subscribe();
    a.node.manager().add_peer("node-b").await?;
    states_until(&mut a_events, "node-b", ConnectionState::Connected).await?;
    states_until(&mut b_events, "node-a", ConnectionState::Connected).await?;
    Ok((a, b))
}
