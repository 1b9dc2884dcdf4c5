//! A running ClipMesh instance
//!
//! Opens the database and key material, binds the peer API, restores
//! tracked peers, starts the task executor and, when enabled, mDNS
//! discovery.

use crate::config::Config;
use crate::discovery::{self, Discovery, MdnsDiscovery, PeerRecord, PeerRegistry};
use crate::session::{SecureChannel, SecureSessionStore};
use crate::storage::Database;
use crate::sync::{
    FsResourceProvider, HttpPeerClient, PeerClient, SyncContext, SyncEvent, SyncInfo,
    SyncManager, SyncServer, TokenService, PROTOCOL_VERSION,
};
use crate::tasks::pull::{PullFileJob, PullIconJob};
use crate::tasks::{
    PeerLocator, PullFileHandler, PullIconHandler, TaskExecutor, TaskHandler, TaskType,
};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Keyring account holding the master key
const SECRET_ACCOUNT: &str = "clipmesh";

pub struct Node {
    config: Config,
    local: SyncInfo,
    local_addr: SocketAddr,
    channel: Arc<SecureChannel>,
    manager: SyncManager,
    executor: TaskExecutor,
    events: broadcast::Sender<SyncEvent>,
    discovery: Mutex<Option<MdnsDiscovery>>,
    server: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    shutdown: CancellationToken,
}

impl Node {
    pub async fn start(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

        let db = Arc::new(
            Database::open(&config.database_path())
                .await
                .context("Failed to open database")?,
        );
        let instance_id = match &config.instance_id {
            Some(id) => id.clone(),
            None => db.instance_id().await?,
        };

        let secrets = config
            .secret
            .backend
            .build(&config.data_dir, SECRET_ACCOUNT)?;
        let store = SecureSessionStore::new(db.clone(), secrets.as_ref())?;
        let channel = Arc::new(SecureChannel::new(Arc::new(store)));

        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .with_context(|| format!("Failed to bind port {}", config.listen_port))?;
        let local_addr = listener.local_addr()?;

        let local = SyncInfo {
            instance_id: instance_id.clone(),
            device_name: config.device_name.clone(),
            app_version: crate::VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            platform: std::env::consts::OS.to_string(),
            port: local_addr.port(),
        };
        let local_hosts = discovery::local_host_candidates().unwrap_or_else(|e| {
            warn!("Could not list network interfaces: {}", e);
            Vec::new()
        });

        let client: Arc<dyn PeerClient> =
            Arc::new(HttpPeerClient::new(&instance_id, config.client_timeouts())?);
        let (events, _) = broadcast::channel(256);
        let manager = SyncManager::new(Arc::new(SyncContext {
            local: local.clone(),
            local_hosts: local_hosts.clone(),
            channel: channel.clone(),
            client: client.clone(),
            db: db.clone(),
            events: events.clone(),
            settings: config.sync_settings(),
        }));
        manager.start().await?;

        let tokens = Arc::new(TokenService::new(events.clone()));
        let resources = Arc::new(FsResourceProvider::new(
            config.sync.shared_dir.clone(),
            config.sync.icon_dir.clone(),
        ));
        let server = SyncServer::new(
            &instance_id,
            channel.clone(),
            tokens,
            Arc::new(manager.clone()),
            resources,
        );
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server.serve(listener, shutdown.clone()));

        let locator: Arc<dyn PeerLocator> = Arc::new(manager.clone());
        let mut handlers: HashMap<TaskType, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(
            TaskType::PullFile,
            Arc::new(
                PullFileHandler::new(locator.clone(), client.clone())
                    .with_chunking(config.tasks.chunk_size, config.tasks.concurrency),
            ),
        );
        handlers.insert(
            TaskType::PullIcon,
            Arc::new(PullIconHandler::new(locator, client)),
        );
        let executor = TaskExecutor::start(db, config.retry_policy(), handlers).await?;

        let discovery = if config.discovery.enabled {
            let (registry, discovered) = PeerRegistry::new(&instance_id);
            let record = PeerRecord {
                instance_id: instance_id.clone(),
                device_name: local.device_name.clone(),
                app_version: local.app_version.clone(),
                protocol_version: PROTOCOL_VERSION,
                platform: local.platform.clone(),
                hosts: local_hosts,
                port: local.port,
            };
            let mut mdns = MdnsDiscovery::new(record, registry);
            match mdns.start().await {
                Ok(()) => {
                    manager.spawn_discovery(discovered);
                    Some(mdns)
                }
                Err(e) => {
                    warn!("mDNS discovery unavailable: {}", e);
                    None
                }
            }
        } else {
            info!("Discovery disabled");
            None
        };

        info!(
            "ClipMesh {} ({}) listening on {}",
            instance_id, local.device_name, local_addr
        );
        Ok(Self {
            config,
            local,
            local_addr,
            channel,
            manager,
            executor,
            events,
            discovery: Mutex::new(discovery),
            server: Mutex::new(Some(server)),
            shutdown,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.local.instance_id
    }

    pub fn local_info(&self) -> &SyncInfo {
        &self.local
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channel(&self) -> &Arc<SecureChannel> {
        &self.channel
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Queue a pull of a peer's icon into the icon directory
    pub async fn pull_icon(&self, peer_id: &str, key: &str) -> Result<String> {
        let job = PullIconJob {
            peer_id: peer_id.to_string(),
            key: key.to_string(),
            destination: local_destination(&self.config.sync.icon_dir, key)?,
            skipped: false,
        };
        let task_id = self
            .executor
            .submit(TaskType::PullIcon, serde_json::to_value(&job)?)
            .await?;
        Ok(task_id)
    }

    /// Queue a chunked pull of a peer's shared file into the download directory
    pub async fn pull_file(&self, peer_id: &str, resource_id: &str) -> Result<String> {
        let job = PullFileJob {
            peer_id: peer_id.to_string(),
            resource_id: resource_id.to_string(),
            destination: local_destination(&self.config.tasks.download_dir, resource_id)?,
            size: None,
            plan: None,
            failed_chunks: Vec::new(),
        };
        let task_id = self
            .executor
            .submit(TaskType::PullFile, serde_json::to_value(&job)?)
            .await?;
        Ok(task_id)
    }

    /// Notify peers, stop every loop and wait for the server to close
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.executor.shutdown();

        if let Some(mut mdns) = self.discovery.lock().await.take() {
            if let Err(e) = mdns.stop().await {
                warn!("Failed to stop discovery: {}", e);
            }
        }

        self.shutdown.cancel();
        if let Some(server) = self.server.lock().await.take() {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Sync server stopped with error: {}", e),
                Err(e) => warn!("Sync server task failed: {}", e),
            }
        }
        info!("ClipMesh stopped");
    }
}

/// Resource names become plain file names inside `dir`
fn local_destination(dir: &Path, name: &str) -> Result<PathBuf> {
    let file_name = Path::new(name)
        .file_name()
        .filter(|f| f.to_str() == Some(name))
        .ok_or_else(|| anyhow!("'{}' is not a plain file name", name))?;
    Ok(dir.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_destination() {
        let dir = Path::new("/downloads");
        assert_eq!(
            local_destination(dir, "report.pdf").unwrap(),
            PathBuf::from("/downloads/report.pdf")
        );
        assert!(local_destination(dir, "../etc/passwd").is_err());
        assert!(local_destination(dir, "a/b").is_err());
        assert!(local_destination(dir, "..").is_err());
    }
}
