//! Task handlers that pull resources from peers

use super::chunk::{
    ChunkPlan, ChunkProgress, ChunkSource, ChunkedPullCoordinator, FileChunkSink,
    DEFAULT_CHUNK_SIZE,
};
use super::{TaskContext, TaskHandler, TaskOutcome, TaskRecord};
use crate::storage::StorageError;
use crate::sync::protocol::PullFileRequest;
use crate::sync::{ClientError, ErrorCode, PeerClient, PeerTarget};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Resolves a tracked peer to a reachable address
#[async_trait]
pub trait PeerLocator: Send + Sync {
    async fn locate(&self, peer_id: &str) -> Option<PeerTarget>;
}

/// Per-resource mutual exclusion. Entries disappear once nobody holds or
/// waits on them.
#[derive(Clone, Default)]
pub struct ResourceLocks {
    entries: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held while a resource is being fetched
pub struct ResourceGuard {
    key: String,
    entries: Arc<DashMap<String, Arc<Mutex<()>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> ResourceGuard {
        let lock = self.entries.entry(key.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        ResourceGuard {
            key: key.to_string(),
            entries: self.entries.clone(),
            _guard: guard,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        // One reference in the table, one in our guard; more means waiters
        self.entries
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

fn outcome_for(e: &ClientError) -> TaskOutcome {
    match e {
        ClientError::Rejected {
            code: ErrorCode::NotFound,
            ..
        } => TaskOutcome::terminal(e.to_string()),
        _ => TaskOutcome::retryable(e.to_string()),
    }
}

fn encode<T: Serialize>(extra: &T) -> Option<Value> {
    serde_json::to_value(extra).ok()
}

fn finish(outcome: TaskOutcome, extra: Option<Value>) -> TaskOutcome {
    match extra {
        Some(extra) => outcome.with_extra(extra),
        None => outcome,
    }
}

/// Payload of a pull-icon task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullIconJob {
    pub peer_id: String,
    pub key: String,
    pub destination: PathBuf,
    /// Set when the icon was already present
    #[serde(default)]
    pub skipped: bool,
}

/// Fetches a small resource in one request, at most once per key
pub struct PullIconHandler {
    locator: Arc<dyn PeerLocator>,
    client: Arc<dyn PeerClient>,
    locks: ResourceLocks,
}

impl PullIconHandler {
    pub fn new(locator: Arc<dyn PeerLocator>, client: Arc<dyn PeerClient>) -> Self {
        Self {
            locator,
            client,
            locks: ResourceLocks::new(),
        }
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }
}

#[async_trait]
impl TaskHandler for PullIconHandler {
    async fn execute(&self, task: &TaskRecord, _ctx: &TaskContext) -> TaskOutcome {
        let mut request: PullIconJob = match serde_json::from_value(task.extra.clone()) {
            Ok(request) => request,
            Err(e) => return TaskOutcome::terminal(format!("invalid icon request: {}", e)),
        };

        let _guard = self.locks.lock(&request.key).await;
        if tokio::fs::try_exists(&request.destination)
            .await
            .unwrap_or(false)
        {
            debug!("Icon {} already present", request.key);
            request.skipped = true;
            return finish(TaskOutcome::success(), encode(&request));
        }

        let Some(target) = self.locator.locate(&request.peer_id).await else {
            return TaskOutcome::retryable(format!("{} is not reachable", request.peer_id));
        };
        let data = match self.client.pull_icon(&target, &request.key).await {
            Ok(data) => data,
            Err(e) => return outcome_for(&e),
        };
        if let Err(e) = write_atomic(&request.destination, &data).await {
            return TaskOutcome::retryable(format!("failed to store icon: {}", e));
        }

        info!("Pulled icon {} from {}", request.key, request.peer_id);
        request.skipped = false;
        finish(TaskOutcome::success(), encode(&request))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    tokio::fs::write(&partial, data).await?;
    tokio::fs::rename(&partial, path).await
}

/// Payload of a pull-file task; carries the resumable plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullFileJob {
    pub peer_id: String,
    pub resource_id: String,
    pub destination: PathBuf,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub plan: Option<ChunkPlan>,
    #[serde(default)]
    pub failed_chunks: Vec<u64>,
}

/// Chunk source backed by a peer's pull endpoint
struct PeerChunkSource {
    client: Arc<dyn PeerClient>,
    target: PeerTarget,
}

#[async_trait]
impl ChunkSource for PeerChunkSource {
    async fn fetch_chunk(
        &self,
        resource_id: &str,
        index: u64,
        chunk_size: u64,
    ) -> Result<Bytes, ClientError> {
        let request = PullFileRequest {
            resource_id: resource_id.to_string(),
            chunk_index: index,
            chunk_size,
        };
        self.client.pull_file(&self.target, &request).await
    }
}

/// Writes the plan back into the task payload
struct TaskProgress {
    ctx: TaskContext,
    request: PullFileJob,
}

#[async_trait]
impl ChunkProgress for TaskProgress {
    async fn save(&self, plan: &ChunkPlan) -> Result<(), StorageError> {
        let mut request = self.request.clone();
        request.plan = Some(plan.clone());
        let extra = serde_json::to_value(&request)?;
        self.ctx.save_extra(&extra).await
    }
}

/// Pulls a large resource in chunks, resuming from the saved plan
pub struct PullFileHandler {
    locator: Arc<dyn PeerLocator>,
    client: Arc<dyn PeerClient>,
    coordinator: ChunkedPullCoordinator,
    chunk_size: u64,
}

impl PullFileHandler {
    pub fn new(locator: Arc<dyn PeerLocator>, client: Arc<dyn PeerClient>) -> Self {
        Self {
            locator,
            client,
            coordinator: ChunkedPullCoordinator::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunking(mut self, chunk_size: u64, concurrency: usize) -> Self {
        self.chunk_size = chunk_size;
        self.coordinator = ChunkedPullCoordinator::new(concurrency);
        self
    }

    /// Saved plan if it still describes the resource, otherwise a fresh one
    fn plan_for(&self, request: &mut PullFileJob, size: u64) -> Result<ChunkPlan, String> {
        if let Some(plan) = request.plan.take() {
            if plan.validate().is_ok()
                && plan.resource_id == request.resource_id
                && plan.total_size == size
            {
                return Ok(plan);
            }
            debug!("Discarding stale plan for {}", request.resource_id);
        }
        ChunkPlan::new(request.resource_id.clone(), size, self.chunk_size).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TaskHandler for PullFileHandler {
    async fn execute(&self, task: &TaskRecord, ctx: &TaskContext) -> TaskOutcome {
        let mut request: PullFileJob = match serde_json::from_value(task.extra.clone()) {
            Ok(request) => request,
            Err(e) => return TaskOutcome::terminal(format!("invalid file request: {}", e)),
        };

        let Some(target) = self.locator.locate(&request.peer_id).await else {
            return TaskOutcome::retryable(format!("{} is not reachable", request.peer_id));
        };

        let size = match request.size {
            Some(size) => size,
            None => match self.client.stat_file(&target, &request.resource_id).await {
                Ok(stat) => stat.size,
                Err(e) => return outcome_for(&e),
            },
        };
        request.size = Some(size);

        let plan = match self.plan_for(&mut request, size) {
            Ok(plan) => plan,
            Err(e) => return TaskOutcome::terminal(e),
        };
        let sink = match FileChunkSink::open(&request.destination, size).await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                request.plan = Some(plan);
                return finish(
                    TaskOutcome::retryable(format!("cannot open destination: {}", e)),
                    encode(&request),
                );
            }
        };

        let source = Arc::new(PeerChunkSource {
            client: self.client.clone(),
            target,
        });
        let progress = Arc::new(TaskProgress {
            ctx: ctx.clone(),
            request: request.clone(),
        });

        match self.coordinator.run(plan, source, sink.clone(), progress).await {
            Ok(plan) => {
                if let Err(e) = sink.finish().await {
                    request.plan = Some(plan);
                    return finish(
                        TaskOutcome::retryable(format!("failed to flush: {}", e)),
                        encode(&request),
                    );
                }
                info!(
                    "Pulled {} ({} bytes) from {}",
                    request.resource_id, size, request.peer_id
                );
                request.plan = Some(plan);
                request.failed_chunks.clear();
                finish(TaskOutcome::success(), encode(&request))
            }
            Err(failure) => {
                let message = failure.to_string();
                request.failed_chunks = failure.failed;
                request.plan = Some(failure.plan);
                finish(TaskOutcome::retryable(message), encode(&request))
            }
        }
    }
}
