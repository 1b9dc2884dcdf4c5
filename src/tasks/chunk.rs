//! Resumable chunked downloads
//!
//! A [`ChunkPlan`] splits a remote resource into fixed-size ranges and keeps
//! a completion bitmap that travels in the task payload. The
//! [`ChunkedPullCoordinator`] fetches only the chunks still missing, with a
//! bounded number of workers sharing one queue.

use crate::storage::StorageError;
use crate::sync::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default size of one chunk
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of concurrent chunk workers
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Largest resource a plan accepts
pub const MAX_RESOURCE_SIZE: u64 = 1 << 40;

/// Upper bound on the completion bitmap
pub const MAX_CHUNK_COUNT: u64 = 1 << 20;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("CM030: Invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("chunk {index}: {source}")]
    Fetch {
        index: u64,
        #[source]
        source: ClientError,
    },

    #[error("chunk {index}: expected {expected} bytes, got {actual}")]
    Length { index: u64, expected: u64, actual: u64 },

    #[error("chunk {index}: write failed: {source}")]
    Write {
        index: u64,
        #[source]
        source: io::Error,
    },
}

/// Fixed-size ranges over a resource plus a completion bitmap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub resource_id: String,
    pub total_size: u64,
    pub chunk_size: u64,
    completed: Vec<bool>,
}

impl ChunkPlan {
    pub fn new(
        resource_id: impl Into<String>,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self, ChunkError> {
        let count = Self::count_for(total_size, chunk_size)?;
        Ok(Self {
            resource_id: resource_id.into(),
            total_size,
            chunk_size,
            completed: vec![false; count],
        })
    }

    /// Number of chunks, refusing sizes the bitmap cannot hold
    fn count_for(total_size: u64, chunk_size: u64) -> Result<usize, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidPlan("chunk size must be positive".into()));
        }
        if total_size > MAX_RESOURCE_SIZE {
            return Err(ChunkError::InvalidPlan(format!(
                "resource of {} bytes exceeds the {} byte limit",
                total_size, MAX_RESOURCE_SIZE
            )));
        }
        let count = total_size.div_ceil(chunk_size);
        if count > MAX_CHUNK_COUNT {
            return Err(ChunkError::InvalidPlan(format!(
                "{} chunks exceed the limit of {}",
                count, MAX_CHUNK_COUNT
            )));
        }
        usize::try_from(count)
            .map_err(|_| ChunkError::InvalidPlan(format!("{} chunks do not fit in memory", count)))
    }

    /// Check a plan loaded from a task payload
    pub fn validate(&self) -> Result<(), ChunkError> {
        let expected = Self::count_for(self.total_size, self.chunk_size)?;
        if self.completed.len() != expected {
            return Err(ChunkError::InvalidPlan(format!(
                "bitmap has {} entries for {} chunks",
                self.completed.len(),
                expected
            )));
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> u64 {
        self.completed.len() as u64
    }

    /// Offset and length of a chunk; the last one may be short
    pub fn range(&self, index: u64) -> Option<(u64, u64)> {
        if index >= self.chunk_count() {
            return None;
        }
        let offset = index * self.chunk_size;
        Some((offset, self.chunk_size.min(self.total_size - offset)))
    }

    pub fn is_complete(&self, index: u64) -> bool {
        self.completed.get(index as usize).copied().unwrap_or(false)
    }

    /// Mark a chunk done. Returns true only the first time.
    pub fn mark_complete(&mut self, index: u64) -> bool {
        match self.completed.get_mut(index as usize) {
            Some(done) if !*done => {
                *done = true;
                true
            }
            _ => false,
        }
    }

    pub fn incomplete(&self) -> Vec<u64> {
        (0..self.chunk_count())
            .filter(|&i| !self.is_complete(i))
            .collect()
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.iter().filter(|&&done| done).count() as u64
    }

    pub fn is_finished(&self) -> bool {
        self.completed.iter().all(|&done| done)
    }
}

/// Where chunks come from
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_chunk(
        &self,
        resource_id: &str,
        index: u64,
        chunk_size: u64,
    ) -> Result<Bytes, ClientError>;
}

/// Where chunks go
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn write_chunk(&self, offset: u64, data: &[u8]) -> io::Result<()>;
}

/// Persists the plan after every completed chunk
#[async_trait]
pub trait ChunkProgress: Send + Sync {
    async fn save(&self, plan: &ChunkPlan) -> Result<(), StorageError>;
}

/// Writes chunks at their offsets in a preallocated file
pub struct FileChunkSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileChunkSink {
    /// Open without truncating so earlier chunks survive a resume
    pub async fn open(path: &Path, total_size: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await?;
        file.set_len(total_size).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn finish(&self) -> io::Result<()> {
        self.file.lock().await.sync_all().await
    }
}

#[async_trait]
impl ChunkSink for FileChunkSink {
    async fn write_chunk(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }
}

/// Some chunks could not be pulled
#[derive(Debug, Error)]
#[error("{} of {} chunk(s) failed for {}", .failed.len(), .plan.chunk_count(), .plan.resource_id)]
pub struct PullFailure {
    /// Plan including every chunk that did complete
    pub plan: ChunkPlan,
    pub failed: Vec<u64>,
    pub errors: Vec<ChunkError>,
}

struct Shared {
    resource_id: String,
    chunk_size: u64,
    plan: Mutex<ChunkPlan>,
    queue: std::sync::Mutex<VecDeque<u64>>,
    errors: Mutex<Vec<ChunkError>>,
}

impl Shared {
    fn next(&self) -> Option<u64> {
        self.queue.lock().ok().and_then(|mut queue| queue.pop_front())
    }
}

/// Pulls the missing chunks of a plan with a bounded worker pool
#[derive(Debug, Clone, Copy)]
pub struct ChunkedPullCoordinator {
    concurrency: usize,
}

impl Default for ChunkedPullCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl ChunkedPullCoordinator {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        plan: ChunkPlan,
        source: Arc<dyn ChunkSource>,
        sink: Arc<dyn ChunkSink>,
        progress: Arc<dyn ChunkProgress>,
    ) -> Result<ChunkPlan, PullFailure> {
        let pending: VecDeque<u64> = plan.incomplete().into();
        if pending.is_empty() {
            return Ok(plan);
        }
        debug!(
            "Pulling {} of {} chunk(s) of {}",
            pending.len(),
            plan.chunk_count(),
            plan.resource_id
        );

        let workers = self.concurrency.min(pending.len());
        let shared = Arc::new(Shared {
            resource_id: plan.resource_id.clone(),
            chunk_size: plan.chunk_size,
            plan: Mutex::new(plan),
            queue: std::sync::Mutex::new(pending),
            errors: Mutex::new(Vec::new()),
        });

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(worker(
                shared.clone(),
                source.clone(),
                sink.clone(),
                progress.clone(),
            ));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!("Chunk worker aborted: {}", e);
            }
        }

        let plan = shared.plan.lock().await.clone();
        if plan.is_finished() {
            return Ok(plan);
        }
        let errors = std::mem::take(&mut *shared.errors.lock().await);
        Err(PullFailure {
            failed: plan.incomplete(),
            errors,
            plan,
        })
    }
}

async fn worker(
    shared: Arc<Shared>,
    source: Arc<dyn ChunkSource>,
    sink: Arc<dyn ChunkSink>,
    progress: Arc<dyn ChunkProgress>,
) {
    while let Some(index) = shared.next() {
        if let Err(e) = pull_chunk(&shared, index, &*source, &*sink, &*progress).await {
            warn!("Pull of {} failed: {}", shared.resource_id, e);
            shared.errors.lock().await.push(e);
        }
    }
}

async fn pull_chunk(
    shared: &Shared,
    index: u64,
    source: &dyn ChunkSource,
    sink: &dyn ChunkSink,
    progress: &dyn ChunkProgress,
) -> Result<(), ChunkError> {
    let range = shared.plan.lock().await.range(index);
    let (offset, expected) = range.ok_or_else(|| {
        ChunkError::InvalidPlan(format!("chunk {} is out of range", index))
    })?;

    let data = source
        .fetch_chunk(&shared.resource_id, index, shared.chunk_size)
        .await
        .map_err(|source| ChunkError::Fetch { index, source })?;
    if data.len() as u64 != expected {
        return Err(ChunkError::Length {
            index,
            expected,
            actual: data.len() as u64,
        });
    }
    sink.write_chunk(offset, &data)
        .await
        .map_err(|source| ChunkError::Write { index, source })?;

    let mut plan = shared.plan.lock().await;
    if plan.mark_complete(index) {
        if let Err(e) = progress.save(&plan).await {
            // The chunk is still on disk; a resume would only fetch it again
            warn!("Failed to save progress of {}: {}", plan.resource_id, e);
        }
    }
    Ok(())
}
