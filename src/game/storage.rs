//! World Storage
//!
//! The persistence collaborator. The engine only talks to the
//! [`WorldStorage`] trait; the on-disk format belongs to the implementation.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStorage`]: in-process map with optional latency and failure
//!   injection, used by tests and benchmarks.
//! - [`DirectoryStorage`]: one JSON metadata file plus one bincode file per
//!   chunk, used by the server binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::debug;

use crate::core::point::ChunkIndex;
use crate::game::chunk::ChunkSnapshot;

/// Identity of one world, loaded and saved once per map lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapMetadata {
    /// Who created the world
    pub creator: String,
    /// When it was created
    pub created_at: DateTime<Utc>,
}

impl MapMetadata {
    /// Fresh metadata stamped with the current time.
    pub fn new(creator: impl Into<String>) -> Self {
        Self {
            creator: creator.into(),
            created_at: Utc::now(),
        }
    }
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Stored bytes could not be decoded.
    #[error("corrupt record {what}: {reason}")]
    Corrupt {
        /// Which record
        what: String,
        /// Decoder message
        reason: String,
    },

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence interface consumed by the chunk loader and the map.
pub trait WorldStorage: Send + Sync {
    /// Stored chunk at `index`, or `None` if nothing was ever saved there.
    fn load_chunk(&self, index: ChunkIndex) -> BoxFuture<'_, Result<Option<ChunkSnapshot>, StorageError>>;

    /// Persist one chunk, replacing any previous copy.
    fn save_chunk(&self, chunk: ChunkSnapshot) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Remove a stored chunk. Missing chunks are not an error.
    fn delete_chunk(&self, index: ChunkIndex) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Stored world metadata, if any.
    fn load_metadata(&self) -> BoxFuture<'_, Result<Option<MapMetadata>, StorageError>>;

    /// Persist world metadata.
    fn save_metadata(&self, metadata: MapMetadata) -> BoxFuture<'_, Result<(), StorageError>>;
}

// =============================================================================
// MEMORY STORAGE
// =============================================================================

/// In-memory storage.
#[derive(Default)]
pub struct MemoryStorage {
    chunks: Mutex<BTreeMap<ChunkIndex, ChunkSnapshot>>,
    metadata: Mutex<Option<MapMetadata>>,
    latency: Option<Duration>,
    save_latency: Option<Duration>,
    chunk_loads: AtomicUsize,
    chunk_saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStorage {
    /// Empty storage with no latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty storage that sleeps `latency` before every chunk read.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Sleep `latency` before every chunk write as well.
    pub fn with_save_latency(mut self, latency: Duration) -> Self {
        self.save_latency = Some(latency);
        self
    }

    /// Seed a chunk without counting it as a save.
    pub fn insert(&self, chunk: ChunkSnapshot) {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chunk.index, chunk);
    }

    /// Stored copy of a chunk.
    pub fn stored(&self, index: ChunkIndex) -> Option<ChunkSnapshot> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned()
    }

    /// Number of chunk reads served so far.
    pub fn chunk_loads(&self) -> usize {
        self.chunk_loads.load(Ordering::SeqCst)
    }

    /// Number of chunk writes accepted so far.
    pub fn chunk_saves(&self) -> usize {
        self.chunk_saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with `Unavailable` (or stop failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage set to fail".into()));
        }
        Ok(())
    }
}

impl WorldStorage for MemoryStorage {
    fn load_chunk(&self, index: ChunkIndex) -> BoxFuture<'_, Result<Option<ChunkSnapshot>, StorageError>> {
        Box::pin(async move {
            self.chunk_loads.fetch_add(1, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.check_available()?;
            Ok(self.stored(index))
        })
    }

    fn save_chunk(&self, chunk: ChunkSnapshot) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            if let Some(latency) = self.save_latency {
                tokio::time::sleep(latency).await;
            }
            self.check_available()?;
            self.chunk_saves.fetch_add(1, Ordering::SeqCst);
            self.insert(chunk);
            Ok(())
        })
    }

    fn delete_chunk(&self, index: ChunkIndex) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            self.chunks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&index);
            Ok(())
        })
    }

    fn load_metadata(&self) -> BoxFuture<'_, Result<Option<MapMetadata>, StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.metadata.lock().unwrap_or_else(PoisonError::into_inner).clone())
        })
    }

    fn save_metadata(&self, metadata: MapMetadata) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            *self.metadata.lock().unwrap_or_else(PoisonError::into_inner) = Some(metadata);
            Ok(())
        })
    }
}

// =============================================================================
// DIRECTORY STORAGE
// =============================================================================

const METADATA_FILE: &str = "world.json";
const CHUNK_DIR: &str = "chunks";

/// Filesystem storage rooted at one directory.
///
/// ```text
/// <root>/world.json
/// <root>/chunks/<x>_<y>.chunk
/// ```
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    /// Storage rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, index: ChunkIndex) -> PathBuf {
        self.root.join(CHUNK_DIR).join(format!("{}_{}.chunk", index.x, index.y))
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write via a temporary file so a crash never leaves a half-written record.
async fn write_replace(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl WorldStorage for DirectoryStorage {
    fn load_chunk(&self, index: ChunkIndex) -> BoxFuture<'_, Result<Option<ChunkSnapshot>, StorageError>> {
        Box::pin(async move {
            let path = self.chunk_path(index);
            let Some(bytes) = read_optional(&path).await? else {
                return Ok(None);
            };
            let snapshot: ChunkSnapshot = bincode::deserialize(&bytes).map_err(|e| StorageError::Corrupt {
                what: path.display().to_string(),
                reason: e.to_string(),
            })?;
            debug!(chunk = %index, bytes = bytes.len(), "Read chunk file");
            Ok(Some(snapshot))
        })
    }

    fn save_chunk(&self, chunk: ChunkSnapshot) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.chunk_path(chunk.index);
            let bytes = bincode::serialize(&chunk).map_err(|e| StorageError::Corrupt {
                what: path.display().to_string(),
                reason: e.to_string(),
            })?;
            write_replace(&path, &bytes).await?;
            debug!(chunk = %chunk.index, bytes = bytes.len(), "Wrote chunk file");
            Ok(())
        })
    }

    fn delete_chunk(&self, index: ChunkIndex) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.chunk_path(index)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn load_metadata(&self) -> BoxFuture<'_, Result<Option<MapMetadata>, StorageError>> {
        Box::pin(async move {
            let path = self.metadata_path();
            let Some(bytes) = read_optional(&path).await? else {
                return Ok(None);
            };
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupt {
                    what: path.display().to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn save_metadata(&self, metadata: MapMetadata) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.metadata_path();
            let bytes = serde_json::to_vec_pretty(&metadata).map_err(|e| StorageError::Corrupt {
                what: path.display().to_string(),
                reason: e.to_string(),
            })?;
            write_replace(&path, &bytes).await
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
