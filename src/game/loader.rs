//! Chunk Loader
//!
//! Owns every chunk in memory and mediates loads and unloads against the
//! storage collaborator.
//!
//! ## Lifecycle
//!
//! ```text
//!   acquire ──► [loading] ──storage read──► [loaded] ──unload (refs = 0)──► [flushing] ──► gone
//!                  │                           ▲                                 │
//!                  └── unload: cancelled       └── acquire during flush waits ───┘
//! ```
//!
//! An index is in at most one of `loaded` / `loading` at any instant.
//! Concurrent acquires of the same index share a single storage read and
//! receive the same `Arc`. Every successful acquire adds one reference;
//! every unload removes one.
//!
//! The state lock is a plain mutex that is never held across an await.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::point::ChunkIndex;
use crate::game::chunk::Chunk;
use crate::game::storage::WorldStorage;

/// A loaded chunk, shared between the loader, the map and transactions.
pub type SharedChunk = Arc<RwLock<Chunk>>;

/// Chunk lifecycle failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// An unload arrived while the load was in flight.
    #[error("load of chunk {0} was cancelled")]
    Cancelled(ChunkIndex),

    /// The index has no tiles on the `i32` grid.
    #[error("chunk {0} lies outside the world")]
    OutOfWorld(ChunkIndex),

    /// Storage failed or returned something unusable.
    #[error("storage failure for chunk {index}: {reason}")]
    Storage {
        /// Chunk involved
        index: ChunkIndex,
        /// Underlying error message
        reason: String,
    },
}

/// Result of an unload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// A load was in flight and has been cancelled.
    Cancelled,
    /// Reference dropped; other holders remain.
    Released {
        /// References still held
        remaining: usize,
    },
    /// Last reference dropped (or forced); the chunk was flushed and evicted.
    Evicted,
    /// Nothing was loaded or loading at that index.
    NotResident,
}

/// Notified when chunks enter and leave the loaded set.
///
/// Called with the loader's state lock held, so implementations must not
/// call back into the loader.
pub trait ChunkObserver: Send + Sync {
    /// A chunk became loaded.
    fn chunk_attached(&self, chunk: &SharedChunk);
    /// A chunk is being evicted.
    fn chunk_detached(&self, chunk: &SharedChunk);
}

#[derive(Clone)]
enum LoadState {
    Pending,
    Ready(SharedChunk),
    Failed(String),
    Cancelled,
}

struct Resident {
    chunk: SharedChunk,
    refs: usize,
}

struct InFlight {
    generation: u64,
    refs: usize,
    state: watch::Sender<LoadState>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct LoaderState {
    loaded: BTreeMap<ChunkIndex, Resident>,
    loading: BTreeMap<ChunkIndex, InFlight>,
    flushing: BTreeMap<ChunkIndex, watch::Receiver<bool>>,
    next_generation: u64,
}

struct LoaderInner {
    storage: Arc<dyn WorldStorage>,
    state: Mutex<LoaderState>,
    observer: Option<Arc<dyn ChunkObserver>>,
    /// Serialises storage writes so a later snapshot never lands before an earlier one.
    write_gate: tokio::sync::Mutex<()>,
}

impl LoaderInner {
    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, chunk: &SharedChunk) {
        chunk.write().unwrap_or_else(PoisonError::into_inner).set_attached(true);
        if let Some(observer) = &self.observer {
            observer.chunk_attached(chunk);
        }
    }

    fn detach(&self, chunk: &SharedChunk) {
        if let Some(observer) = &self.observer {
            observer.chunk_detached(chunk);
        }
        chunk.write().unwrap_or_else(PoisonError::into_inner).set_attached(false);
    }
}

enum Next {
    Wait(watch::Receiver<LoadState>),
    WaitFlush(watch::Receiver<bool>),
}

/// Deduplicating, reference-counting chunk loader.
#[derive(Clone)]
pub struct ChunkLoader {
    inner: Arc<LoaderInner>,
}

impl ChunkLoader {
    /// Loader without an observer.
    pub fn new(storage: Arc<dyn WorldStorage>) -> Self {
        Self::build(storage, None)
    }

    /// Loader that reports attach / detach to `observer`.
    pub fn with_observer(storage: Arc<dyn WorldStorage>, observer: Arc<dyn ChunkObserver>) -> Self {
        Self::build(storage, Some(observer))
    }

    fn build(storage: Arc<dyn WorldStorage>, observer: Option<Arc<dyn ChunkObserver>>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                storage,
                state: Mutex::new(LoaderState::default()),
                observer,
                write_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Storage this loader reads from.
    pub fn storage(&self) -> &Arc<dyn WorldStorage> {
        &self.inner.storage
    }

    /// Get a chunk, loading it if needed, and take one reference on it.
    ///
    /// Joins an in-flight load for the same index instead of starting a
    /// second one. If storage has nothing for `index`, an empty chunk is
    /// synthesized. Fails with [`LoadError::Cancelled`] if the load is
    /// cancelled by an unload, or [`LoadError::Storage`] if storage fails;
    /// either way the index is left free for a later attempt. Indices off
    /// the `i32` grid fail with [`LoadError::OutOfWorld`].
    pub async fn acquire(&self, index: ChunkIndex) -> Result<SharedChunk, LoadError> {
        if !index.in_world() {
            return Err(LoadError::OutOfWorld(index));
        }
        loop {
            let next = {
                let mut state = self.inner.lock();
                if let Some(resident) = state.loaded.get_mut(&index) {
                    resident.refs += 1;
                    return Ok(resident.chunk.clone());
                }
                if let Some(flight) = state.loading.get_mut(&index) {
                    flight.refs += 1;
                    Next::Wait(flight.state.subscribe())
                } else if let Some(flush) = state.flushing.get(&index) {
                    Next::WaitFlush(flush.clone())
                } else {
                    Next::Wait(self.start_load(&mut state, index))
                }
            };

            match next {
                Next::WaitFlush(mut done) => {
                    if done.wait_for(|flushed| *flushed).await.is_err() {
                        // Flush task died without reporting; drop its marker.
                        self.inner.lock().flushing.remove(&index);
                    }
                }
                Next::Wait(mut rx) => {
                    let settled = match rx.wait_for(|s| !matches!(s, LoadState::Pending)).await {
                        Ok(state) => state.clone(),
                        Err(_) => LoadState::Cancelled,
                    };
                    return match settled {
                        LoadState::Ready(chunk) => Ok(chunk),
                        LoadState::Failed(reason) => Err(LoadError::Storage { index, reason }),
                        LoadState::Cancelled | LoadState::Pending => Err(LoadError::Cancelled(index)),
                    };
                }
            }
        }
    }

    fn start_load(&self, state: &mut LoaderState, index: ChunkIndex) -> watch::Receiver<LoadState> {
        let generation = state.next_generation;
        state.next_generation += 1;

        let (tx, rx) = watch::channel(LoadState::Pending);
        let inner = self.inner.clone();
        let task = tokio::spawn(run_load(inner, index, generation));

        debug!(chunk = %index, generation, "Starting chunk load");
        state.loading.insert(index, InFlight {
            generation,
            refs: 1,
            state: tx,
            task,
        });
        rx
    }

    /// Drop one reference on a chunk.
    ///
    /// At zero references (or with `force`) the chunk is detached, written
    /// back if dirty, and evicted. If the chunk is still loading, the load
    /// is cancelled instead and every waiter receives `Cancelled`.
    pub async fn unload(&self, index: ChunkIndex, force: bool) -> Result<UnloadOutcome, LoadError> {
        let evicted = {
            let mut state = self.inner.lock();

            if let Some(flight) = state.loading.remove(&index) {
                flight.task.abort();
                let _ = flight.state.send(LoadState::Cancelled);
                info!(chunk = %index, waiters = flight.refs, "Cancelled in-flight chunk load");
                return Ok(UnloadOutcome::Cancelled);
            }

            let Some(resident) = state.loaded.get_mut(&index) else {
                return Ok(UnloadOutcome::NotResident);
            };
            resident.refs = resident.refs.saturating_sub(1);
            if resident.refs > 0 && !force {
                return Ok(UnloadOutcome::Released { remaining: resident.refs });
            }

            let Some(resident) = state.loaded.remove(&index) else {
                return Ok(UnloadOutcome::NotResident);
            };
            self.inner.detach(&resident.chunk);

            let dirty = resident.chunk.read().unwrap_or_else(PoisonError::into_inner).is_dirty();
            if dirty {
                let (tx, rx) = watch::channel(false);
                state.flushing.insert(index, rx);
                Some((resident.chunk, tx))
            } else {
                None
            }
        };

        let Some((chunk, done)) = evicted else {
            debug!(chunk = %index, force, "Evicted clean chunk");
            return Ok(UnloadOutcome::Evicted);
        };

        // The flush runs detached so that dropping this future cannot strand
        // waiters on the flushing marker.
        let inner = self.inner.clone();
        let flush = tokio::spawn(async move {
            let result = flush_evicted(&inner, index, &chunk).await;
            let mut state = inner.lock();
            if result.is_err() && !state.loaded.contains_key(&index) && !state.loading.contains_key(&index) {
                // Keep the unsaved content rather than dropping it.
                inner.attach(&chunk);
                state.loaded.insert(index, Resident { chunk, refs: 0 });
            }
            state.flushing.remove(&index);
            let _ = done.send(true);
            result
        });

        match flush.await {
            Ok(Ok(())) => {
                debug!(chunk = %index, force, "Flushed and evicted chunk");
                Ok(UnloadOutcome::Evicted)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(LoadError::Storage {
                index,
                reason: format!("flush task failed: {e}"),
            }),
        }
    }

    /// Write every dirty loaded chunk back to storage.
    ///
    /// Returns how many chunks were written. A chunk modified again while
    /// its write was in progress stays dirty. Stops at the first failure.
    pub async fn save_changes(&self) -> Result<usize, LoadError> {
        let candidates: Vec<(ChunkIndex, SharedChunk)> = {
            let state = self.inner.lock();
            state
                .loaded
                .iter()
                .filter(|(_, r)| r.chunk.read().unwrap_or_else(PoisonError::into_inner).is_dirty())
                .map(|(index, r)| (*index, r.chunk.clone()))
                .collect()
        };

        let mut saved = 0;
        for (index, chunk) in candidates {
            let _gate = self.inner.write_gate.lock().await;
            let (snapshot, revision, fingerprint) = {
                let chunk = chunk.read().unwrap_or_else(PoisonError::into_inner);
                if !chunk.is_dirty() {
                    continue;
                }
                (chunk.snapshot(), chunk.revision(), chunk.content_hash())
            };
            self.inner
                .storage
                .save_chunk(snapshot)
                .await
                .map_err(|e| LoadError::Storage { index, reason: e.to_string() })?;
            chunk.write().unwrap_or_else(PoisonError::into_inner).mark_saved(revision);
            debug!(chunk = %index, revision, hash = %fingerprint.short(), "Saved chunk");
            saved += 1;
        }

        if saved > 0 {
            info!(chunks = saved, "Saved changed chunks");
        }
        Ok(saved)
    }

    /// Loaded chunk at `index`, without loading or taking a reference.
    pub fn get_if_loaded(&self, index: ChunkIndex) -> Option<SharedChunk> {
        self.inner.lock().loaded.get(&index).map(|r| r.chunk.clone())
    }

    /// References held on `index`, loaded or loading.
    pub fn reference_count(&self, index: ChunkIndex) -> usize {
        let state = self.inner.lock();
        state
            .loaded
            .get(&index)
            .map(|r| r.refs)
            .or_else(|| state.loading.get(&index).map(|f| f.refs))
            .unwrap_or(0)
    }

    /// Whether a load for `index` is in flight.
    pub fn is_loading(&self, index: ChunkIndex) -> bool {
        self.inner.lock().loading.contains_key(&index)
    }

    /// Whether an evicted chunk at `index` is still being written back.
    pub fn is_flushing(&self, index: ChunkIndex) -> bool {
        self.inner.lock().flushing.contains_key(&index)
    }

    /// Indices of all loaded chunks, ascending.
    pub fn loaded_indices(&self) -> Vec<ChunkIndex> {
        self.inner.lock().loaded.keys().copied().collect()
    }

    /// All loaded chunks, ascending by index.
    pub fn loaded_chunks(&self) -> Vec<SharedChunk> {
        self.inner.lock().loaded.values().map(|r| r.chunk.clone()).collect()
    }
}

async fn run_load(inner: Arc<LoaderInner>, index: ChunkIndex, generation: u64) {
    let outcome = match inner.storage.load_chunk(index).await {
        Ok(Some(snapshot)) if snapshot.index != index => Err(format!(
            "storage returned chunk {} for {}",
            snapshot.index, index
        )),
        Ok(Some(snapshot)) => Chunk::from_snapshot(snapshot).map_err(|e| e.to_string()),
        Ok(None) => Ok(Chunk::empty(index)),
        Err(e) => Err(e.to_string()),
    };

    let mut state = inner.lock();
    match state.loading.get(&index) {
        Some(flight) if flight.generation == generation => {}
        // Cancelled or superseded while we were reading.
        _ => return,
    }
    let Some(flight) = state.loading.remove(&index) else {
        return;
    };

    match outcome {
        Ok(chunk) => {
            let chunk = Arc::new(RwLock::new(chunk));
            inner.attach(&chunk);
            state.loaded.insert(index, Resident {
                chunk: chunk.clone(),
                refs: flight.refs,
            });
            debug!(chunk = %index, refs = flight.refs, "Chunk loaded");
            let _ = flight.state.send(LoadState::Ready(chunk));
        }
        Err(reason) => {
            warn!(chunk = %index, %reason, "Chunk load failed");
            let _ = flight.state.send(LoadState::Failed(reason));
        }
    }
}

async fn flush_evicted(inner: &LoaderInner, index: ChunkIndex, chunk: &SharedChunk) -> Result<(), LoadError> {
    let _gate = inner.write_gate.lock().await;
    let (snapshot, revision) = {
        let chunk = chunk.read().unwrap_or_else(PoisonError::into_inner);
        (chunk.snapshot(), chunk.revision())
    };
    inner
        .storage
        .save_chunk(snapshot)
        .await
        .map_err(|e| LoadError::Storage { index, reason: e.to_string() })?;
    chunk.write().unwrap_or_else(PoisonError::into_inner).mark_saved(revision);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::core::point::Point;
    use crate::game::storage::MemoryStorage;
    use crate::game::tile::Tile;

    fn loader_with(storage: &Arc<MemoryStorage>) -> ChunkLoader {
        ChunkLoader::new(storage.clone())
    }

    #[derive(Default)]
    struct CountingObserver {
        attached: AtomicUsize,
        detached: AtomicUsize,
    }

    impl ChunkObserver for CountingObserver {
        fn chunk_attached(&self, _chunk: &SharedChunk) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }
        fn chunk_detached(&self, _chunk: &SharedChunk) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_read() {
        let storage = Arc::new(MemoryStorage::with_latency(Duration::from_millis(50)));
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(4, -4);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.acquire(index).await })
            })
            .collect();

        let mut chunks = Vec::new();
        for task in tasks {
            chunks.push(task.await.unwrap().unwrap());
        }

        assert_eq!(storage.chunk_loads(), 1);
        assert!(chunks.iter().all(|c| Arc::ptr_eq(c, &chunks[0])));
        assert_eq!(loader.reference_count(index), 8);
        assert!(!loader.is_loading(index));
    }

    #[tokio::test]
    async fn test_missing_chunk_is_synthesized_empty() {
        let storage = Arc::new(MemoryStorage::new());
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(-2, 1);

        let chunk = loader.acquire(index).await.unwrap();
        let chunk = chunk.read().unwrap();
        assert_eq!(chunk.index(), index);
        assert_eq!(chunk.tile(index.origin()), Some(&Tile::path()));
        assert!(chunk.is_attached());
    }

    #[tokio::test]
    async fn test_unload_cancels_in_flight_load() {
        let storage = Arc::new(MemoryStorage::with_latency(Duration::from_millis(100)));
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(0, 0);

        let waiter = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.acquire(index).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(loader.is_loading(index));

        assert_eq!(loader.unload(index, false).await.unwrap(), UnloadOutcome::Cancelled);
        assert!(matches!(waiter.await.unwrap(), Err(LoadError::Cancelled(i)) if i == index));
        assert!(loader.get_if_loaded(index).is_none());
        assert!(!loader.is_loading(index));

        // A later acquire starts a fresh read.
        loader.acquire(index).await.unwrap();
        assert_eq!(storage.chunk_loads(), 2);
        assert!(loader.get_if_loaded(index).is_some());
    }

    #[tokio::test]
    async fn test_refcount_eviction_and_flush() {
        let storage = Arc::new(MemoryStorage::new());
        let observer = Arc::new(CountingObserver::default());
        let loader = ChunkLoader::with_observer(storage.clone(), observer.clone());
        let index = ChunkIndex::new(1, 1);
        let spot = index.origin() + Point::new(2, 3);

        let chunk = loader.acquire(index).await.unwrap();
        loader.acquire(index).await.unwrap();
        {
            let mut chunk = chunk.write().unwrap();
            chunk.set_tile(spot, Tile::wall());
            chunk.mark_modified();
        }

        assert_eq!(loader.unload(index, false).await.unwrap(), UnloadOutcome::Released { remaining: 1 });
        assert_eq!(storage.chunk_saves(), 0);
        assert_eq!(loader.unload(index, false).await.unwrap(), UnloadOutcome::Evicted);
        assert_eq!(storage.chunk_saves(), 1);
        assert!(loader.get_if_loaded(index).is_none());
        assert_eq!(observer.attached.load(Ordering::SeqCst), 1);
        assert_eq!(observer.detached.load(Ordering::SeqCst), 1);

        let reloaded = loader.acquire(index).await.unwrap();
        assert_eq!(reloaded.read().unwrap().tile(spot), Some(&Tile::wall()));
        assert_eq!(loader.unload(index, false).await.unwrap(), UnloadOutcome::Evicted);
        // Clean chunk: no second write
        assert_eq!(storage.chunk_saves(), 1);
        assert_eq!(loader.unload(index, false).await.unwrap(), UnloadOutcome::NotResident);
    }

    #[tokio::test]
    async fn test_acquire_during_flush_waits_and_reloads() {
        let storage = Arc::new(MemoryStorage::new().with_save_latency(Duration::from_millis(80)));
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(-3, 2);
        let spot = index.origin() + Point::new(7, 7);

        let first = loader.acquire(index).await.unwrap();
        {
            let mut chunk = first.write().unwrap();
            chunk.set_tile(spot, Tile::wall());
            chunk.mark_modified();
        }

        let eviction = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.unload(index, false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(loader.is_flushing(index));
        assert!(loader.get_if_loaded(index).is_none());

        let second = loader.acquire(index).await.unwrap();
        assert!(!loader.is_flushing(index));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.read().unwrap().tile(spot), Some(&Tile::wall()));
        assert_eq!(storage.chunk_loads(), 2);
        assert_eq!(storage.chunk_saves(), 1);
        assert_eq!(eviction.await.unwrap().unwrap(), UnloadOutcome::Evicted);
        assert_eq!(loader.reference_count(index), 1);
    }

    #[tokio::test]
    async fn test_out_of_world_index_is_refused() {
        let storage = Arc::new(MemoryStorage::new());
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(i32::MAX, 0);

        assert_eq!(loader.acquire(index).await.unwrap_err(), LoadError::OutOfWorld(index));
        assert_eq!(storage.chunk_loads(), 0);
        assert!(!loader.is_loading(index));
        assert_eq!(loader.unload(index, false).await.unwrap(), UnloadOutcome::NotResident);
    }

    #[tokio::test]
    async fn test_forced_unload_ignores_refcount() {
        let storage = Arc::new(MemoryStorage::new());
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(0, 3);

        loader.acquire(index).await.unwrap();
        loader.acquire(index).await.unwrap();
        assert_eq!(loader.unload(index, true).await.unwrap(), UnloadOutcome::Evicted);
        assert_eq!(loader.reference_count(index), 0);
    }

    #[tokio::test]
    async fn test_save_changes_clears_dirty() {
        let storage = Arc::new(MemoryStorage::new());
        let loader = loader_with(&storage);
        let a = loader.acquire(ChunkIndex::new(0, 0)).await.unwrap();
        loader.acquire(ChunkIndex::new(1, 0)).await.unwrap();

        a.write().unwrap().mark_modified();
        assert_eq!(loader.save_changes().await.unwrap(), 1);
        assert!(!a.read().unwrap().is_dirty());
        assert_eq!(loader.save_changes().await.unwrap(), 0);
        assert!(storage.stored(ChunkIndex::new(0, 0)).is_some());
        assert!(storage.stored(ChunkIndex::new(1, 0)).is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_index_free() {
        let storage = Arc::new(MemoryStorage::new());
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(5, 5);

        storage.set_failing(true);
        assert!(matches!(loader.acquire(index).await, Err(LoadError::Storage { .. })));
        assert!(!loader.is_loading(index));
        assert!(loader.get_if_loaded(index).is_none());

        storage.set_failing(false);
        assert!(loader.acquire(index).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_chunk_loaded() {
        let storage = Arc::new(MemoryStorage::new());
        let loader = loader_with(&storage);
        let index = ChunkIndex::new(2, 0);

        let chunk = loader.acquire(index).await.unwrap();
        chunk.write().unwrap().mark_modified();

        storage.set_failing(true);
        assert!(loader.unload(index, false).await.is_err());
        let kept = loader.get_if_loaded(index).unwrap();
        assert!(Arc::ptr_eq(&kept, &chunk));
        assert!(kept.read().unwrap().is_dirty());

        storage.set_failing(false);
        assert_eq!(loader.save_changes().await.unwrap(), 1);
    }
}
