//! Shared decoded-image cache.
//!
//! [`CacheStore`] holds the data; [`ImageCache`] wraps it with the preload
//! registry so cleanup under memory pressure can cancel speculative work and
//! shrink the store in one step.

mod entry;
mod store;

pub use entry::{CachedImage, EntryMetadata};
pub use store::{CacheStats, CacheStore};

use std::sync::Arc;

use changescope_model::CacheKey;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobHandle;
use crate::config::CacheConfig;
use crate::decode::DecodedImage;
use crate::governor::MemoryPressure;
use crate::preload::PreloadRegistry;
use crate::units::ByteSize;

/// Cloneable handle to the process-wide cache.
///
/// Every method takes the store lock for the duration of a synchronous
/// operation only.
#[derive(Debug, Clone)]
pub struct ImageCache {
    store: Arc<Mutex<CacheStore>>,
    preloads: PreloadRegistry,
}

impl ImageCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_store(CacheStore::from_config(config))
    }

    pub fn with_store(store: CacheStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            preloads: PreloadRegistry::default(),
        }
    }

    /// Registry of in-flight preloads tied to this cache.
    pub fn preloads(&self) -> &PreloadRegistry {
        &self.preloads
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.store.lock().has(key)
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        self.store.lock().get(key)
    }

    pub fn insert(
        &self,
        key: CacheKey,
        image: DecodedImage,
        blob: BlobHandle,
        metadata: EntryMetadata,
    ) -> CachedImage {
        self.store.lock().insert(key, image, blob, metadata)
    }

    /// Insert unless `token` was cancelled, deciding under the store lock so
    /// a concurrent [`aggressive_shrink`](Self::aggressive_shrink) either
    /// sees the entry or the insert never happens. A refused blob is released.
    pub fn insert_unless_cancelled(
        &self,
        token: &CancellationToken,
        key: CacheKey,
        image: DecodedImage,
        blob: BlobHandle,
        metadata: EntryMetadata,
    ) -> Option<CachedImage> {
        {
            let mut store = self.store.lock();
            if !token.is_cancelled() {
                return Some(store.insert(key, image, blob, metadata));
            }
        }
        blob.release();
        None
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.store.lock().delete(key)
    }

    pub fn resize(&self, max_entries: usize) {
        self.store.lock().resize(max_entries);
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.store.lock().max_entries()
    }

    pub fn is_full(&self) -> bool {
        self.store.lock().is_full()
    }

    pub fn estimate_memory(&self) -> ByteSize {
        self.store.lock().estimate_memory()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.lock().stats()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.store.lock().keys()
    }

    /// Cancel every preload and release every entry.
    pub fn clear(&self) {
        self.preloads.cancel_all();
        self.store.lock().clear();
    }

    /// Cancel all preloads, then evict oldest entries down to half the bound.
    /// Returns the number of evicted entries.
    pub fn aggressive_shrink(&self) -> usize {
        let cancelled = self.preloads.cancel_all();
        let (evicted, remaining) = {
            let mut store = self.store.lock();
            let target = store.max_entries() / 2;
            (store.shrink_to(target), store.len())
        };
        tracing::info!(
            target: "image::cache",
            cancelled_preloads = cancelled,
            evicted,
            remaining,
            "aggressive cache shrink"
        );
        evicted
    }

    /// Shrink whenever the governor signals pressure, until `shutdown` fires
    /// or the channel closes.
    pub fn respond_to_pressure(
        &self,
        mut pressure: broadcast::Receiver<MemoryPressure>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = pressure.recv() => signal,
                };
                match signal {
                    Ok(MemoryPressure::AggressiveCleanup) => {
                        cache.aggressive_shrink();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "image::cache",
                            skipped,
                            "missed pressure signals, shrinking once"
                        );
                        cache.aggressive_shrink();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
