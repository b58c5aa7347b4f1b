//! Bounded FIFO store of decoded images.
//!
//! Eviction follows insertion order. Hits update access bookkeeping but never
//! move a key, so the oldest insertion is always the next to go.

use std::collections::{HashMap, VecDeque};

use changescope_model::CacheKey;

use super::entry::{CacheEntry, CachedImage, EntryMetadata};
use crate::blob::BlobHandle;
use crate::config::CacheConfig;
use crate::decode::DecodedImage;
use crate::units::ByteSize;

/// Point-in-time view of store occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Resident entries
    pub entries: usize,

    /// Entry bound
    pub max_entries: usize,

    /// Sum of per-entry pixel estimates
    pub estimated_memory: ByteSize,

    /// Entries evicted since creation (inserts, resizes and shrinks)
    pub evictions: u64,
}

#[derive(Debug)]
pub struct CacheStore {
    entries: HashMap<CacheKey, CacheEntry>,

    /// Live keys, oldest first. Always the same set as `entries`.
    order: VecDeque<CacheKey>,

    max_entries: usize,
    fallback_entry_bytes: ByteSize,
    evictions: u64,
}

impl CacheStore {
    /// `max_entries` below one is raised to one.
    pub fn new(max_entries: usize, fallback_entry_bytes: ByteSize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
            fallback_entry_bytes,
            evictions: 0,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.fallback_entry_bytes)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up `key`, recording the access.
    pub fn get(&mut self, key: &CacheKey) -> Option<CachedImage> {
        let entry = self.entries.get_mut(key)?;
        entry.touch();
        Some(entry.view(key))
    }

    /// Store a freshly decoded image.
    ///
    /// An existing entry under `key` is replaced and its blob released unless
    /// the caller handed back the very same blob. A full store evicts its
    /// oldest entry first.
    pub fn insert(
        &mut self,
        key: CacheKey,
        image: DecodedImage,
        blob: BlobHandle,
        metadata: EntryMetadata,
    ) -> CachedImage {
        if let Some(previous) = self.entries.remove(&key) {
            self.order.retain(|k| k != &key);
            if !previous.blob.same_blob(&blob) {
                previous.blob.release();
            }
            tracing::debug!(
                target: "image::cache",
                key = %key,
                previous_context = %previous.metadata.context,
                "replaced cache entry"
            );
        }

        while self.entries.len() >= self.max_entries {
            if self.evict_oldest().is_none() {
                break;
            }
        }

        let entry = CacheEntry::new(image, blob, metadata);
        let view = entry.view(&key);
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
        view
    }

    /// Remove and release `key`. Returns whether anything was removed.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.order.retain(|k| k != key);
        entry.blob.release();
        true
    }

    /// Evict oldest entries until at most `max_entries` remain, then adopt
    /// the new bound.
    pub fn resize(&mut self, max_entries: usize) {
        let evicted = self.shrink_to(max_entries);
        self.max_entries = max_entries.max(1);
        if evicted > 0 {
            tracing::debug!(
                target: "image::cache",
                evicted,
                max_entries = self.max_entries,
                "resized cache"
            );
        }
    }

    /// Evict oldest entries until at most `target` remain. Leaves the bound
    /// untouched.
    pub fn shrink_to(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > target {
            if self.evict_oldest().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn estimate_memory(&self) -> ByteSize {
        self.entries
            .values()
            .map(|entry| entry.estimated_bytes(self.fallback_entry_bytes))
            .sum()
    }

    /// Release every entry and empty the store.
    pub fn clear(&mut self) {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.blob.release();
        }
        self.order.clear();
        if count > 0 {
            tracing::debug!(target: "image::cache", count, "cleared cache");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            estimated_memory: self.estimate_memory(),
            evictions: self.evictions,
        }
    }

    /// Keys in eviction order, oldest first.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.order.iter().cloned().collect()
    }

    fn evict_oldest(&mut self) -> Option<CacheKey> {
        let key = self.order.pop_front()?;
        if let Some(entry) = self.entries.remove(&key) {
            entry.blob.release();
            self.evictions += 1;
            tracing::debug!(
                target: "image::cache",
                key = %key,
                context = %entry.metadata.context,
                access_count = entry.access_count,
                "evicted cache entry"
            );
        }
        Some(key)
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobStore, InMemoryBlobStore};
    use bytes::Bytes;
    use std::sync::Arc;

    struct Fixture {
        blobs: Arc<InMemoryBlobStore>,
        dyn_blobs: Arc<dyn BlobStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let blobs = Arc::new(InMemoryBlobStore::new());
            let dyn_blobs: Arc<dyn BlobStore> = blobs.clone();
            Self { blobs, dyn_blobs }
        }

        fn blob(&self) -> BlobHandle {
            BlobHandle::create(&self.dyn_blobs, Bytes::from_static(b"img"))
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(name, true, false, false)
    }

    fn insert(store: &mut CacheStore, fixture: &Fixture, name: &str) {
        store.insert(
            key(name),
            DecodedImage::new(10, 10),
            fixture.blob(),
            EntryMetadata::new(name, 1, "test"),
        );
    }

    fn assert_consistent(store: &CacheStore) {
        assert!(store.len() <= store.max_entries());
        let keys = store.keys();
        assert_eq!(keys.len(), store.len());
        for k in &keys {
            assert!(store.has(k));
        }
    }

    #[tokio::test]
    async fn fifo_eviction_ignores_access() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(3, ByteSize::from_mib(4));
        insert(&mut store, &fixture, "A");
        insert(&mut store, &fixture, "B");
        insert(&mut store, &fixture, "C");

        // A hit must not protect A from eviction.
        assert!(store.get(&key("A")).is_some());
        insert(&mut store, &fixture, "D");

        assert_eq!(store.keys(), vec![key("B"), key("C"), key("D")]);
        assert_eq!(fixture.blobs.revocations(), 1);

        insert(&mut store, &fixture, "A");
        assert_eq!(store.keys(), vec![key("C"), key("D"), key("A")]);
        assert_eq!(fixture.blobs.revocations(), 2);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn get_records_access() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(3, ByteSize::from_mib(4));
        insert(&mut store, &fixture, "A");
        store.get(&key("A"));
        let hit = store.get(&key("A")).expect("resident");
        assert_eq!(hit.access_count(), 2);
        assert!(store.get(&key("missing")).is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(3, ByteSize::from_mib(4));
        insert(&mut store, &fixture, "A");

        assert!(store.delete(&key("A")));
        assert!(!store.delete(&key("A")));
        assert_eq!(fixture.blobs.revocations(), 1);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn replacing_a_key_releases_the_old_blob_only() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(3, ByteSize::from_mib(4));
        insert(&mut store, &fixture, "A");
        insert(&mut store, &fixture, "B");
        insert(&mut store, &fixture, "A");

        assert_eq!(store.keys(), vec![key("B"), key("A")]);
        assert_eq!(fixture.blobs.revocations(), 1);
        assert_eq!(fixture.blobs.live_count(), 2);
    }

    #[tokio::test]
    async fn reinserting_the_same_blob_keeps_it_live() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(3, ByteSize::from_mib(4));
        let blob = fixture.blob();
        for _ in 0..2 {
            store.insert(
                key("A"),
                DecodedImage::new(1, 1),
                blob.clone(),
                EntryMetadata::new("A", 1, "test"),
            );
        }
        assert_eq!(fixture.blobs.revocations(), 0);
        assert!(!blob.is_revoked());
    }

    #[tokio::test]
    async fn resize_evicts_oldest_first() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(5, ByteSize::from_mib(4));
        for name in ["A", "B", "C", "D", "E"] {
            insert(&mut store, &fixture, name);
        }
        store.resize(2);
        assert_eq!(store.keys(), vec![key("D"), key("E")]);
        assert_eq!(store.max_entries(), 2);
        assert_eq!(store.stats().evictions, 3);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn memory_estimate_uses_fallback_for_unknown_dimensions() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(5, ByteSize::from_mib(4));
        insert(&mut store, &fixture, "A");
        store.insert(
            key("B"),
            DecodedImage::new(0, 0),
            fixture.blob(),
            EntryMetadata::new("B", 1, "test"),
        );
        assert_eq!(
            store.estimate_memory(),
            ByteSize::from_bytes(10 * 10 * 4)
                .saturating_add(ByteSize::from_mib(4))
        );
    }

    #[tokio::test]
    async fn clear_and_drop_release_each_blob_once() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(5, ByteSize::from_mib(4));
        for name in ["A", "B", "C"] {
            insert(&mut store, &fixture, name);
        }
        store.clear();
        assert_eq!(fixture.blobs.revocations(), 3);
        insert(&mut store, &fixture, "D");
        drop(store);
        assert_eq!(fixture.blobs.revocations(), 4);
        assert_eq!(fixture.blobs.live_count(), 0);
    }

    #[tokio::test]
    async fn size_never_exceeds_bound() {
        let fixture = Fixture::new();
        let mut store = CacheStore::new(4, ByteSize::from_mib(4));
        for i in 0..25 {
            insert(&mut store, &fixture, &format!("img-{}", i % 7));
            assert_consistent(&store);
        }
    }
}
