//! Revocable in-memory blob handles.
//!
//! Downloaded image bytes are registered with a [`BlobStore`] and addressed
//! through a [`BlobHandle`]. A handle must be revoked exactly once; the
//! handle tracks that itself so eviction, explicit deletes, replacement and
//! failed loads can all call [`BlobHandle::release`] without coordinating.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

pub type BlobId = u64;

/// Owner of the raw bytes behind blob handles.
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Register `bytes`, returning an id that stays live until revoked.
    fn create(&self, bytes: Bytes) -> BlobId;

    /// Drop the bytes behind `id`. Revoking an unknown or already revoked id
    /// is a no-op.
    fn revoke(&self, id: BlobId);

    /// Whether `id` still refers to live bytes.
    fn is_live(&self, id: BlobId) -> bool;

    /// Bytes behind `id`, if still live.
    fn bytes(&self, id: BlobId) -> Option<Bytes>;
}

/// Process-local [`BlobStore`] that also counts revocations.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    next_id: AtomicU64,
    blobs: Mutex<HashMap<BlobId, Bytes>>,
    revocations: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `revoke` calls received, including no-op ones.
    pub fn revocations(&self) -> usize {
        self.revocations.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.blobs.lock().len()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn create(&self, bytes: Bytes) -> BlobId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.blobs.lock().insert(id, bytes);
        id
    }

    fn revoke(&self, id: BlobId) {
        self.revocations.fetch_add(1, Ordering::SeqCst);
        self.blobs.lock().remove(&id);
    }

    fn is_live(&self, id: BlobId) -> bool {
        self.blobs.lock().contains_key(&id)
    }

    fn bytes(&self, id: BlobId) -> Option<Bytes> {
        self.blobs.lock().get(&id).cloned()
    }
}

struct BlobInner {
    id: BlobId,
    len: usize,
    store: Arc<dyn BlobStore>,
    released: AtomicBool,
}

impl BlobInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.store.revoke(self.id);
        true
    }
}

impl Drop for BlobInner {
    fn drop(&mut self) {
        // Last clone gone without an explicit release.
        if self.release() {
            tracing::trace!(
                target: "image::blob",
                id = self.id,
                "released blob on drop"
            );
        }
    }
}

/// Shared reference to a registered blob.
///
/// Clones refer to the same blob; the first [`release`](Self::release) on
/// any clone revokes it and later calls are no-ops. If every clone is
/// dropped without a release the blob is revoked on drop.
#[derive(Clone)]
pub struct BlobHandle {
    inner: Arc<BlobInner>,
}

impl BlobHandle {
    pub fn create(store: &Arc<dyn BlobStore>, bytes: Bytes) -> Self {
        let len = bytes.len();
        let id = store.create(bytes);
        Self {
            inner: Arc::new(BlobInner {
                id,
                len,
                store: Arc::clone(store),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> BlobId {
        self.inner.id
    }

    /// Size of the registered bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// The bytes, unless the blob has been revoked by anyone.
    pub fn bytes(&self) -> Option<Bytes> {
        if self.inner.released.load(Ordering::Acquire) {
            return None;
        }
        self.inner.store.bytes(self.inner.id)
    }

    /// True once released through this handle or revoked out-of-band in the
    /// store.
    pub fn is_revoked(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
            || !self.inner.store.is_live(self.inner.id)
    }

    /// Revoke the blob. Returns `true` only for the call that revoked it.
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    pub fn same_blob(&self, other: &BlobHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .field("released", &self.inner.released.load(Ordering::Relaxed))
            .finish()
    }
}
