use std::time::Duration;

use changescope_model::CacheKey;
use tokio::time::Instant;

use crate::blob::{BlobHandle, BlobId};
use crate::decode::DecodedImage;
use crate::units::ByteSize;

/// Caller-supplied facts about a freshly loaded image.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    /// Lower is more important. The main load uses 1, preloads 2..=5.
    pub priority: u8,

    /// Who produced the entry, e.g. `"main-load"` or `"preload-next"`.
    pub context: String,

    /// Wall-clock time from request to decoded image.
    pub load_time: Duration,

    /// Downloaded size when the server reported one.
    pub image_size: Option<u64>,

    /// Resolved source URL.
    pub url: String,
}

impl EntryMetadata {
    pub fn new(
        url: impl Into<String>,
        priority: u8,
        context: impl Into<String>,
    ) -> Self {
        Self {
            priority,
            context: context.into(),
            load_time: Duration::ZERO,
            image_size: None,
            url: url.into(),
        }
    }

    pub fn with_load_time(mut self, load_time: Duration) -> Self {
        self.load_time = load_time;
        self
    }

    pub fn with_image_size(mut self, image_size: Option<u64>) -> Self {
        self.image_size = image_size;
        self
    }
}

/// A resident image. Owned exclusively by the cache store, which is the only
/// place its blob gets released.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub(crate) image: DecodedImage,
    pub(crate) blob: BlobHandle,
    pub(crate) metadata: EntryMetadata,
    pub(crate) inserted_at: Instant,
    pub(crate) last_access: Instant,
    pub(crate) access_count: u64,
}

impl CacheEntry {
    pub(crate) fn new(
        image: DecodedImage,
        blob: BlobHandle,
        metadata: EntryMetadata,
    ) -> Self {
        let now = Instant::now();
        Self {
            image,
            blob,
            metadata,
            inserted_at: now,
            last_access: now,
            access_count: 0,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count = self.access_count.saturating_add(1);
    }

    /// `width * height * 4`, or `fallback` when dimensions are unknown.
    pub(crate) fn estimated_bytes(&self, fallback: ByteSize) -> ByteSize {
        let (width, height) = (self.image.width(), self.image.height());
        if width == 0 || height == 0 {
            return fallback;
        }
        ByteSize::from_bytes(u64::from(width) * u64::from(height) * 4)
    }

    pub(crate) fn view(&self, key: &CacheKey) -> CachedImage {
        CachedImage {
            key: key.clone(),
            image: self.image.clone(),
            blob: self.blob.clone(),
            priority: self.metadata.priority,
            context: self.metadata.context.clone(),
            load_time: self.metadata.load_time,
            image_size: self.metadata.image_size,
            url: self.metadata.url.clone(),
            inserted_at: self.inserted_at,
            access_count: self.access_count,
        }
    }
}

/// Read-only view of a cache entry handed out to callers.
///
/// Holds a clone of the entry's blob handle so the bytes stay addressable,
/// but offers no way to release it.
#[derive(Debug, Clone)]
pub struct CachedImage {
    key: CacheKey,
    image: DecodedImage,
    blob: BlobHandle,
    priority: u8,
    context: String,
    load_time: Duration,
    image_size: Option<u64>,
    url: String,
    inserted_at: Instant,
    access_count: u64,
}

impl CachedImage {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn image(&self) -> &DecodedImage {
        &self.image
    }

    pub fn blob_id(&self) -> BlobId {
        self.blob.id()
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    /// Bytes downloaded for this image, when known.
    pub fn image_size(&self) -> Option<u64> {
        self.image_size
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Decoding always completes before an entry becomes resident.
    pub fn is_complete(&self) -> bool {
        true
    }

    /// Dimensions as the display surface would see them. A revoked blob has
    /// nothing left to draw and reports `(0, 0)`.
    pub fn natural_dimensions(&self) -> (u32, u32) {
        if self.blob.is_revoked() {
            return (0, 0);
        }
        (self.image.width(), self.image.height())
    }

    /// Complete but zero-sized means the underlying resource is gone.
    pub fn is_valid(&self) -> bool {
        let (width, height) = self.natural_dimensions();
        !(self.is_complete() && (width == 0 || height == 0))
    }
}
