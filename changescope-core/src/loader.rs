//! Single-flight loader for the image the user is looking at.
//!
//! Only one main load is current at a time. Starting a new one cancels the
//! previous load's token, so a superseded request resolves to
//! [`ImageLoadError::Cancelled`] without touching the cache.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use changescope_model::CacheKey;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CachedImage, EntryMetadata, ImageCache};
use crate::config::LoaderConfig;
use crate::error::{ImageLoadError, Result};
use crate::governor::ResourceGovernor;
use crate::pipeline::ImagePipeline;
use crate::progress::{LoadProgress, ProgressTracker};

/// Priority given to the displayed image.
pub const MAIN_LOAD_PRIORITY: u8 = 1;
/// Context label of entries produced by the main load.
pub const MAIN_LOAD_CONTEXT: &str = "main-load";

#[derive(Debug, Default)]
struct CurrentSlot {
    generation: u64,
    token: Option<CancellationToken>,
}

#[derive(Debug)]
pub struct Loader {
    cache: ImageCache,
    pipeline: ImagePipeline,
    governor: Arc<ResourceGovernor>,
    progress_interval: Duration,
    current: Arc<Mutex<CurrentSlot>>,
}

/// Clears the current slot when the load that owns it ends.
struct SlotGuard {
    slot: Arc<Mutex<CurrentSlot>>,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.generation == self.generation {
            slot.token = None;
        }
    }
}

impl Loader {
    pub fn new(
        cache: ImageCache,
        pipeline: ImagePipeline,
        governor: Arc<ResourceGovernor>,
        config: &LoaderConfig,
    ) -> Self {
        Self {
            cache,
            pipeline,
            governor,
            progress_interval: config.progress_interval(),
            current: Arc::new(Mutex::new(CurrentSlot::default())),
        }
    }

    /// Load `url` into the cache under `key`, superseding any current load.
    ///
    /// `on_progress` is called at most once per progress interval, and only
    /// when the server reports a body size.
    pub async fn load<F>(
        &self,
        url: &str,
        key: &CacheKey,
        on_progress: F,
    ) -> Result<CachedImage>
    where
        F: Fn(LoadProgress) + Send + Sync,
    {
        let (token, _guard) = self.begin();
        let started = Instant::now();

        let result = self.run(url, key, &token, started, &on_progress).await;
        match &result {
            Ok(image) => tracing::info!(
                target: "image::load",
                url,
                key = %key,
                load_ms = image.load_time().as_millis() as u64,
                quality = %self.governor.network_quality(),
                "image loaded"
            ),
            Err(err) if err.is_cancelled() => tracing::debug!(
                target: "image::load",
                url,
                "load superseded"
            ),
            Err(err) => tracing::warn!(
                target: "image::load",
                url,
                kind = err.kind(),
                error = %err,
                "image load failed"
            ),
        }
        result
    }

    /// Abort the current load, if any.
    pub fn cancel_current(&self) -> bool {
        let token = self.current.lock().token.take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_current(&self) -> bool {
        self.current.lock().token.is_some()
    }

    fn begin(&self) -> (CancellationToken, SlotGuard) {
        let token = CancellationToken::new();
        let mut slot = self.current.lock();
        if let Some(previous) = slot.token.replace(token.clone()) {
            previous.cancel();
        }
        slot.generation += 1;
        let guard = SlotGuard {
            slot: Arc::clone(&self.current),
            generation: slot.generation,
        };
        (token, guard)
    }

    async fn run<F>(
        &self,
        url: &str,
        key: &CacheKey,
        token: &CancellationToken,
        started: Instant,
        on_progress: &F,
    ) -> Result<CachedImage>
    where
        F: Fn(LoadProgress) + Send + Sync,
    {
        let response = self.pipeline.fetch(url, token).await?;
        let total_bytes = response.total_bytes;
        let mut tracker =
            ProgressTracker::new(total_bytes, self.progress_interval, started);
        let mut body = response.body;
        let capacity = total_bytes.unwrap_or(0).min(64 * 1024 * 1024);
        let mut buffer = BytesMut::with_capacity(capacity as usize);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ImageLoadError::Cancelled),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    if let Some(progress) =
                        tracker.record(buffer.len() as u64, Instant::now())
                    {
                        on_progress(progress);
                    }
                }
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        drop(body);

        let downloaded = buffer.len() as u64;
        let blob = self.pipeline.register(buffer.freeze());
        let image = self.pipeline.decode(&blob, token).await?;
        if token.is_cancelled() {
            blob.release();
            return Err(ImageLoadError::Cancelled);
        }

        let load_time = started.elapsed();
        let metadata =
            EntryMetadata::new(url, MAIN_LOAD_PRIORITY, MAIN_LOAD_CONTEXT)
                .with_load_time(load_time)
                .with_image_size(Some(downloaded));
        let cached = self.cache.insert(key.clone(), image, blob, metadata);
        self.governor.record_load(load_time);
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::config::{CacheConfig, GovernorConfig};
    use crate::decode::{DecodedImage, MockImageDecoder};
    use crate::fetch::{FetchResponse, ImageFetcher};
    use crate::governor::ProcessHeapProbe;
    use async_trait::async_trait;
    use bytes::Bytes;
    use changescope_model::NetworkQuality;

    /// Serves `chunks` chunks of 1 KiB, one every 60ms.
    struct TricklingFetcher {
        chunks: u64,
        advertise_length: bool,
    }

    #[async_trait]
    impl ImageFetcher for TricklingFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _cancel: &CancellationToken,
        ) -> Result<FetchResponse> {
            let body = futures::stream::iter(0..self.chunks)
                .then(|_| async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(Bytes::from(vec![0u8; 1024]))
                })
                .boxed();
            Ok(FetchResponse {
                total_bytes: self
                    .advertise_length
                    .then_some(self.chunks * 1024),
                body,
            })
        }
    }

    fn loader(
        chunks: u64,
        decoder: MockImageDecoder,
    ) -> (Arc<Loader>, ImageCache, Arc<InMemoryBlobStore>) {
        build_loader(
            TricklingFetcher {
                chunks,
                advertise_length: true,
            },
            decoder,
        )
    }

    fn build_loader(
        fetcher: TricklingFetcher,
        decoder: MockImageDecoder,
    ) -> (Arc<Loader>, ImageCache, Arc<InMemoryBlobStore>) {
        let cache = ImageCache::new(&CacheConfig::default());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let pipeline = ImagePipeline::new(
            Arc::new(fetcher),
            Arc::new(decoder),
            blobs.clone(),
            Duration::from_secs(15),
        );
        let governor = Arc::new(ResourceGovernor::new(
            GovernorConfig::default(),
            cache.clone(),
            Arc::new(ProcessHeapProbe::default()),
        ));
        let loader = Arc::new(Loader::new(
            cache.clone(),
            pipeline,
            governor,
            &LoaderConfig::default(),
        ));
        (loader, cache, blobs)
    }

    fn key(url: &str) -> CacheKey {
        CacheKey::derive(url, false, false, false)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_load_is_cached_as_main_load() {
        let mut decoder = MockImageDecoder::new();
        decoder
            .expect_decode()
            .times(1)
            .returning(|_| Ok(DecodedImage::new(800, 600)));
        let (loader, cache, _blobs) = loader(10, decoder);

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let image = loader
            .load("a.png", &key("a.png"), move |p| sink.lock().push(p))
            .await
            .expect("loads");

        assert_eq!(image.priority(), MAIN_LOAD_PRIORITY);
        assert_eq!(image.context(), MAIN_LOAD_CONTEXT);
        assert_eq!(image.image_size(), Some(10 * 1024));
        assert!(cache.has(&key("a.png")));
        assert!(!loader.has_current());

        // 10 chunks over 600ms with a 100ms throttle.
        let updates = updates.lock();
        assert!(!updates.is_empty() && updates.len() <= 6);
        assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(updates[0].total_bytes, 10 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn new_load_supersedes_the_current_one() {
        let mut decoder = MockImageDecoder::new();
        decoder
            .expect_decode()
            .times(1)
            .returning(|_| Ok(DecodedImage::new(10, 10)));
        let (loader, cache, blobs) = loader(10, decoder);

        let first = {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                loader.load("a.png", &key("a.png"), |_| {}).await
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = loader.load("b.png", &key("b.png"), |_| {}).await;

        let first = first.await.expect("join");
        assert!(matches!(first, Err(ImageLoadError::Cancelled)));
        assert!(second.is_ok());
        assert!(!cache.has(&key("a.png")));
        assert_eq!(cache.keys(), vec![key("b.png")]);
        assert_eq!(blobs.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_current_aborts_mid_stream() {
        let mut decoder = MockImageDecoder::new();
        decoder.expect_decode().never();
        let (loader, cache, blobs) = loader(10, decoder);

        let pending = {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                loader.load("a.png", &key("a.png"), |_| {}).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(loader.cancel_current());

        let err = pending.await.expect("join").unwrap_err();
        assert!(err.is_cancelled());
        assert!(cache.is_empty());
        assert_eq!(blobs.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn image_size_counts_bytes_without_a_length_hint() {
        let mut decoder = MockImageDecoder::new();
        decoder
            .expect_decode()
            .returning(|_| Ok(DecodedImage::new(10, 10)));
        let (loader, _cache, _blobs) = build_loader(
            TricklingFetcher {
                chunks: 3,
                advertise_length: false,
            },
            decoder,
        );

        let image = loader
            .load("a.png", &key("a.png"), |_| {})
            .await
            .expect("loads");
        assert_eq!(image.image_size(), Some(3 * 1024));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_load_rates_network_excellent() {
        let mut decoder = MockImageDecoder::new();
        decoder
            .expect_decode()
            .returning(|_| Ok(DecodedImage::new(10, 10)));
        let (loader, _cache, _blobs) = loader(2, decoder);

        loader
            .load("a.png", &key("a.png"), |_| {})
            .await
            .expect("loads");
        assert_eq!(
            loader.governor.network_quality(),
            NetworkQuality::Excellent
        );
    }
}
