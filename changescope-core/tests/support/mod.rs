//! Fakes and harness shared by the core integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use changescope_core::blob::{BlobHandle, InMemoryBlobStore};
use changescope_core::decode::{DecodedImage, ImageDecoder};
use changescope_core::fetch::{FetchResponse, ImageFetcher};
use changescope_core::governor::{HeapProbe, HeapUsage, PerformanceSnapshot};
use changescope_core::navigation::{
    DisplayedImage, NavigationObserver, NavigationStatus,
};
use changescope_core::progress::LoadProgress;
use changescope_core::{
    ImageLoadError, SessionParts, ViewerConfig, ViewerSession,
};
use changescope_model::{DatasetRecord, VariantSource};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Serves a fixed body after `latency`, optionally failing the first few
/// requests per URL. Counts every fetch.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    latency: Duration,
    fetches: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    /// Fail the next `times` fetches of `url` with a network error.
    pub fn fail(&self, url: &str, times: usize) {
        self.failures.lock().insert(url.to_string(), times);
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> =
            self.fetches.lock().keys().cloned().collect();
        urls.sort();
        urls
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        _cancel: &CancellationToken,
    ) -> changescope_core::Result<FetchResponse> {
        *self.fetches.lock().entry(url.to_string()).or_default() += 1;

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(url)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(ImageLoadError::Network(format!("HTTP 503: {url}")));
            }
        }

        let latency = self.latency;
        let body = futures::stream::once(async move {
            tokio::time::sleep(latency).await;
            Ok(Bytes::from_static(b"fake-image-bytes"))
        })
        .boxed();
        Ok(FetchResponse {
            total_bytes: Some(16),
            body,
        })
    }
}

/// Reports fixed dimensions, or never finishes when `hang` is set.
pub struct FakeDecoder {
    pub width: u32,
    pub height: u32,
    pub hang: bool,
    after_decode: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FakeDecoder {
    pub fn sized(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            hang: false,
            after_decode: Mutex::new(None),
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            width: 0,
            height: 0,
            hang: true,
            after_decode: Mutex::new(None),
        })
    }

    /// Run `hook` once each decode has produced its image.
    pub fn after_decode(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.after_decode.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl ImageDecoder for FakeDecoder {
    async fn decode(
        &self,
        blob: &BlobHandle,
    ) -> changescope_core::Result<DecodedImage> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if blob.bytes().is_none() {
            return Err(ImageLoadError::Decode("blob revoked".into()));
        }
        if let Some(hook) = self.after_decode.lock().as_ref() {
            hook();
        }
        Ok(DecodedImage::new(self.width, self.height))
    }
}

pub struct FixedHeap(pub Option<HeapUsage>);

impl HeapProbe for FixedHeap {
    fn sample(&self) -> Option<HeapUsage> {
        self.0
    }
}

#[derive(Debug, Clone)]
pub enum ObservedEvent {
    Status(NavigationStatus),
    Progress(LoadProgress),
    Display { index: usize, dataset_id: u64, from_cache: bool },
    Position { index: usize, total: usize },
    Highlight(u64),
    Snapshot(PerformanceSnapshot),
    RetryAvailable(bool),
    FitToView,
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<NavigationStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ObservedEvent::Status(status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn displayed_indices(&self) -> Vec<usize> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ObservedEvent::Display { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    pub fn retry_count(&self) -> usize {
        self.statuses()
            .iter()
            .filter(|status| {
                matches!(status, NavigationStatus::Retrying { .. })
            })
            .count()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().push(event);
    }
}

impl NavigationObserver for RecordingObserver {
    fn status(&self, status: &NavigationStatus) {
        self.push(ObservedEvent::Status(status.clone()));
    }

    fn progress(&self, progress: &LoadProgress) {
        self.push(ObservedEvent::Progress(*progress));
    }

    fn display(&self, displayed: &DisplayedImage) {
        self.push(ObservedEvent::Display {
            index: displayed.request.index,
            dataset_id: displayed.dataset_id,
            from_cache: displayed.from_cache,
        });
    }

    fn position(&self, index: usize, total: usize) {
        self.push(ObservedEvent::Position { index, total });
    }

    fn highlight(&self, dataset_id: u64) {
        self.push(ObservedEvent::Highlight(dataset_id));
    }

    fn snapshot(&self, snapshot: &PerformanceSnapshot) {
        self.push(ObservedEvent::Snapshot(*snapshot));
    }

    fn retry_available(&self, available: bool) {
        self.push(ObservedEvent::RetryAvailable(available));
    }

    fn fit_to_view(&self) {
        self.push(ObservedEvent::FitToView);
    }
}

/// A session wired to fakes, with handles for assertions.
pub struct Harness {
    pub session: ViewerSession,
    pub fetcher: Arc<FakeFetcher>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn new(
        config: ViewerConfig,
        fetcher: Arc<FakeFetcher>,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Self {
        Self::with_probe(config, fetcher, decoder, Arc::new(FixedHeap(None)))
    }

    pub fn with_probe(
        config: ViewerConfig,
        fetcher: Arc<FakeFetcher>,
        decoder: Arc<dyn ImageDecoder>,
        probe: Arc<dyn HeapProbe>,
    ) -> Self {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let session = ViewerSession::new(
            &config,
            SessionParts {
                fetcher: fetcher.clone(),
                decoder,
                blobs: blobs.clone(),
                observer: observer.clone(),
                heap_probe: Some(probe),
            },
        );
        Self {
            session,
            fetcher,
            blobs,
            observer,
        }
    }
}

/// `count` datasets with bare relative URLs like `3/post.png`.
pub fn datasets(count: u64) -> Vec<DatasetRecord> {
    (0..count)
        .map(|id| DatasetRecord {
            id,
            name: Some(format!("site-{id}")),
            pre_event: VariantSource::from(format!("{id}/pre.png").as_str()),
            post_event: VariantSource::from(format!("{id}/post.png").as_str()),
            change_detection: VariantSource::from(
                format!("{id}/change.png").as_str(),
            ),
            has_vegetation_filter: false,
        })
        .collect()
}

pub fn config_with_cache(max_entries: usize) -> ViewerConfig {
    let mut config = ViewerConfig::default();
    config.cache.max_entries = max_entries;
    config
}

/// Let spawned tasks run until they block on the (paused) clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
