//! Construction and lifetime of one viewer's components.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobStore;
use crate::cache::ImageCache;
use crate::config::ViewerConfig;
use crate::decode::ImageDecoder;
use crate::fetch::ImageFetcher;
use crate::governor::{HeapProbe, ResourceGovernor};
use crate::loader::Loader;
use crate::navigation::{NavigationController, NavigationObserver};
use crate::pipeline::ImagePipeline;
use crate::preload::Preloader;

/// External collaborators a session is built around.
pub struct SessionParts {
    pub fetcher: Arc<dyn ImageFetcher>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub blobs: Arc<dyn BlobStore>,
    pub observer: Arc<dyn NavigationObserver>,
    /// Defaults to the process probe with the configured heap limit.
    pub heap_probe: Option<Arc<dyn HeapProbe>>,
}

impl std::fmt::Debug for SessionParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParts")
            .field("custom_heap_probe", &self.heap_probe.is_some())
            .finish_non_exhaustive()
    }
}

/// Every component of one viewer, wired together.
///
/// Background work (the memory monitor and the cache's pressure responder)
/// only runs after [`start`](Self::start) and stops on
/// [`shutdown`](Self::shutdown) or drop.
pub struct ViewerSession {
    cache: ImageCache,
    governor: Arc<ResourceGovernor>,
    loader: Arc<Loader>,
    preloader: Preloader,
    navigation: Arc<NavigationController>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("cache", &self.cache.stats())
            .field("governor", &self.governor)
            .field("background_tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl ViewerSession {
    pub fn new(config: &ViewerConfig, parts: SessionParts) -> Self {
        let cache = ImageCache::new(&config.cache);
        let governor = Arc::new(match parts.heap_probe {
            Some(probe) => {
                ResourceGovernor::new(config.governor, cache.clone(), probe)
            }
            None => ResourceGovernor::with_process_probe(
                config.governor,
                cache.clone(),
            ),
        });
        let pipeline = ImagePipeline::new(
            parts.fetcher,
            parts.decoder,
            parts.blobs,
            config.loader.decode_timeout(),
        );
        let loader = Arc::new(Loader::new(
            cache.clone(),
            pipeline.clone(),
            Arc::clone(&governor),
            &config.loader,
        ));
        let preloader = Preloader::new(
            cache.clone(),
            pipeline,
            Arc::clone(&governor),
            config.preload,
        );
        let navigation = Arc::new(NavigationController::new(
            cache.clone(),
            Arc::clone(&loader),
            preloader.clone(),
            Arc::clone(&governor),
            config.retry,
            &config.navigation,
            parts.observer,
        ));

        Self {
            cache,
            governor,
            loader,
            preloader,
            navigation,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Spawn the memory monitor and the pressure responder.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let pressure = self.governor.subscribe();
        self.tasks.push(
            self.cache
                .respond_to_pressure(pressure, self.shutdown.child_token()),
        );
        self.tasks
            .push(self.governor.spawn_monitor(self.shutdown.child_token()));
        tracing::info!(
            target: "image::governor",
            budget = %self.governor.memory_budget(),
            max_entries = self.cache.max_entries(),
            "viewer session started"
        );
    }

    /// Stop background tasks, abort loads and release every cached image.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.loader.cancel_current();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(
                    target: "image::governor",
                    "background task ended abnormally: {err}"
                );
            }
        }
        self.cache.clear();
        tracing::info!(target: "image::governor", "viewer session shut down");
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    pub fn preloader(&self) -> &Preloader {
        &self.preloader
    }

    pub fn navigation(&self) -> &Arc<NavigationController> {
        &self.navigation
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
