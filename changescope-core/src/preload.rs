//! Speculative background loads.
//!
//! Each admitted preload runs as its own task with its own cancellation
//! token, registered under its URL in a [`PreloadRegistry`] until it
//! finishes. Admission is cheap and best effort: a rejected request is simply
//! not loaded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use changescope_model::{CacheKey, NetworkQuality};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{EntryMetadata, ImageCache};
use crate::config::PreloadConfig;
use crate::governor::ResourceGovernor;
use crate::pipeline::ImagePipeline;

/// Why a preload was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadRejection {
    Disabled,
    Resident,
    OverBudget,
    CacheFull,
    InFlight,
    Saturated,
}

impl PreloadRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            PreloadRejection::Disabled => "disabled",
            PreloadRejection::Resident => "resident",
            PreloadRejection::OverBudget => "over_budget",
            PreloadRejection::CacheFull => "cache_full",
            PreloadRejection::InFlight => "in_flight",
            PreloadRejection::Saturated => "saturated",
        }
    }
}

impl fmt::Display for PreloadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct PreloadSlot {
    id: u64,
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    tasks: HashMap<String, PreloadSlot>,
}

/// In-flight preloads keyed by URL, at most one per URL.
#[derive(Debug, Clone, Default)]
pub struct PreloadRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl PreloadRegistry {
    /// Reserve `url` if it isn't already in flight and fewer than `limit`
    /// preloads are running.
    pub fn try_register(
        &self,
        url: &str,
        limit: usize,
    ) -> Result<PreloadTicket, PreloadRejection> {
        let mut state = self.state.lock();
        if state.tasks.contains_key(url) {
            return Err(PreloadRejection::InFlight);
        }
        if state.tasks.len() >= limit {
            return Err(PreloadRejection::Saturated);
        }

        state.next_id += 1;
        let id = state.next_id;
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        state.tasks.insert(
            url.to_string(),
            PreloadSlot {
                id,
                token: token.clone(),
                done: done_rx,
            },
        );

        Ok(PreloadTicket {
            registry: self.clone(),
            url: url.to_string(),
            id,
            token,
            done: done_tx,
        })
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.state.lock().tasks.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    /// Cancel and forget the preload for `url`.
    pub fn cancel(&self, url: &str) -> bool {
        let slot = self.state.lock().tasks.remove(url);
        match slot {
            Some(slot) => {
                slot.token.cancel();
                tracing::debug!(
                    target: "image::preload",
                    url,
                    "cancelled preload"
                );
                true
            }
            None => false,
        }
    }

    /// Cancel and forget every preload. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let slots: Vec<PreloadSlot> = {
            let mut state = self.state.lock();
            state.tasks.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.token.cancel();
        }
        slots.len()
    }

    /// Wait until the preload for `url` finishes.
    ///
    /// Returns `false` right away when nothing is in flight for `url`, and
    /// `false` if `cancel` fires first.
    pub async fn wait_for(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> bool {
        let done = self
            .state
            .lock()
            .tasks
            .get(url)
            .map(|slot| slot.done.clone());
        let Some(mut done) = done else {
            return false;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            // A dropped sender also means the task is gone.
            _ = done.wait_for(|finished| *finished) => true,
        }
    }

    fn finish(&self, url: &str, id: u64) {
        let mut state = self.state.lock();
        // A cancelled slot may already have been replaced by a newer one.
        if state.tasks.get(url).is_some_and(|slot| slot.id == id) {
            state.tasks.remove(url);
        }
    }
}

/// Registration of one running preload. Dropping it deregisters the URL and
/// wakes anyone waiting on it.
#[derive(Debug)]
pub struct PreloadTicket {
    registry: PreloadRegistry,
    url: String,
    id: u64,
    token: CancellationToken,
    done: watch::Sender<bool>,
}

impl PreloadTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for PreloadTicket {
    fn drop(&mut self) {
        self.registry.finish(&self.url, self.id);
        self.done.send_replace(true);
    }
}

/// One speculative load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadRequest {
    pub url: String,
    pub key: CacheKey,
    /// 2..=5, lower first.
    pub priority: u8,
    /// e.g. `"preload-post"` or `"preload-next"`.
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct Preloader {
    cache: ImageCache,
    pipeline: ImagePipeline,
    governor: Arc<ResourceGovernor>,
    config: PreloadConfig,
}

impl Preloader {
    pub fn new(
        cache: ImageCache,
        pipeline: ImagePipeline,
        governor: Arc<ResourceGovernor>,
        config: PreloadConfig,
    ) -> Self {
        Self {
            cache,
            pipeline,
            governor,
            config,
        }
    }

    /// Start a background load of `request` if admitted. Never fails; a
    /// rejected or failed preload simply leaves the cache untouched.
    pub fn preload(&self, request: PreloadRequest) -> bool {
        match self.admit(&request) {
            Ok(ticket) => {
                tracing::debug!(
                    target: "image::preload",
                    url = %request.url,
                    priority = request.priority,
                    context = %request.context,
                    "preload started"
                );
                let preloader = self.clone();
                tokio::spawn(async move {
                    preloader.run(request, ticket).await
                });
                true
            }
            Err(reason) => {
                tracing::trace!(
                    target: "image::preload",
                    url = %request.url,
                    reason = %reason,
                    "preload skipped"
                );
                false
            }
        }
    }

    /// Submit a batch in order. Returns how many were admitted.
    pub fn preload_batch(
        &self,
        requests: impl IntoIterator<Item = PreloadRequest>,
    ) -> usize {
        requests
            .into_iter()
            .map(|request| self.preload(request))
            .filter(|admitted| *admitted)
            .count()
    }

    pub fn cancel(&self, url: &str) -> bool {
        self.cache.preloads().cancel(url)
    }

    pub fn cancel_all(&self) -> usize {
        self.cache.preloads().cancel_all()
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.cache.preloads().is_in_flight(url)
    }

    pub fn in_flight_count(&self) -> usize {
        self.cache.preloads().len()
    }

    pub async fn wait_for(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> bool {
        self.cache.preloads().wait_for(url, cancel).await
    }

    fn admit(
        &self,
        request: &PreloadRequest,
    ) -> Result<PreloadTicket, PreloadRejection> {
        if !self.config.enabled {
            return Err(PreloadRejection::Disabled);
        }
        if self.cache.has(&request.key) {
            return Err(PreloadRejection::Resident);
        }
        if self.governor.is_over_budget(self.cache.estimate_memory()) {
            return Err(PreloadRejection::OverBudget);
        }
        if self.cache.is_full() {
            return Err(PreloadRejection::CacheFull);
        }
        self.cache
            .preloads()
            .try_register(&request.url, self.config.max_concurrent)
    }

    async fn run(self, request: PreloadRequest, ticket: PreloadTicket) {
        let started = Instant::now();
        let token = ticket.token().clone();

        match self.pipeline.fetch_and_decode(&request.url, &token).await {
            Ok(loaded) => {
                let load_time = started.elapsed();
                let metadata = EntryMetadata::new(
                    &request.url,
                    request.priority,
                    &request.context,
                )
                .with_load_time(load_time)
                .with_image_size(Some(loaded.total_bytes));
                let inserted = self.cache.insert_unless_cancelled(
                    &token,
                    request.key.clone(),
                    loaded.image,
                    loaded.blob,
                    metadata,
                );
                if inserted.is_none() {
                    tracing::debug!(
                        target: "image::preload",
                        url = %request.url,
                        "preload cancelled after decode"
                    );
                } else {
                    self.governor.set_network_quality(
                        NetworkQuality::from_load_time(load_time),
                    );
                    tracing::debug!(
                        target: "image::preload",
                        url = %request.url,
                        context = %request.context,
                        load_ms = load_time.as_millis() as u64,
                        "preload cached"
                    );
                }
            }
            Err(err) if err.is_cancelled() => {
                tracing::debug!(
                    target: "image::preload",
                    url = %request.url,
                    "preload cancelled"
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: "image::preload",
                    url = %request.url,
                    kind = err.kind(),
                    error = %err,
                    "preload failed"
                );
            }
        }

        // Deregister only after the entry is visible to waiters.
        drop(ticket);
    }
}
