//! Dataset navigation and display orchestration.
//!
//! The controller decides what the user sees: it consults the cache, joins
//! an in-flight preload or starts the main load, retries failures with
//! backoff and fires the preload batch after every successful display. Every
//! call to [`NavigationController::show`] carries its own [`DisplayRequest`];
//! a newer call supersedes an older one, which then ends silently.

mod observer;
mod plan;
mod retry;

pub use observer::{
    DisplayedImage, NavigationObserver, NavigationStatus, NoopObserver,
};
pub use plan::preload_plan;
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use changescope_model::{DatasetRecord, ImageRef, ImageVariant};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::{CachedImage, ImageCache};
use crate::config::{NavigationConfig, RetryConfig};
use crate::error::{ImageLoadError, ListingError, Result};
use crate::governor::ResourceGovernor;
use crate::listing::DatasetSource;
use crate::loader::Loader;
use crate::preload::Preloader;

/// Which image to show and under which viewing flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayRequest {
    pub index: usize,
    pub variant: ImageVariant,
    pub full_resolution: bool,
    pub veg_filter: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavigationState {
    NoDataset,
    /// Showing `request`, or failed on it when `retry_available` is set.
    Idle {
        request: DisplayRequest,
        retry_available: bool,
    },
    Loading {
        request: DisplayRequest,
        attempt: u32,
    },
    ErrorRetrying {
        request: DisplayRequest,
        attempt: u32,
        delay: Duration,
    },
}

/// How a navigation call ended.
#[derive(Debug, Clone)]
pub enum ShowOutcome {
    Displayed(DisplayedImage),
    /// A newer request took over; nothing was reported for this one.
    Superseded,
    /// Retries exhausted. The manual retry affordance is now shown.
    Failed(ImageLoadError),
    /// No datasets are loaded.
    NoDataset,
    /// The requested index is outside the listing.
    OutOfRange,
}

impl ShowOutcome {
    pub fn is_displayed(&self) -> bool {
        matches!(self, ShowOutcome::Displayed(_))
    }
}

#[derive(Debug)]
struct NavigationInner {
    datasets: Arc<Vec<DatasetRecord>>,
    state: NavigationState,
    current: DisplayRequest,
    generation: u64,
    token: Option<CancellationToken>,
}

pub struct NavigationController {
    cache: ImageCache,
    loader: Arc<Loader>,
    preloader: Preloader,
    governor: Arc<ResourceGovernor>,
    retry: RetryPolicy,
    settle_delay: Duration,
    observer: Arc<dyn NavigationObserver>,
    inner: Mutex<NavigationInner>,
}

impl std::fmt::Debug for NavigationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NavigationController")
            .field("datasets", &inner.datasets.len())
            .field("state", &inner.state)
            .finish_non_exhaustive()
    }
}

/// Per-call identity used to drop stale updates.
struct ShowTicket {
    generation: u64,
    token: CancellationToken,
    record: DatasetRecord,
    datasets: Arc<Vec<DatasetRecord>>,
}

impl NavigationController {
    pub fn new(
        cache: ImageCache,
        loader: Arc<Loader>,
        preloader: Preloader,
        governor: Arc<ResourceGovernor>,
        retry: RetryConfig,
        navigation: &NavigationConfig,
        observer: Arc<dyn NavigationObserver>,
    ) -> Self {
        Self {
            cache,
            loader,
            preloader,
            governor,
            retry: RetryPolicy::new(retry),
            settle_delay: navigation.fit_settle_delay(),
            observer,
            inner: Mutex::new(NavigationInner {
                datasets: Arc::new(Vec::new()),
                state: NavigationState::NoDataset,
                current: DisplayRequest::default(),
                generation: 0,
                token: None,
            }),
        }
    }

    pub fn state(&self) -> NavigationState {
        self.inner.lock().state.clone()
    }

    /// The most recently requested display.
    pub fn current_request(&self) -> DisplayRequest {
        self.inner.lock().current
    }

    pub fn dataset_count(&self) -> usize {
        self.inner.lock().datasets.len()
    }

    pub fn datasets(&self) -> Arc<Vec<DatasetRecord>> {
        Arc::clone(&self.inner.lock().datasets)
    }

    /// Replace the listing and show its first entry, keeping the current
    /// variant and viewing flags.
    pub async fn set_datasets(
        &self,
        records: Vec<DatasetRecord>,
    ) -> ShowOutcome {
        let request = {
            let mut inner = self.inner.lock();
            inner.datasets = Arc::new(records);
            if inner.datasets.is_empty() {
                inner.generation += 1;
                if let Some(token) = inner.token.take() {
                    token.cancel();
                }
                inner.state = NavigationState::NoDataset;
                None
            } else {
                Some(DisplayRequest {
                    index: 0,
                    ..inner.current
                })
            }
        };

        match request {
            Some(request) => {
                tracing::info!(
                    target: "dataset::listing",
                    count = self.dataset_count(),
                    "datasets loaded"
                );
                self.show(request).await
            }
            None => {
                self.observer.status(&NavigationStatus::NoDatasets);
                ShowOutcome::NoDataset
            }
        }
    }

    /// Fetch the listing from `source`, then behave like
    /// [`set_datasets`](Self::set_datasets).
    pub async fn load_datasets(
        &self,
        source: &dyn DatasetSource,
    ) -> std::result::Result<ShowOutcome, ListingError> {
        let records = source.list_datasets().await?;
        Ok(self.set_datasets(records).await)
    }

    pub async fn next(&self) -> ShowOutcome {
        let request = self.current_request();
        self.show(DisplayRequest {
            index: request.index.saturating_add(1),
            ..request
        })
        .await
    }

    pub async fn previous(&self) -> ShowOutcome {
        let request = self.current_request();
        match request.index.checked_sub(1) {
            Some(index) => self.show(DisplayRequest { index, ..request }).await,
            None => ShowOutcome::OutOfRange,
        }
    }

    pub async fn select_variant(&self, variant: ImageVariant) -> ShowOutcome {
        let request = self.current_request();
        self.show(DisplayRequest { variant, ..request }).await
    }

    pub async fn set_full_resolution(
        &self,
        full_resolution: bool,
    ) -> ShowOutcome {
        let request = self.current_request();
        self.show(DisplayRequest {
            full_resolution,
            ..request
        })
        .await
    }

    pub async fn set_veg_filter(&self, veg_filter: bool) -> ShowOutcome {
        let request = self.current_request();
        self.show(DisplayRequest {
            veg_filter,
            ..request
        })
        .await
    }

    /// Manual retry of the current request with a fresh attempt budget.
    pub async fn retry(&self) -> ShowOutcome {
        let request = self.current_request();
        self.show(request).await
    }

    /// Show `request`, superseding any navigation still in progress.
    pub async fn show(&self, request: DisplayRequest) -> ShowOutcome {
        let ticket = match self.begin(request) {
            Ok(ticket) => ticket,
            Err(outcome) => return outcome,
        };
        let image = ticket.record.image_ref(
            request.variant,
            request.full_resolution,
            request.veg_filter,
        );

        let mut attempt = 0u32;
        let mut reloaded_invalid = false;
        loop {
            match self.resolve(&ticket, request, &image, attempt).await {
                Ok((cached, from_cache)) => {
                    return self
                        .finish_display(&ticket, request, cached, from_cache)
                        .await;
                }
                Err(err) if !err.is_retryable() => {
                    return ShowOutcome::Superseded;
                }
                Err(err @ ImageLoadError::CacheInvalid(_))
                    if !reloaded_invalid =>
                {
                    tracing::warn!(
                        target: "image::cache",
                        key = %image.key,
                        error = %err,
                        "cached image invalid, reloading"
                    );
                    reloaded_invalid = true;
                }
                Err(err) => {
                    attempt += 1;
                    let quality = self.governor.network_quality();
                    let max_attempts = self.retry.max_attempts(quality);
                    let Some(delay) = self.retry.delay(attempt, quality) else {
                        return self.give_up(&ticket, request, err);
                    };

                    tracing::warn!(
                        target: "image::load",
                        url = %image.url,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        quality = %quality,
                        error = %err,
                        "load failed, retrying"
                    );
                    let retrying = NavigationState::ErrorRetrying {
                        request,
                        attempt,
                        delay,
                    };
                    if !self.transition(&ticket, retrying) {
                        return ShowOutcome::Superseded;
                    }
                    self.observer.status(&NavigationStatus::Retrying {
                        attempt,
                        max_attempts,
                        delay,
                    });

                    tokio::select! {
                        biased;
                        _ = ticket.token.cancelled() => {
                            return ShowOutcome::Superseded;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn begin(
        &self,
        request: DisplayRequest,
    ) -> std::result::Result<ShowTicket, ShowOutcome> {
        let mut inner = self.inner.lock();
        if inner.datasets.is_empty() {
            return Err(ShowOutcome::NoDataset);
        }
        let Some(record) = inner.datasets.get(request.index).cloned() else {
            return Err(ShowOutcome::OutOfRange);
        };

        inner.generation += 1;
        let token = CancellationToken::new();
        if let Some(previous) = inner.token.replace(token.clone()) {
            previous.cancel();
        }
        inner.current = request;
        Ok(ShowTicket {
            generation: inner.generation,
            token,
            record,
            datasets: Arc::clone(&inner.datasets),
        })
    }

    /// Set `state` if `ticket` is still the latest request.
    fn transition(&self, ticket: &ShowTicket, state: NavigationState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != ticket.generation || ticket.token.is_cancelled()
        {
            return false;
        }
        inner.state = state;
        true
    }

    async fn resolve(
        &self,
        ticket: &ShowTicket,
        request: DisplayRequest,
        image: &ImageRef,
        attempt: u32,
    ) -> Result<(CachedImage, bool)> {
        if let Some(cached) = self.cache.get(&image.key) {
            if cached.is_valid() {
                self.governor.record_hit();
                return Ok((cached, true));
            }
            self.cache.delete(&image.key);
            return Err(ImageLoadError::CacheInvalid(format!(
                "{} reports no dimensions",
                image.key
            )));
        }
        // One miss per show, however many retries it takes.
        if attempt == 0 {
            self.governor.record_miss();
        }

        let loading = NavigationState::Loading { request, attempt };
        if !self.transition(ticket, loading) {
            return Err(ImageLoadError::Cancelled);
        }
        self.observer.status(&NavigationStatus::Loading {
            dataset: ticket.record.display_name(),
            variant: request.variant,
        });

        if self.preloader.is_in_flight(&image.url) {
            tracing::debug!(
                target: "image::load",
                url = %image.url,
                "joining in-flight preload"
            );
            self.preloader.wait_for(&image.url, &ticket.token).await;
            if ticket.token.is_cancelled() {
                return Err(ImageLoadError::Cancelled);
            }
            if let Some(cached) = self.cache.get(&image.key)
                && cached.is_valid()
            {
                return Ok((cached, false));
            }
        }

        let observer = Arc::clone(&self.observer);
        let load = self.loader.load(&image.url, &image.key, move |progress| {
            observer.progress(&progress)
        });
        // Dropping the load future releases anything it had built.
        let cached = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => {
                return Err(ImageLoadError::Cancelled);
            }
            loaded = load => loaded?,
        };
        Ok((cached, false))
    }

    async fn finish_display(
        &self,
        ticket: &ShowTicket,
        request: DisplayRequest,
        image: CachedImage,
        from_cache: bool,
    ) -> ShowOutcome {
        let idle = NavigationState::Idle {
            request,
            retry_available: false,
        };
        if !self.transition(ticket, idle) {
            return ShowOutcome::Superseded;
        }

        let displayed = DisplayedImage {
            request,
            dataset_id: ticket.record.id,
            image,
            from_cache,
        };
        self.observer.display(&displayed);
        self.observer.status(&NavigationStatus::Displayed {
            dataset: ticket.record.display_name(),
            variant: request.variant,
            from_cache,
        });
        self.observer.retry_available(false);
        self.observer
            .position(request.index, ticket.datasets.len());
        self.observer.highlight(ticket.record.id);
        self.observer.snapshot(&self.governor.snapshot());

        let admitted = self
            .preloader
            .preload_batch(preload_plan(&ticket.datasets, &request));
        tracing::debug!(
            target: "image::preload",
            index = request.index,
            variant = %request.variant,
            admitted,
            "preload batch issued"
        );

        tokio::select! {
            biased;
            _ = ticket.token.cancelled() => {}
            _ = tokio::time::sleep(self.settle_delay) => {
                self.observer.fit_to_view();
            }
        }

        ShowOutcome::Displayed(displayed)
    }

    fn give_up(
        &self,
        ticket: &ShowTicket,
        request: DisplayRequest,
        err: ImageLoadError,
    ) -> ShowOutcome {
        let idle = NavigationState::Idle {
            request,
            retry_available: true,
        };
        if !self.transition(ticket, idle) {
            return ShowOutcome::Superseded;
        }
        tracing::error!(
            target: "image::load",
            dataset = ticket.record.id,
            variant = %request.variant,
            kind = err.kind(),
            error = %err,
            "giving up on image after retries"
        );
        self.observer.status(&NavigationStatus::Failed {
            reason: err.to_string(),
        });
        self.observer.retry_available(true);
        ShowOutcome::Failed(err)
    }
}
