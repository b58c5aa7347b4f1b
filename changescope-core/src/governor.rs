//! Memory and network watchdog.
//!
//! The governor tracks hit/miss counters, load times and the network-quality
//! tier derived from them. A periodic check compares the cache's estimated
//! footprint and the process heap against their limits and broadcasts
//! [`MemoryPressure`] when either is too high.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use changescope_model::{AtomicNetworkQuality, NetworkQuality};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::ImageCache;
use crate::config::GovernorConfig;
use crate::units::ByteSize;

/// Signal sent to subscribers when memory is running short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Drop speculative work and halve the cache.
    AggressiveCleanup,
}

/// Heap usage as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    pub used: ByteSize,
    pub limit: ByteSize,
}

impl HeapUsage {
    pub fn ratio(&self) -> f64 {
        if self.limit.is_zero() {
            return 0.0;
        }
        self.used.as_bytes() as f64 / self.limit.as_bytes() as f64
    }
}

/// Source of heap usage figures. `None` means the platform can't say.
pub trait HeapProbe: Send + Sync {
    fn sample(&self) -> Option<HeapUsage>;
}

/// Reads resident memory of this process against a configured limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessHeapProbe {
    limit: Option<ByteSize>,
}

impl ProcessHeapProbe {
    pub fn new(limit: Option<ByteSize>) -> Self {
        Self { limit }
    }
}

impl HeapProbe for ProcessHeapProbe {
    fn sample(&self) -> Option<HeapUsage> {
        let limit = self.limit?;
        let stats = memory_stats::memory_stats()?;
        Some(HeapUsage {
            used: ByteSize::from_usize(stats.physical_mem),
            limit,
        })
    }
}

/// Counters and gauges reported alongside every successful display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookups.
    pub hit_rate: f64,
    pub total_load_time: Duration,
    pub loads_completed: u64,
    pub average_load_time: Duration,
    pub network_quality: NetworkQuality,
    pub memory_used: ByteSize,
    pub cached_entries: usize,
    pub preloads_in_flight: usize,
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    cache: ImageCache,
    probe: Arc<dyn HeapProbe>,
    quality: AtomicNetworkQuality,
    hits: AtomicU64,
    misses: AtomicU64,
    load_time_ms: AtomicU64,
    loads_completed: AtomicU64,
    pressure_tx: broadcast::Sender<MemoryPressure>,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("memory_budget", &self.config.memory_budget)
            .field("network_quality", &self.quality.load())
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    pub fn new(
        config: GovernorConfig,
        cache: ImageCache,
        probe: Arc<dyn HeapProbe>,
    ) -> Self {
        let (pressure_tx, _) = broadcast::channel(8);
        Self {
            config,
            cache,
            probe,
            quality: AtomicNetworkQuality::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            load_time_ms: AtomicU64::new(0),
            loads_completed: AtomicU64::new(0),
            pressure_tx,
        }
    }

    /// Governor probing this process with the configured heap limit.
    pub fn with_process_probe(
        config: GovernorConfig,
        cache: ImageCache,
    ) -> Self {
        let probe = Arc::new(ProcessHeapProbe::new(config.heap_limit));
        Self::new(config, cache, probe)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryPressure> {
        self.pressure_tx.subscribe()
    }

    pub fn memory_budget(&self) -> ByteSize {
        self.config.memory_budget
    }

    /// At or above 100% of the memory budget.
    pub fn is_over_budget(&self, used: ByteSize) -> bool {
        used >= self.config.memory_budget
    }

    pub fn network_quality(&self) -> NetworkQuality {
        self.quality.load()
    }

    pub fn set_network_quality(&self, quality: NetworkQuality) {
        let previous = self.quality.load();
        self.quality.store(quality);
        if previous != quality {
            tracing::info!(
                target: "image::governor",
                from = %previous,
                to = %quality,
                "network quality changed"
            );
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a completed load and reclassify the network from it.
    pub fn record_load(&self, load_time: Duration) {
        let ms = u64::try_from(load_time.as_millis()).unwrap_or(u64::MAX);
        self.load_time_ms.fetch_add(ms, Ordering::Relaxed);
        self.loads_completed.fetch_add(1, Ordering::Relaxed);
        self.set_network_quality(NetworkQuality::from_load_time(load_time));
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        let total_ms = self.load_time_ms.load(Ordering::Relaxed);
        let loads = self.loads_completed.load(Ordering::Relaxed);
        let average_ms = if loads == 0 { 0 } else { total_ms / loads };

        let stats = self.cache.stats();
        PerformanceSnapshot {
            cache_hits: hits,
            cache_misses: misses,
            hit_rate,
            total_load_time: Duration::from_millis(total_ms),
            loads_completed: loads,
            average_load_time: Duration::from_millis(average_ms),
            network_quality: self.quality.load(),
            memory_used: stats.estimated_memory,
            cached_entries: stats.entries,
            preloads_in_flight: self.cache.preloads().len(),
        }
    }

    /// Zero every counter and return the quality tier to its default.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.load_time_ms.store(0, Ordering::Relaxed);
        self.loads_completed.store(0, Ordering::Relaxed);
        self.quality.store(NetworkQuality::default());
    }

    /// Evaluate memory once, broadcasting pressure if needed.
    pub fn check_memory(&self) -> Option<MemoryPressure> {
        let cache_used = self.cache.estimate_memory();
        let cache_watermark =
            self.config.memory_budget.scaled(self.config.cache_pressure_ratio);
        let cache_pressure = cache_used > cache_watermark;

        let heap = self.probe.sample();
        let heap_pressure = heap
            .map(|usage| usage.ratio() > self.config.heap_pressure_ratio)
            .unwrap_or(false);

        if !cache_pressure && !heap_pressure {
            tracing::trace!(
                target: "image::governor",
                cache_used = %cache_used,
                "memory check ok"
            );
            return None;
        }

        tracing::warn!(
            target: "image::governor",
            cache_used = %cache_used,
            budget = %self.config.memory_budget,
            heap_used = ?heap.map(|usage| usage.used),
            heap_limit = ?heap.map(|usage| usage.limit),
            "memory pressure, requesting aggressive cleanup"
        );
        // No subscribers is fine; the check still reports pressure.
        let _ = self.pressure_tx.send(MemoryPressure::AggressiveCleanup);
        Some(MemoryPressure::AggressiveCleanup)
    }

    /// Run [`check_memory`](Self::check_memory) on the configured cadence
    /// until `shutdown` fires.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        let period = self.config.check_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(
                            target: "image::governor",
                            "memory monitor shutting down"
                        );
                        break;
                    }
                    _ = ticker.tick() => {
                        governor.check_memory();
                    }
                }
            }
        })
    }
}
