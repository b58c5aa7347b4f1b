//! Headless changescope viewer.
//!
//! Loads the dataset listing, then walks it through the same cache, preload
//! and retry machinery an interactive client uses, logging every status
//! change and finishing with a performance summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use changescope_core::blob::InMemoryBlobStore;
use changescope_core::config::{ConfigSource, ViewerConfig};
use changescope_core::decode::RasterDecoder;
use changescope_core::fetch::HttpImageFetcher;
use changescope_core::listing::HttpDatasetSource;
use changescope_core::navigation::{
    DisplayedImage, NavigationObserver, NavigationStatus,
};
use changescope_core::progress::LoadProgress;
use changescope_core::{
    PerformanceSnapshot, SessionParts, ShowOutcome, ViewerSession,
};
use changescope_model::ImageVariant;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "changescope-viewer")]
#[command(
    about = "Walk a change-detection dataset listing through the image cache"
)]
struct Cli {
    /// Config file (TOML or JSON). Falls back to $CHANGESCOPE_CONFIG_PATH,
    /// $CHANGESCOPE_CONFIG_JSON, then ./changescope.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server base URL (overrides config)
    #[arg(long, env = "CHANGESCOPE_SERVER_URL")]
    server_url: Option<String>,

    /// Maximum cached images (overrides config)
    #[arg(long)]
    cache_size: Option<usize>,

    /// Authorization header sent with every request (overrides config)
    #[arg(long, env = "CHANGESCOPE_AUTH_HEADER", hide_env_values = true)]
    auth_header: Option<String>,

    /// Entries to advance through after the first one
    #[arg(long, default_value_t = 4)]
    steps: usize,

    /// Also show the post-event and change images of every entry
    #[arg(long, default_value_t = false)]
    all_variants: bool,

    /// Request full-resolution images
    #[arg(long, default_value_t = false)]
    full_resolution: bool,

    /// Pause between navigation steps, giving preloads time to land
    #[arg(long, default_value_t = 250)]
    dwell_ms: u64,
}

/// Logs display side effects instead of rendering them.
#[derive(Debug, Default)]
struct LogObserver;

impl NavigationObserver for LogObserver {
    fn status(&self, status: &NavigationStatus) {
        match status {
            NavigationStatus::Failed { .. } => {
                warn!(target: "viewer", "{status}")
            }
            _ => info!(target: "viewer", "{status}"),
        }
    }

    fn progress(&self, progress: &LoadProgress) {
        tracing::debug!(
            target: "viewer",
            percent = progress.percent.round() as u64,
            kib_per_sec = (progress.bytes_per_second / 1024.0).round() as u64,
            eta_secs = ?progress
                .eta_secs
                .map(|eta| (eta * 10.0).round() / 10.0),
            "downloading"
        );
    }

    fn display(&self, displayed: &DisplayedImage) {
        let (width, height) = displayed.image.natural_dimensions();
        info!(
            target: "viewer",
            dataset = displayed.dataset_id,
            variant = %displayed.request.variant,
            width,
            height,
            from_cache = displayed.from_cache,
            "displayed"
        );
    }

    fn position(&self, index: usize, total: usize) {
        info!(target: "viewer", "{} / {}", index + 1, total);
    }

    fn retry_available(&self, available: bool) {
        if available {
            warn!(target: "viewer", "manual retry available");
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<(ViewerConfig, ConfigSource)> {
    let (mut config, source) = match cli.config.as_ref() {
        Some(path) => (
            ViewerConfig::load_from_file(path)?,
            ConfigSource::File(path.clone()),
        ),
        None => ViewerConfig::load_from_env()?,
    };

    if let Some(url) = cli.server_url.clone() {
        config.server.url = url;
    }
    if let Some(size) = cli.cache_size {
        config.cache.max_entries = size;
    }
    if let Some(header) = cli.auth_header.clone() {
        config.server.auth_header = Some(header);
    }
    Ok((config, source))
}

fn log_summary(snapshot: &PerformanceSnapshot) {
    info!(
        target: "viewer",
        hits = snapshot.cache_hits,
        misses = snapshot.cache_misses,
        hit_rate = snapshot.hit_rate,
        loads = snapshot.loads_completed,
        avg_load_ms = snapshot.average_load_time.as_millis() as u64,
        quality = %snapshot.network_quality,
        memory = %snapshot.memory_used,
        entries = snapshot.cached_entries,
        preloads_in_flight = snapshot.preloads_in_flight,
        "performance summary"
    );
}

async fn walk(session: &ViewerSession, cli: &Cli) {
    let nav = session.navigation();
    let dwell = Duration::from_millis(cli.dwell_ms);

    if cli.full_resolution {
        nav.set_full_resolution(true).await;
    }

    for step in 0..=cli.steps {
        if step > 0 {
            match nav.next().await {
                ShowOutcome::OutOfRange => {
                    info!(target: "viewer", "reached the end of the listing");
                    break;
                }
                ShowOutcome::Failed(err) => {
                    warn!(target: "viewer", "entry failed: {err}");
                }
                _ => {}
            }
        }
        tokio::time::sleep(dwell).await;

        if cli.all_variants {
            for variant in
                [ImageVariant::PostEvent, ImageVariant::ChangeDetection]
            {
                nav.select_variant(variant).await;
                tokio::time::sleep(dwell).await;
            }
            nav.select_variant(ImageVariant::PreEvent).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, source) = load_config(&cli)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    // Override via RUST_LOG.
                    "info,image::cache=info,image::preload=info,reqwest=warn"
                        .into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &source {
        ConfigSource::Default => info!("using default viewer configuration"),
        ConfigSource::EnvInline => {
            info!("loaded viewer configuration from environment")
        }
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!("loaded viewer configuration from {}", path.display())
        }
    }
    for warning in config.warnings() {
        match warning.hint {
            Some(hint) => warn!("{} ({hint})", warning.message),
            None => warn!("{}", warning.message),
        }
    }

    let server_url = Url::parse(&config.server.url)
        .with_context(|| format!("invalid server url {}", config.server.url))?;
    let fetcher = HttpImageFetcher::new(
        Some(server_url.clone()),
        config.server.auth_header.clone(),
        config.server.request_timeout(),
    )
    .context("failed to build HTTP client")?;
    let listing = HttpDatasetSource::new(
        reqwest::Client::new(),
        &server_url,
        &config.server.listing_path,
        config.server.auth_header.clone(),
    )?;

    let mut session = ViewerSession::new(
        &config,
        SessionParts {
            fetcher: Arc::new(fetcher),
            decoder: Arc::new(RasterDecoder),
            blobs: Arc::new(InMemoryBlobStore::new()),
            observer: Arc::new(LogObserver),
            heap_probe: None,
        },
    );
    session.start();

    let outcome = session
        .navigation()
        .load_datasets(&listing)
        .await
        .with_context(|| {
            format!("failed to load datasets from {}", listing.endpoint())
        })?;

    match outcome {
        ShowOutcome::NoDataset => warn!("server returned no datasets"),
        ShowOutcome::Failed(err) => warn!("first entry failed to load: {err}"),
        _ => walk(&session, &cli).await,
    }

    log_summary(&session.governor().snapshot());
    session.shutdown().await;
    Ok(())
}
