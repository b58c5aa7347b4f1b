use std::fmt;
use std::time::Duration;

use changescope_model::ImageVariant;

use super::DisplayRequest;
use crate::cache::CachedImage;
use crate::governor::PerformanceSnapshot;
use crate::progress::LoadProgress;

/// User-facing status line.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationStatus {
    NoDatasets,
    Loading {
        dataset: String,
        variant: ImageVariant,
    },
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Failed {
        reason: String,
    },
    Displayed {
        dataset: String,
        variant: ImageVariant,
        from_cache: bool,
    },
}

impl fmt::Display for NavigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigationStatus::NoDatasets => {
                f.write_str("No datasets available")
            }
            NavigationStatus::Loading { dataset, variant } => {
                write!(f, "Loading {variant} image for {dataset}...")
            }
            NavigationStatus::Retrying {
                attempt,
                max_attempts,
                delay,
            } => write!(
                f,
                "Load failed, retrying in {:.1}s ({attempt}/{max_attempts})",
                delay.as_secs_f64()
            ),
            NavigationStatus::Failed { reason } => {
                write!(f, "Failed to load image: {reason}")
            }
            NavigationStatus::Displayed {
                dataset,
                variant,
                from_cache,
            } => {
                write!(f, "{dataset}: {variant}")?;
                if *from_cache {
                    f.write_str(" (cached)")?;
                }
                Ok(())
            }
        }
    }
}

/// A successfully displayed image.
#[derive(Debug, Clone)]
pub struct DisplayedImage {
    pub request: DisplayRequest,
    pub dataset_id: u64,
    pub image: CachedImage,
    pub from_cache: bool,
}

/// Receives every display-side effect of navigation. All methods default to
/// no-ops so implementors pick what they render.
pub trait NavigationObserver: Send + Sync {
    fn status(&self, _status: &NavigationStatus) {}

    fn progress(&self, _progress: &LoadProgress) {}

    fn display(&self, _displayed: &DisplayedImage) {}

    /// `index` is zero-based.
    fn position(&self, _index: usize, _total: usize) {}

    /// Highlight overlay keyed by dataset id.
    fn highlight(&self, _dataset_id: u64) {}

    fn snapshot(&self, _snapshot: &PerformanceSnapshot) {}

    fn retry_available(&self, _available: bool) {}

    /// Fired after the settle delay that follows a display.
    fn fit_to_view(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl NavigationObserver for NoopObserver {}
