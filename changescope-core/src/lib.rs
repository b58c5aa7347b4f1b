//! Client-side image cache and prefetch core for the changescope viewer.
//!
//! The viewer walks a listing of datasets, each publishing a pre-event, a
//! post-event and a change-detection image. This crate keeps recently decoded
//! images in a bounded FIFO cache, loads the displayed image with progress
//! reporting and retries, speculatively preloads its neighbours and sheds
//! memory when a [`governor::ResourceGovernor`] signals pressure.
#![allow(missing_docs)]

pub mod blob;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod governor;
pub mod listing;
pub mod loader;
pub mod navigation;
pub mod pipeline;
pub mod preload;
pub mod progress;
pub mod session;
pub mod units;

pub use cache::{CacheStats, CachedImage, EntryMetadata, ImageCache};
pub use config::{ConfigSource, ViewerConfig};
pub use error::{ImageLoadError, ListingError, Result};
pub use governor::{MemoryPressure, PerformanceSnapshot, ResourceGovernor};
pub use loader::Loader;
pub use navigation::{
    DisplayRequest, NavigationController, NavigationObserver, NavigationState,
    ShowOutcome,
};
pub use preload::{PreloadRequest, Preloader};
pub use progress::LoadProgress;
pub use session::{SessionParts, ViewerSession};
pub use units::ByteSize;
