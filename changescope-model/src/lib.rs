//! Core data model definitions shared across changescope crates.
#![allow(missing_docs)]

pub mod cache_key;
pub mod dataset;
pub mod network;
pub mod variant;

// Intentionally curated re-exports for downstream consumers.
pub use cache_key::CacheKey;
pub use dataset::{
    DatasetRecord, ImageRef, ResolutionPair, VariantSource, VariantUrls,
};
pub use network::{AtomicNetworkQuality, NetworkQuality};
pub use variant::ImageVariant;
