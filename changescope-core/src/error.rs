use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the loader, preloader and navigation layers.
#[derive(Debug, Clone, Error)]
pub enum ImageLoadError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode timed out after {0:?}")]
    Timeout(Duration),

    #[error("Decode error: {0}")]
    Decode(String),

    /// The load's token was aborted, usually because a newer request
    /// superseded it.
    #[error("Cancelled")]
    Cancelled,

    #[error("Cached image is no longer valid: {0}")]
    CacheInvalid(String),
}

impl ImageLoadError {
    /// Cancellation is an intentional outcome and never consumes a retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ImageLoadError::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImageLoadError::Cancelled)
    }

    /// Short stable label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ImageLoadError::Network(_) => "network",
            ImageLoadError::Timeout(_) => "timeout",
            ImageLoadError::Decode(_) => "decode",
            ImageLoadError::Cancelled => "cancelled",
            ImageLoadError::CacheInvalid(_) => "cache_invalid",
        }
    }
}

/// Result type for image pipeline operations
pub type Result<T> = std::result::Result<T, ImageLoadError>;

/// Failures while fetching the dataset listing.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("Invalid listing URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Listing endpoint returned {status}: {url}")]
    Status { status: u16, url: String },
}
