//! Fetch, register and decode steps shared by the main loader and preloads.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::blob::{BlobHandle, BlobStore};
use crate::decode::{DecodedImage, ImageDecoder};
use crate::error::{ImageLoadError, Result};
use crate::fetch::{FetchResponse, ImageFetcher};

/// A decoded image and the blob that backs it, ready for the cache.
#[derive(Debug)]
pub struct LoadedImage {
    pub image: DecodedImage,
    pub blob: BlobHandle,
    /// Bytes actually downloaded.
    pub total_bytes: u64,
}

#[derive(Clone)]
pub struct ImagePipeline {
    fetcher: Arc<dyn ImageFetcher>,
    decoder: Arc<dyn ImageDecoder>,
    blobs: Arc<dyn BlobStore>,
    decode_timeout: Duration,
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("blobs", &self.blobs)
            .field("decode_timeout", &self.decode_timeout)
            .finish_non_exhaustive()
    }
}

impl ImagePipeline {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        decoder: Arc<dyn ImageDecoder>,
        blobs: Arc<dyn BlobStore>,
        decode_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            decoder,
            blobs,
            decode_timeout,
        }
    }

    pub fn decode_timeout(&self) -> Duration {
        self.decode_timeout
    }

    pub async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse> {
        self.fetcher.fetch(url, cancel).await
    }

    pub fn register(&self, bytes: Bytes) -> BlobHandle {
        BlobHandle::create(&self.blobs, bytes)
    }

    /// Decode `blob`, bounded by the decode timeout and by `cancel`.
    ///
    /// On any failure the blob is released before returning.
    pub async fn decode(
        &self,
        blob: &BlobHandle,
        cancel: &CancellationToken,
    ) -> Result<DecodedImage> {
        let decode = tokio::time::timeout(
            self.decode_timeout,
            self.decoder.decode(blob),
        );
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ImageLoadError::Cancelled),
            decoded = decode => decoded.unwrap_or(Err(
                ImageLoadError::Timeout(self.decode_timeout),
            )),
        };

        if outcome.is_err() {
            blob.release();
        }
        outcome
    }

    /// Whole-body fetch followed by decode. Used where no progress is needed.
    pub async fn fetch_and_decode(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<LoadedImage> {
        let response = self.fetch(url, cancel).await?;
        let bytes = response.collect(cancel).await?;
        let total_bytes = bytes.len() as u64;
        let blob = self.register(bytes);
        let image = self.decode(&blob, cancel).await?;
        Ok(LoadedImage {
            image,
            blob,
            total_bytes,
        })
    }
}
