//! Streaming image fetches.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ImageLoadError, Result};

/// Body chunks of an in-flight fetch.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Response head plus the streamed body.
pub struct FetchResponse {
    /// `Content-Length`, when the server sent one.
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

impl FetchResponse {
    /// Drain the body, stopping early if `cancel` fires.
    pub async fn collect(self, cancel: &CancellationToken) -> Result<Bytes> {
        let capacity = self.total_bytes.unwrap_or(0).min(64 * 1024 * 1024);
        let mut buffer = BytesMut::with_capacity(capacity as usize);
        let mut body = self.body;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ImageLoadError::Cancelled),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => return Ok(buffer.freeze()),
            }
        }
    }
}

/// Source of image bytes.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Start fetching `url`. Implementations should give up promptly once
    /// `cancel` fires.
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse>;
}

/// HTTP-based image fetcher with connection pooling.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
    base_url: Option<Url>,
    auth_header: Option<String>,
}

impl HttpImageFetcher {
    pub fn new(
        base_url: Option<Url>,
        auth_header: Option<String>,
        request_timeout: Duration,
    ) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(request_timeout)
            .build()?;

        Ok(Self::with_client(client, base_url, auth_header))
    }

    pub fn with_client(
        client: Client,
        base_url: Option<Url>,
        auth_header: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url,
            auth_header,
        }
    }

    /// Absolute URLs pass through; relative ones are joined onto the base.
    pub fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .as_ref()
                .ok_or_else(|| {
                    ImageLoadError::Network(format!(
                        "relative image URL without a server base: {url}"
                    ))
                })?
                .join(url)
                .map_err(|e| ImageLoadError::Network(e.to_string())),
            Err(e) => Err(ImageLoadError::Network(e.to_string())),
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse> {
        let target = self.resolve_url(url)?;
        let mut request = self.client.get(target.clone());
        if let Some(ref header) = self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ImageLoadError::Cancelled),
            response = request.send() => {
                response.map_err(|e| ImageLoadError::Network(e.to_string()))?
            }
        };

        if !response.status().is_success() {
            return Err(ImageLoadError::Network(format!(
                "HTTP {}: {}",
                response.status(),
                target
            )));
        }

        let total_bytes = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| ImageLoadError::Network(e.to_string()))
            })
            .boxed();

        Ok(FetchResponse { total_bytes, body })
    }
}
