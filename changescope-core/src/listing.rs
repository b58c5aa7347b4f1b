//! Dataset listing client.

use async_trait::async_trait;
use changescope_model::DatasetRecord;
use reqwest::Client;
use url::Url;

use crate::error::ListingError;

/// Source of the ordered dataset listing.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn list_datasets(&self) -> Result<Vec<DatasetRecord>, ListingError>;
}

/// Fetches the listing as JSON from the server.
#[derive(Debug, Clone)]
pub struct HttpDatasetSource {
    client: Client,
    endpoint: Url,
    auth_header: Option<String>,
}

impl HttpDatasetSource {
    pub fn new(
        client: Client,
        server_url: &Url,
        listing_path: &str,
        auth_header: Option<String>,
    ) -> Result<Self, ListingError> {
        Ok(Self {
            client,
            endpoint: server_url.join(listing_path)?,
            auth_header,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl DatasetSource for HttpDatasetSource {
    async fn list_datasets(&self) -> Result<Vec<DatasetRecord>, ListingError> {
        let mut request = self.client.get(self.endpoint.clone());
        if let Some(ref header) = self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ListingError::Status {
                status: response.status().as_u16(),
                url: self.endpoint.to_string(),
            });
        }

        let records: Vec<DatasetRecord> = response.json().await?;
        tracing::info!(
            target: "dataset::listing",
            count = records.len(),
            endpoint = %self.endpoint,
            "loaded dataset listing"
        );
        Ok(records)
    }
}

/// Fixed listing, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDatasetSource {
    records: Vec<DatasetRecord>,
}

impl StaticDatasetSource {
    pub fn new(records: Vec<DatasetRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl DatasetSource for StaticDatasetSource {
    async fn list_datasets(&self) -> Result<Vec<DatasetRecord>, ListingError> {
        Ok(self.records.clone())
    }
}
