//! Dataset listing records as published by the dataset endpoint.

use crate::{CacheKey, ImageVariant};

/// Full-size and half-size URLs for one rendering of an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolutionPair {
    pub full: String,
    pub downsampled: String,
}

impl ResolutionPair {
    pub fn pick(&self, full_resolution: bool) -> &str {
        if full_resolution {
            &self.full
        } else {
            &self.downsampled
        }
    }
}

/// Resolution variants for one image, with an optional vegetation-suppressed
/// rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct VariantUrls {
    pub full: String,
    pub downsampled: String,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub veg_filter: Option<ResolutionPair>,
}

/// Where an image variant can be fetched from.
///
/// Older datasets publish a single URL; newer ones publish resolution and
/// vegetation-filter variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(untagged)
)]
pub enum VariantSource {
    Single(String),
    Variants(VariantUrls),
}

impl VariantSource {
    /// Resolve to exactly one concrete URL.
    ///
    /// The vegetation branch wins only when `veg_filter` is off and the
    /// structure actually carries one; otherwise the plain pair is chosen by
    /// `full_resolution`.
    pub fn resolve(&self, full_resolution: bool, veg_filter: bool) -> &str {
        match self {
            VariantSource::Single(url) => url,
            VariantSource::Variants(urls) => match &urls.veg_filter {
                Some(veg) if !veg_filter => veg.pick(full_resolution),
                _ => {
                    if full_resolution {
                        &urls.full
                    } else {
                        &urls.downsampled
                    }
                }
            },
        }
    }
}

impl From<&str> for VariantSource {
    fn from(url: &str) -> Self {
        VariantSource::Single(url.to_string())
    }
}

/// A resolved image location together with its cache identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub url: String,
    pub key: CacheKey,
}

/// One entry of the dataset listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct DatasetRecord {
    /// Numeric id, also used to key the highlight overlay.
    pub id: u64,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub name: Option<String>,
    pub pre_event: VariantSource,
    pub post_event: VariantSource,
    pub change_detection: VariantSource,
    #[cfg_attr(feature = "serde", serde(default))]
    pub has_vegetation_filter: bool,
}

impl DatasetRecord {
    pub fn source(&self, variant: ImageVariant) -> &VariantSource {
        match variant {
            ImageVariant::PreEvent => &self.pre_event,
            ImageVariant::PostEvent => &self.post_event,
            ImageVariant::ChangeDetection => &self.change_detection,
        }
    }

    /// Resolve `variant` under the viewing flags into a URL and cache key.
    pub fn image_ref(
        &self,
        variant: ImageVariant,
        full_resolution: bool,
        veg_filter: bool,
    ) -> ImageRef {
        let url = self
            .source(variant)
            .resolve(full_resolution, veg_filter)
            .to_string();
        let key = CacheKey::derive(
            &url,
            full_resolution,
            veg_filter,
            self.has_vegetation_filter,
        );
        ImageRef { url, key }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("dataset {}", self.id))
    }
}
