use std::fmt;

/// Identifies one logical image variant in the in-memory cache.
///
/// The key folds in the resolution choice and whether the vegetation-filtered
/// rendering is in effect, so the same URL requested under different viewing
/// modes never aliases another entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `url` under the given viewing flags.
    ///
    /// The vegetation segment reads `veg` only when the filter is available
    /// for the dataset *and* the filter toggle is off, mirroring which URL
    /// branch [`crate::VariantSource::resolve`] picks.
    pub fn derive(
        url: &str,
        full_resolution: bool,
        veg_filter: bool,
        veg_filter_available: bool,
    ) -> Self {
        let resolution = if full_resolution { "full" } else { "down" };
        let vegetation = if !veg_filter && veg_filter_available {
            "veg"
        } else {
            "norm"
        };
        Self(format!("{resolution}_{vegetation}_{url}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
