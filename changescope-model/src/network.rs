use std::fmt;
use std::time::Duration;

/// Coarse network-quality tier inferred from observed image load times.
///
/// Ordered from best to worst so `quality >= NetworkQuality::Fair` reads as
/// "fair or worse".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum NetworkQuality {
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    /// Classify a completed load by its wall-clock duration.
    pub fn from_load_time(load_time: Duration) -> Self {
        let ms = load_time.as_millis();
        if ms < 1_000 {
            NetworkQuality::Excellent
        } else if ms < 3_000 {
            NetworkQuality::Good
        } else if ms < 8_000 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
        }
    }

    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            NetworkQuality::Excellent => 0,
            NetworkQuality::Good => 1,
            NetworkQuality::Fair => 2,
            NetworkQuality::Poor => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => NetworkQuality::Excellent,
            1 => NetworkQuality::Good,
            2 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }
}

/// Lock-free cell holding the current [`NetworkQuality`].
#[derive(Debug)]
pub struct AtomicNetworkQuality(std::sync::atomic::AtomicU8);

impl AtomicNetworkQuality {
    pub const fn new(quality: NetworkQuality) -> Self {
        Self(std::sync::atomic::AtomicU8::new(quality.to_u8()))
    }

    pub fn load(&self) -> NetworkQuality {
        NetworkQuality::from_u8(
            self.0.load(std::sync::atomic::Ordering::Relaxed),
        )
    }

    pub fn store(&self, quality: NetworkQuality) {
        self.0
            .store(quality.to_u8(), std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for AtomicNetworkQuality {
    fn default() -> Self {
        Self::new(NetworkQuality::default())
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
