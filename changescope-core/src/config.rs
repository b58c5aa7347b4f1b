//! Viewer configuration.
//!
//! Every section carries defaults, so a config file only needs the knobs it
//! wants to change.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use changescope_model::NetworkQuality;
use serde::{Deserialize, Serialize};

use crate::units::ByteSize;

/// Environment variable pointing at a TOML or JSON config file.
pub const CONFIG_PATH_ENV: &str = "CHANGESCOPE_CONFIG_PATH";
/// Environment variable holding inline JSON configuration.
pub const CONFIG_JSON_ENV: &str = "CHANGESCOPE_CONFIG_JSON";
/// File looked up in the working directory when no env override is set.
pub const DEFAULT_CONFIG_FILE: &str = "changescope.toml";

/// Source that produced the viewer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ViewerConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    pub preload: PreloadConfig,
    pub governor: GovernorConfig,
    pub retry: RetryConfig,
    pub navigation: NavigationConfig,
}

/// Where datasets and images are served from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL; relative image URLs from the listing are joined onto it.
    pub url: String,
    /// Path of the dataset listing endpoint relative to `url`.
    pub listing_path: String,
    /// Opaque `Authorization` header value forwarded on every request.
    pub auth_header: Option<String>,
    /// Whole-request timeout for HTTP fetches.
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000/".to_string(),
            listing_path: "api/datasets".to_string(),
            auth_header: None,
            request_timeout_ms: 120_000,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of decoded images held at once.
    pub max_entries: usize,
    /// Size assumed for an entry whose dimensions are unknown.
    pub fallback_entry_bytes: ByteSize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 20,
            // One 1024x1024 RGBA frame.
            fallback_entry_bytes: ByteSize::from_bytes(1024 * 1024 * 4),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Upper bound on waiting for a decode to finish.
    pub decode_timeout_ms: u64,
    /// Minimum spacing between progress callbacks.
    pub progress_interval_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            decode_timeout_ms: 15_000,
            progress_interval_ms: 100,
        }
    }
}

impl LoaderConfig {
    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    pub enabled: bool,
    /// Speculative loads allowed in flight at once.
    pub max_concurrent: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Memory the decoded-image cache may use.
    pub memory_budget: ByteSize,
    /// Cadence of the periodic memory check.
    pub check_interval_ms: u64,
    /// Fraction of `memory_budget` beyond which cleanup is requested.
    pub cache_pressure_ratio: f64,
    /// Fraction of the platform heap limit beyond which cleanup is requested.
    pub heap_pressure_ratio: f64,
    /// Platform heap limit. Heap pressure is not evaluated without one.
    pub heap_limit: Option<ByteSize>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            memory_budget: ByteSize::from_mib(500),
            check_interval_ms: 30_000,
            cache_pressure_ratio: 0.8,
            heap_pressure_ratio: 0.9,
            heap_limit: None,
        }
    }
}

impl GovernorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Retry/backoff policy for failed main loads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_factor: f64,
    pub backoff_max_ms: u64,
    pub poor_base_delay_ms: u64,
    pub fair_base_delay_ms: u64,
    pub good_base_delay_ms: u64,
    /// Attempt cap while the network is rated poor.
    pub poor_max_attempts: u32,
    /// Attempt cap for every other tier.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_factor: 1.5,
            backoff_max_ms: 8_000,
            poor_base_delay_ms: 2_000,
            fair_base_delay_ms: 1_000,
            good_base_delay_ms: 500,
            poor_max_attempts: 5,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self, quality: NetworkQuality) -> Duration {
        let ms = match quality {
            NetworkQuality::Poor => self.poor_base_delay_ms,
            NetworkQuality::Fair => self.fair_base_delay_ms,
            NetworkQuality::Good | NetworkQuality::Excellent => {
                self.good_base_delay_ms
            }
        };
        Duration::from_millis(ms)
    }

    pub fn max_attempts(&self, quality: NetworkQuality) -> u32 {
        match quality {
            NetworkQuality::Poor => self.poor_max_attempts,
            _ => self.max_attempts,
        }
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Pause between a display and the fit-to-view callback.
    pub fit_settle_delay_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            fit_settle_delay_ms: 100,
        }
    }
}

impl NavigationConfig {
    pub fn fit_settle_delay(&self) -> Duration {
        Duration::from_millis(self.fit_settle_delay_ms)
    }
}

/// Suspicious but accepted configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl ViewerConfig {
    /// Load configuration overrides.
    /// Evaluation order:
    /// 1) `$CHANGESCOPE_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$CHANGESCOPE_CONFIG_JSON` (inline JSON),
    /// 3) `changescope.toml` in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default_path.is_file() {
            let config = Self::load_from_file(&default_path)?;
            return Ok((config, ConfigSource::File(default_path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read viewer config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents).with_context(|| {
                format!("invalid viewer config {}", path.display())
            }),
            Some("toml") | Some("tml") => {
                toml::from_str(&contents).map_err(|err| {
                    anyhow!("invalid viewer config {}: {}", path.display(), err)
                })
            }
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    fn parse_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            Self::parse_json(contents).map_err(|json_err| {
                anyhow!(
                    "invalid viewer config {origin}: \
                     not TOML ({toml_err}) or JSON ({json_err})"
                )
            })
        })
    }

    /// Values that will work but probably aren't what the operator meant.
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.cache.max_entries < 4 {
            warnings.push(ConfigWarning {
                message: format!(
                    "cache.max_entries = {} leaves no room for preloads",
                    self.cache.max_entries
                ),
                hint: Some(
                    "use at least 4 so the displayed image and its \
                     neighbours fit"
                        .to_string(),
                ),
            });
        }

        if self.preload.max_concurrent == 0 && self.preload.enabled {
            warnings.push(ConfigWarning {
                message: "preload.max_concurrent = 0 disables preloading"
                    .to_string(),
                hint: Some("set preload.enabled = false instead".to_string()),
            });
        }

        for (name, ratio) in [
            (
                "governor.cache_pressure_ratio",
                self.governor.cache_pressure_ratio,
            ),
            (
                "governor.heap_pressure_ratio",
                self.governor.heap_pressure_ratio,
            ),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                warnings.push(ConfigWarning {
                    message: format!("{name} = {ratio} is outside 0.0..=1.0"),
                    hint: None,
                });
            }
        }

        if self.retry.backoff_factor < 1.0 {
            warnings.push(ConfigWarning {
                message: format!(
                    "retry.backoff_factor = {} shrinks delays between attempts",
                    self.retry.backoff_factor
                ),
                hint: None,
            });
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_limits() {
        let config = ViewerConfig::default();
        assert_eq!(config.loader.decode_timeout(), Duration::from_secs(15));
        assert_eq!(config.preload.max_concurrent, 5);
        assert_eq!(config.governor.memory_budget, ByteSize::from_mib(500));
        assert_eq!(config.governor.check_interval(), Duration::from_secs(30));
        assert_eq!(config.retry.backoff_max(), Duration::from_secs(8));
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(
            file,
            "[cache]\nmax_entries = 8\n\n\
             [server]\nurl = \"https://imagery.example.org/\""
        )
        .expect("write");

        let config =
            ViewerConfig::load_from_file(file.path()).expect("loads toml");
        assert_eq!(config.cache.max_entries, 8);
        assert_eq!(config.server.url, "https://imagery.example.org/");
        assert_eq!(config.server.listing_path, "api/datasets");
        assert_eq!(config.preload.max_concurrent, 5);
    }

    #[test]
    fn extensionless_file_falls_back_to_json() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"preload": {{"max_concurrent": 2}}}}"#)
            .expect("write");

        let config =
            ViewerConfig::load_from_file(file.path()).expect("loads json");
        assert_eq!(config.preload.max_concurrent, 2);
    }

    #[test]
    fn retry_tiers_follow_network_quality() {
        let retry = RetryConfig::default();
        assert_eq!(
            retry.base_delay(NetworkQuality::Poor),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            retry.base_delay(NetworkQuality::Fair),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            retry.base_delay(NetworkQuality::Excellent),
            Duration::from_millis(500)
        );
        assert_eq!(retry.max_attempts(NetworkQuality::Poor), 5);
        assert_eq!(retry.max_attempts(NetworkQuality::Good), 3);
    }

    #[test]
    fn tiny_cache_is_flagged() {
        let mut config = ViewerConfig::default();
        config.cache.max_entries = 2;
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("max_entries"));
    }
}
