//! Typed configuration with defaults, file loading, and environment overrides.
//!
//! Load order: built-in defaults <- TOML file <- `JOBGRID_*` environment
//! variables. Validation runs after all layers are applied; a failing load
//! never partially applies a change.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingSettings {
    /// Seed listing URLs; pagination is discovered from each
    pub seed_urls: Vec<String>,
    pub max_concurrent: usize,
    pub max_pages: u32,
    /// Requests per second admitted by the rate limiter
    pub rate_per_second: f64,
    pub burst: u32,
    pub incremental: bool,
    /// Forced mode disables early-stop but keeps dedup
    pub forced: bool,
    pub dedup: bool,
    pub similarity_threshold: f64,
    pub compression_level: u32,
}

impl Default for ScrapingSettings {
    fn default() -> Self {
        Self {
            seed_urls: Vec::new(),
            max_concurrent: 4,
            max_pages: 20,
            rate_per_second: 2.0,
            burst: 4,
            incremental: true,
            forced: false,
            dedup: true,
            similarity_threshold: 0.85,
            compression_level: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub max_age_hours: u64,
    pub auto_cleanup: bool,
    pub max_size_mb: u64,
    pub rebuild_on_startup: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/cache"),
            max_age_hours: 24 * 7,
            auto_cleanup: false,
            max_size_mb: 512,
            rebuild_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    /// Per-navigation timeout in seconds
    pub navigation_timeout_secs: u64,
    /// Per-element wait in seconds
    pub element_timeout_secs: u64,
    /// Retry strategy id: conservative | standard | aggressive | network_heavy
    pub retry_strategy: String,
    pub pool_min_size: usize,
    pub pool_max_size: usize,
    pub pool_max_age_secs: u64,
    pub pool_max_uses: u32,
    pub pool_cleanup_interval_secs: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            navigation_timeout_secs: 60,
            element_timeout_secs: 3,
            retry_strategy: "standard".to_string(),
            pool_min_size: 1,
            pool_max_size: 4,
            pool_max_age_secs: 30 * 60,
            pool_max_uses: 200,
            pool_cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub dir: PathBuf,
    /// Requested formats: json | csv | text
    pub formats: Vec<String>,
    pub max_files_per_type: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/resultados"),
            formats: vec!["json".to_string()],
            max_files_per_type: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub dir: PathBuf,
    pub rotate_size_mb: u64,
    pub rotate_keep: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("data/logs"),
            rotate_size_mb: 10,
            rotate_keep: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
    pub launch_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1366,
            viewport_height: 900,
            user_agent: None,
            launch_args: Vec::new(),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub scraping: ScrapingSettings,
    pub cache: CacheSettings,
    pub performance: PerformanceSettings,
    pub output: OutputSettings,
    pub logging: LoggingSettings,
    pub browser: BrowserSettings,
    /// Directory for the incremental checkpoint
    pub checkpoint_dir: PathBuf,
    /// Directory for metrics snapshots
    pub metrics_dir: PathBuf,
}

impl Settings {
    /// Load defaults, merge the optional TOML file, then apply environment
    /// overrides, and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|source| SettingsError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                toml::from_str(&content).map_err(|source| SettingsError::Parse {
                    path: p.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        if settings.checkpoint_dir.as_os_str().is_empty() {
            settings.checkpoint_dir = PathBuf::from("data/checkpoints");
        }
        if settings.metrics_dir.as_os_str().is_empty() {
            settings.metrics_dir = PathBuf::from("data/metrics");
        }
        settings.apply_env_overrides(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `JOBGRID_*` overrides from an iterator of environment pairs.
    ///
    /// Unrecognized `JOBGRID_*` variables get one debug log line and are
    /// otherwise ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("JOBGRID_") else {
                continue;
            };
            match name {
                "CACHE_DIR" => self.cache.dir = PathBuf::from(&value),
                "LOG_LEVEL" => self.logging.level = value,
                "RATE" => {
                    self.scraping.rate_per_second =
                        parse_env("scraping.rate_per_second", &value)?;
                }
                "BURST" => self.scraping.burst = parse_env("scraping.burst", &value)?,
                "MAX_PAGES" => self.scraping.max_pages = parse_env("scraping.max_pages", &value)?,
                "MAX_CONCURRENT" => {
                    self.scraping.max_concurrent =
                        parse_env("scraping.max_concurrent", &value)?;
                }
                "COMPRESSION_LEVEL" => {
                    self.scraping.compression_level =
                        parse_env("scraping.compression_level", &value)?;
                }
                other => {
                    tracing::debug!(variable = other, "ignoring unrecognized JOBGRID_ variable");
                }
            }
        }
        Ok(())
    }

    /// Reject out-of-range values with explicit messages
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.scraping.max_concurrent == 0 {
            return Err(invalid("scraping.max_concurrent", "must be at least 1"));
        }
        if self.scraping.max_pages == 0 {
            return Err(invalid("scraping.max_pages", "must be at least 1"));
        }
        if !(self.scraping.rate_per_second > 0.0) {
            return Err(invalid(
                "scraping.rate_per_second",
                "must be greater than zero",
            ));
        }
        if !(1..=9).contains(&self.scraping.compression_level) {
            return Err(invalid(
                "scraping.compression_level",
                "must be between 1 and 9",
            ));
        }
        if !(0.0..=1.0).contains(&self.scraping.similarity_threshold) {
            return Err(invalid(
                "scraping.similarity_threshold",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.performance.pool_min_size > self.performance.pool_max_size {
            return Err(invalid(
                "performance.pool_min_size",
                "must not exceed performance.pool_max_size",
            ));
        }
        if self.performance.pool_max_size == 0 {
            return Err(invalid("performance.pool_max_size", "must be at least 1"));
        }
        if self.cache.max_age_hours == 0 {
            return Err(invalid("cache.max_age_hours", "must be at least 1"));
        }
        for format in &self.output.formats {
            if !matches!(format.as_str(), "json" | "csv" | "text") {
                return Err(invalid(
                    "output.formats",
                    format!("unknown format {format:?}; expected json, csv, or text"),
                ));
            }
        }
        if !matches!(
            self.performance.retry_strategy.as_str(),
            "conservative" | "standard" | "aggressive" | "network_heavy"
        ) {
            return Err(invalid(
                "performance.retry_strategy",
                "expected conservative, standard, aggressive, or network_heavy",
            ));
        }
        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(invalid(
                "logging.level",
                "expected trace, debug, info, warn, or error",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, SettingsError> {
    value
        .parse()
        .map_err(|_| invalid(field, format!("cannot parse {value:?}")))
}

fn invalid(field: &'static str, message: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field,
        message: message.into(),
    }
}
