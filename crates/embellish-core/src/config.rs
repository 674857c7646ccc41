//! Configuration management for embellish
//!
//! Handles loading and validation of `embellish.toml`. Every timing constant
//! used by the retry scheduler, mutation watch and watchdog lives here so
//! hosts with different render habits can be tuned without code changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Provider fetch settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Not-ready retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Mutation and navigation watch settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Post-success watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Focus view detection settings
    #[serde(default)]
    pub focus: FocusConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Namespace prepended to every persisted key
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,

    /// Entry lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Byte budget of the backing store (keys plus values)
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: default_cache_prefix(),
            ttl_secs: default_ttl_secs(),
            quota_bytes: default_quota_bytes(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_prefix() -> String {
    "embellish_".to_string()
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_quota_bytes() -> usize {
    5 * 1024 * 1024
}

/// Fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchConfig {
    /// Upper bound on a single provider call in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl FetchConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

/// Retry configuration: delay = min(base + attempt * increment, max)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_increment_ms")]
    pub increment_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Random jitter range as a fraction of the delay (0.0 disables)
    #[serde(default)]
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            increment_ms: default_increment_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_percent: 0.0,
        }
    }
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_increment_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    1500
}

fn default_max_attempts() -> u32 {
    15
}

/// Watch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchConfig {
    /// Burst-collapsing delay before a trigger fires
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Navigation address poll interval
    #[serde(default = "default_nav_poll_ms")]
    pub nav_poll_ms: u64,

    /// Classes of child regions whose arrival warrants a reconcile
    #[serde(default = "default_region_classes")]
    pub region_classes: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            nav_poll_ms: default_nav_poll_ms(),
            region_classes: default_region_classes(),
        }
    }
}

impl WatchConfig {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn nav_poll(&self) -> Duration {
        Duration::from_millis(self.nav_poll_ms)
    }
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_nav_poll_ms() -> u64 {
    500
}

fn default_region_classes() -> Vec<String> {
    vec!["linksSection".to_string(), "itemLinks".to_string()]
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive quiet ticks before the watchdog stands down
    #[serde(default = "default_stable_ticks")]
    pub stable_ticks: u32,

    /// Hard ceiling on ticks per session
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_watchdog_interval_ms(),
            stable_ticks: default_stable_ticks(),
            max_ticks: default_max_ticks(),
        }
    }
}

impl WatchdogConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_watchdog_interval_ms() -> u64 {
    500
}

fn default_stable_ticks() -> u32 {
    10
}

fn default_max_ticks() -> u32 {
    60
}

/// Focus view detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusConfig {
    /// Class shared by every candidate focus view
    #[serde(default = "default_focus_class")]
    pub focus_class: String,

    /// Class marking an inactive candidate
    #[serde(default = "default_hidden_class")]
    pub hidden_class: String,

    /// Navigation parameter carrying the identity key
    #[serde(default = "default_identity_param")]
    pub identity_param: String,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            focus_class: default_focus_class(),
            hidden_class: default_hidden_class(),
            identity_param: default_identity_param(),
        }
    }
}

fn default_focus_class() -> String {
    "view-item-item".to_string()
}

fn default_hidden_class() -> String {
    "hide".to_string()
}

fn default_identity_param() -> String {
    "id".to_string()
}

impl Config {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config location (`<config dir>/embellish/embellish.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("embellish")
            .join("embellish.toml")
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values that would stall or spin the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.cache.prefix.is_empty() {
            return Err(invalid("cache.prefix", "must not be empty"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs", "must be greater than zero"));
        }
        if self.cache.quota_bytes == 0 {
            return Err(invalid("cache.quota_bytes", "must be greater than zero"));
        }
        if self.fetch.timeout_ms == 0 {
            return Err(invalid("fetch.timeout_ms", "must be greater than zero"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms",
                "must be at least retry.base_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return Err(invalid("retry.jitter_percent", "must be within 0.0..=1.0"));
        }
        if self.watch.nav_poll_ms == 0 {
            return Err(invalid("watch.nav_poll_ms", "must be greater than zero"));
        }
        if self.watchdog.interval_ms == 0 {
            return Err(invalid("watchdog.interval_ms", "must be greater than zero"));
        }
        if self.watchdog.stable_ticks == 0 {
            return Err(invalid("watchdog.stable_ticks", "must be greater than zero"));
        }
        if self.watchdog.max_ticks < self.watchdog.stable_ticks {
            return Err(invalid(
                "watchdog.max_ticks",
                "must be at least watchdog.stable_ticks",
            ));
        }
        if self.focus.focus_class.is_empty() || self.focus.identity_param.is_empty() {
            return Err(invalid(
                "focus",
                "focus_class and identity_param must not be empty",
            ));
        }
        Ok(())
    }
}
