use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use validator::{Validate, ValidationError};

// Default constants
pub const DEFAULT_POOL_MIN_SIZE: usize = 0;
pub const DEFAULT_POOL_MAX_SIZE: usize = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
/// Idle connections older than this are closed by the reaper.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
/// Connections older than this are discarded instead of reused.
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_MAX_BUFFERED_ROWS: usize = 10_000;
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

pub const DEFAULT_SECRET_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_SECRET_CACHE_CAPACITY: u64 = 1_000;

pub const DEFAULT_TELEMETRY_ENABLED: bool = false;
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
pub const DEFAULT_SERVICE_NAME: &str = "arbor";
pub const DEFAULT_LOG_FILTER: &str = "info";

pub const ENV_PREFIX: &str = "ARBOR";

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolSettings,
    #[serde(default)]
    #[validate(nested)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, Validate)]
#[validate(schema(function = "validate_pool_bounds"))]
pub struct PoolSettings {
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    #[serde(default = "default_pool_max_size")]
    #[validate(range(min = 1))]
    pub max_size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// Run on every reused connection before it is handed out.
    #[serde(default)]
    pub validation_query: Option<String>,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_POOL_MIN_SIZE,
            max_size: DEFAULT_POOL_MAX_SIZE,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            validation_query: None,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
        }
    }
}

type PoolSetter = fn(&mut PoolSettings, &str) -> Result<()>;

/// Per-connection overrides, keyed by the option name used in a connection spec.
const POOL_SETTERS: &[(&str, PoolSetter)] = &[
    ("pool.min_size", |s, v| {
        s.min_size = v.parse().context("pool.min_size")?;
        Ok(())
    }),
    ("pool.max_size", |s, v| {
        s.max_size = v.parse().context("pool.max_size")?;
        Ok(())
    }),
    ("pool.acquire_timeout_ms", |s, v| {
        s.acquire_timeout_ms = v.parse().context("pool.acquire_timeout_ms")?;
        Ok(())
    }),
    ("pool.idle_timeout_secs", |s, v| {
        s.idle_timeout_secs = v.parse().context("pool.idle_timeout_secs")?;
        Ok(())
    }),
    ("pool.max_lifetime_secs", |s, v| {
        s.max_lifetime_secs = v.parse().context("pool.max_lifetime_secs")?;
        Ok(())
    }),
    ("pool.validation_query", |s, v| {
        s.validation_query = if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        };
        Ok(())
    }),
];

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Returns true if `key` is a recognised pool override.
    pub fn is_override_key(key: &str) -> bool {
        POOL_SETTERS.iter().any(|(name, _)| *name == key)
    }

    /// Apply one `pool.*` option. Unknown keys are rejected.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<()> {
        let (_, setter) = POOL_SETTERS
            .iter()
            .find(|(name, _)| *name == key)
            .ok_or_else(|| anyhow::anyhow!("Unknown pool option '{}'", key))?;
        setter(self, value)
    }

    /// Copy of these settings with every `pool.*` entry of `options` applied.
    pub fn with_overrides<'a>(
        &self,
        options: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self> {
        let mut settings = self.clone();
        for (key, value) in options {
            if key.starts_with("pool.") {
                settings.apply_override(key, value)?;
            }
        }
        settings
            .validate()
            .map_err(|e| anyhow::anyhow!("Pool settings validation failed: {}", e))?;
        Ok(settings)
    }
}

fn validate_pool_bounds(settings: &PoolSettings) -> Result<(), ValidationError> {
    if settings.min_size > settings.max_size {
        return Err(ValidationError::new("min_size_exceeds_max_size"));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ExecutionSettings {
    #[serde(default = "default_max_buffered_rows")]
    #[validate(range(min = 1))]
    pub max_buffered_rows: usize,
    #[serde(default = "default_max_buffered_bytes")]
    #[validate(range(min = 1))]
    pub max_buffered_bytes: usize,
    #[serde(default = "default_execution_timeout_secs")]
    pub timeout_seconds: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_buffered_rows: DEFAULT_MAX_BUFFERED_ROWS,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            timeout_seconds: DEFAULT_EXECUTION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialSettings {
    #[serde(default = "default_secret_cache_ttl")]
    pub secret_cache_ttl_secs: u64,
    #[serde(default = "default_secret_cache_capacity")]
    pub secret_cache_capacity: u64,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            secret_cache_ttl_secs: DEFAULT_SECRET_CACHE_TTL_SECS,
            secret_cache_capacity: DEFAULT_SECRET_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_otlp_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_pool_min_size() -> usize {
    DEFAULT_POOL_MIN_SIZE
}
fn default_pool_max_size() -> usize {
    DEFAULT_POOL_MAX_SIZE
}
fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_MS
}
fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}
fn default_max_lifetime_secs() -> u64 {
    DEFAULT_MAX_LIFETIME_SECS
}
fn default_reaper_interval_secs() -> u64 {
    DEFAULT_REAPER_INTERVAL_SECS
}
fn default_max_buffered_rows() -> usize {
    DEFAULT_MAX_BUFFERED_ROWS
}
fn default_max_buffered_bytes() -> usize {
    DEFAULT_MAX_BUFFERED_BYTES
}
fn default_execution_timeout_secs() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_secret_cache_ttl() -> u64 {
    DEFAULT_SECRET_CACHE_TTL_SECS
}
fn default_secret_cache_capacity() -> u64 {
    DEFAULT_SECRET_CACHE_CAPACITY
}
fn default_telemetry_enabled() -> bool {
    DEFAULT_TELEMETRY_ENABLED
}
fn default_otlp_endpoint() -> String {
    DEFAULT_OTLP_ENDPOINT.to_string()
}
fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl AppConfig {
    /// Load from an optional YAML/TOML/JSON file, then apply environment overrides.
    ///
    /// `ARBOR__POOL__MAX_SIZE=4` maps to `pool.max_size`.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }
}
