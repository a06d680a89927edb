// Configuration Management
// "Every tunable in one place, overridable from the environment"

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{DocFiscalResult, TypedError};
use crate::logging::{parse_level, LogFormat, LoggingConfig};
use crate::payment::PollerConfig;
use crate::persistence::{FileStorage, KeyValueStorage, MemoryStorage};
use crate::retry::RetryPolicy;
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;


/// Environment variable prefix, e.g. `DOCFISCAL_API__BASE_URL`
pub const ENV_PREFIX: &str = "DOCFISCAL";
/// Optional config file read when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "config/docfiscal";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub poller: PollerSettings,
    pub error_log: ErrorLogSettings,
    pub persistence: PersistenceSettings,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Exclusive upper bound of the random jitter added to each delay
    pub max_jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
            .with_max_jitter(Duration::from_millis(self.max_jitter_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub initial_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_interval_ms: u64,
    pub max_duration_secs: u64,
    pub max_consecutive_errors: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 2_000,
            backoff_multiplier: 2.0,
            max_interval_ms: 30_000,
            max_duration_secs: 600,
            max_consecutive_errors: 5,
        }
    }
}

impl PollerSettings {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_duration: Duration::from_secs(self.max_duration_secs),
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorLogSettings {
    /// Entries kept before the oldest is evicted
    pub capacity: usize,
}

impl Default for ErrorLogSettings {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// JSON file backing session storage; memory only when unset
    pub storage_path: Option<String>,
    /// Age after which navigation and upload entries expire
    pub ttl_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            storage_path: None,
            ttl_secs: 30 * 60,
        }
    }
}

impl PersistenceSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn storage(&self) -> Arc<dyn KeyValueStorage> {
        match &self.storage_path {
            Some(path) => Arc::new(FileStorage::new(path)),
            None => Arc::new(MemoryStorage::new()),
        }
    }
}

/// DocFiscal API endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            token: None,
            timeout_ms: 30_000,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn invalid_value(field: &str, value: impl ToString) -> TypedError {
    let value = value.to_string();
    TypedError::validation(format!("Invalid configuration value for {field}: {value}"))
        .with_context("field", field)
        .with_context("value", value)
}

impl Config {
    /// Defaults, then `config/docfiscal.toml` if present, then environment
    pub fn load() -> DocFiscalResult<Self> {
        Self::load_with_file(None)
    }

    /// Load with an explicit config file, which must then exist
    pub fn load_with_file(config_file: Option<&str>) -> DocFiscalResult<Self> {
        info!("⚬ Loading configuration...");

        let defaults = ConfigBuilder::try_from(&Config::default())?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        builder = match config_file {
            Some(path) => {
                info!("Using config file: {}", path);
                builder.add_source(File::with_name(path).required(true))
            }
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let config = builder.build()?.try_deserialize::<Config>()?;
        config.validate()?;

        info!("✓ Configuration loaded");
        Ok(config)
    }

    /// Reject zero and incoherent values
    pub fn validate(&self) -> DocFiscalResult<()> {
        if self.retry.base_delay_ms == 0 {
            return Err(invalid_value("retry.base_delay_ms", self.retry.base_delay_ms));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid_value(
                "circuit_breaker.failure_threshold",
                self.circuit_breaker.failure_threshold,
            ));
        }
        if self.circuit_breaker.cooldown_ms == 0 {
            return Err(invalid_value(
                "circuit_breaker.cooldown_ms",
                self.circuit_breaker.cooldown_ms,
            ));
        }

        let poller = &self.poller;
        if poller.initial_interval_ms == 0 {
            return Err(invalid_value(
                "poller.initial_interval_ms",
                poller.initial_interval_ms,
            ));
        }
        if !poller.backoff_multiplier.is_finite() || poller.backoff_multiplier < 1.0 {
            return Err(invalid_value(
                "poller.backoff_multiplier",
                poller.backoff_multiplier,
            ));
        }
        if poller.max_interval_ms < poller.initial_interval_ms {
            return Err(TypedError::validation(
                "poller.max_interval_ms must be >= poller.initial_interval_ms",
            )
            .with_context("field", "poller.max_interval_ms"));
        }
        if poller.max_duration_secs == 0 {
            return Err(invalid_value(
                "poller.max_duration_secs",
                poller.max_duration_secs,
            ));
        }
        if poller.max_consecutive_errors == 0 {
            return Err(invalid_value(
                "poller.max_consecutive_errors",
                poller.max_consecutive_errors,
            ));
        }

        if self.error_log.capacity == 0 {
            return Err(invalid_value("error_log.capacity", self.error_log.capacity));
        }
        if self.persistence.ttl_secs == 0 {
            return Err(invalid_value("persistence.ttl_secs", self.persistence.ttl_secs));
        }

        let base_url = self.api.base_url.trim();
        if base_url.is_empty() {
            return Err(invalid_value("api.base_url", "<empty>"));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(invalid_value("api.base_url", base_url));
        }
        if self.api.timeout_ms == 0 {
            return Err(invalid_value("api.timeout_ms", self.api.timeout_ms));
        }

        parse_level(&self.logging.level)?;
        self.logging.format.parse::<LogFormat>()?;

        Ok(())
    }
}
