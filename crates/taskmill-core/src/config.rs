//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file) is a
//! valid configuration.
//!
//! ```toml
//! [store]
//! backend = "redis"
//! url = "redis://localhost:6379"
//!
//! [engine]
//! lease_timeout_seconds = 120
//!
//! [scaling]
//! tiers = [{ above = 200, workers = 8 }, { above = 20, workers = 2 }]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::ScalingTiers;
use crate::monitor::{HealthThresholds, MonitorConfig};
use crate::queue::{DEFAULT_QUEUE, EngineConfig, MAX_RETRY_LIMIT, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "taskmill".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: cfg.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub default_queue: String,
    pub default_max_retry: u32,
    pub lease_timeout_seconds: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            default_max_retry: 3,
            lease_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub window_seconds: u64,
    #[serde(flatten)]
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_seconds: 3600,
            thresholds: HealthThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    #[serde(flatten)]
    pub tiers: ScalingTiers,
    pub control_interval_seconds: u64,
    pub auto_pause: bool,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            tiers: ScalingTiers::default(),
            control_interval_seconds: 30,
            auto_pause: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskmillConfig {
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub engine: EngineSection,
    pub health: HealthConfig,
    pub scaling: ScalingConfig,
    pub worker: WorkerConfig,
}

impl TaskmillConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.default_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("engine.default_queue is empty".into()));
        }
        if self.engine.default_max_retry > MAX_RETRY_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "engine.default_max_retry exceeds {MAX_RETRY_LIMIT}"
            )));
        }
        if self.engine.lease_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "engine.lease_timeout_seconds must be positive".into(),
            ));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("retry.jitter must be within 0..=1".into()));
        }
        let t = &self.health.thresholds;
        if t.error_rate_warning > t.error_rate_critical || t.backlog_warning > t.backlog_critical {
            return Err(ConfigError::Invalid(
                "health warning thresholds must not exceed critical ones".into(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be positive".into()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_ms must be positive".into(),
            ));
        }
        if self.scaling.control_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "scaling.control_interval_seconds must be positive".into(),
            ));
        }
        self.scaling
            .tiers
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("scaling.tiers: {e}")))?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_queue: self.engine.default_queue.clone(),
            default_max_retry: self.engine.default_max_retry,
            lease_timeout: self.lease_timeout(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            window: Duration::from_secs(self.health.window_seconds),
            lease_timeout: self.lease_timeout(),
            thresholds: self.health.thresholds.clone(),
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.lease_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn control_interval(&self) -> Duration {
        Duration::from_secs(self.scaling.control_interval_seconds)
    }
}
