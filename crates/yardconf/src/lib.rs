//! Minimal configuration loading for Switchyard.
//!
//! Every tunable of the fabric lives here: the router's sync/async cutoff,
//! dispatcher backoff and breaker windows, progress coalescing, executor
//! retry policy, and store TTLs. Durations are plain integers in TOML
//! (`*_ms` / `*_secs`) with [`std::time::Duration`] accessors.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/switchyard/config.toml` (system)
//! 2. `~/.config/switchyard/config.toml` (user)
//! 3. `./switchyard.toml` (local override)
//! 4. Environment variables (`SWITCHYARD_*`)
//!
//! # Example Config
//!
//! ```toml
//! [router]
//! async_threshold_ms = 5000
//!
//! [dispatcher]
//! worker_pool_size = 10
//! retry_base_ms = 100
//! retry_cap_ms = 5000
//!
//! [progress]
//! flush_interval_ms = 100
//! max_batch = 5
//!
//! [executor]
//! max_retries = 3
//! handler_timeout_ms = 300000
//!
//! [ttl]
//! connection_ttl_secs = 86400
//! request_ttl_secs = 604800
//! ```

pub mod loader;

pub use loader::{discover_config_files, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on handler execution, matching the platform's maximum
/// execution window.
pub const HANDLER_TIMEOUT_CEILING: Duration = Duration::from_secs(15 * 60);

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Complete Switchyard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
}

/// Router: sync/async cutoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Requests whose declared estimate is at or below this run inline.
    #[serde(default = "defaults::async_threshold_ms")]
    pub async_threshold_ms: u64,
}

/// Dispatcher: delivery retry, breaker, fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Broadcast fan-out parallelism.
    #[serde(default = "defaults::worker_pool_size")]
    pub worker_pool_size: usize,
    /// Transport backoff base.
    #[serde(default = "defaults::dispatch_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Transport backoff cap.
    #[serde(default = "defaults::dispatch_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// Delivery attempts per send (first try included).
    #[serde(default = "defaults::dispatch_retry_attempts")]
    pub retry_attempts: u32,
    /// Consecutive failures before a connection's breaker opens.
    #[serde(default = "defaults::circuit_open_threshold")]
    pub circuit_open_threshold: u32,
    /// How long an open breaker short-circuits sends.
    #[serde(default = "defaults::circuit_open_duration_ms")]
    pub circuit_open_duration_ms: u64,
}

/// Progress reporter: coalescing and forced flushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressConfig {
    #[serde(default = "defaults::flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Coalesced updates per flush before emission is forced.
    #[serde(default = "defaults::max_batch")]
    pub max_batch: usize,
    /// Percentage at or above which updates bypass batching.
    #[serde(default = "defaults::force_threshold")]
    pub force_threshold: f64,
}

/// Executor: per-request retry policy and execution bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    #[serde(default = "defaults::request_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "defaults::request_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// Per-action execution timeout. Never above [`HANDLER_TIMEOUT_CEILING`].
    #[serde(default = "defaults::handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    /// Concurrent handler executions per process.
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,
    /// Cadence of the due-retry sweep.
    #[serde(default = "defaults::sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Store row lifetimes and reaper cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtlConfig {
    #[serde(default = "defaults::connection_ttl_secs")]
    pub connection_ttl_secs: u64,
    #[serde(default = "defaults::request_ttl_secs")]
    pub request_ttl_secs: u64,
    #[serde(default = "defaults::reap_interval_secs")]
    pub reap_interval_secs: u64,
}

mod defaults {
    pub fn async_threshold_ms() -> u64 {
        5_000
    }
    pub fn worker_pool_size() -> usize {
        10
    }
    pub fn dispatch_retry_base_ms() -> u64 {
        100
    }
    pub fn dispatch_retry_cap_ms() -> u64 {
        5_000
    }
    pub fn dispatch_retry_attempts() -> u32 {
        3
    }
    pub fn circuit_open_threshold() -> u32 {
        3
    }
    pub fn circuit_open_duration_ms() -> u64 {
        30_000
    }
    pub fn flush_interval_ms() -> u64 {
        100
    }
    pub fn max_batch() -> usize {
        5
    }
    pub fn force_threshold() -> f64 {
        95.0
    }
    pub fn request_retry_base_ms() -> u64 {
        1_000
    }
    pub fn request_retry_cap_ms() -> u64 {
        32_000
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn handler_timeout_ms() -> u64 {
        300_000
    }
    pub fn max_concurrent() -> usize {
        32
    }
    pub fn sweep_interval_ms() -> u64 {
        1_000
    }
    pub fn connection_ttl_secs() -> u64 {
        24 * 3600
    }
    pub fn request_ttl_secs() -> u64 {
        7 * 24 * 3600
    }
    pub fn reap_interval_secs() -> u64 {
        60
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            async_threshold_ms: defaults::async_threshold_ms(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: defaults::worker_pool_size(),
            retry_base_ms: defaults::dispatch_retry_base_ms(),
            retry_cap_ms: defaults::dispatch_retry_cap_ms(),
            retry_attempts: defaults::dispatch_retry_attempts(),
            circuit_open_threshold: defaults::circuit_open_threshold(),
            circuit_open_duration_ms: defaults::circuit_open_duration_ms(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: defaults::flush_interval_ms(),
            max_batch: defaults::max_batch(),
            force_threshold: defaults::force_threshold(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: defaults::request_retry_base_ms(),
            retry_cap_ms: defaults::request_retry_cap_ms(),
            max_retries: defaults::max_retries(),
            handler_timeout_ms: defaults::handler_timeout_ms(),
            max_concurrent: defaults::max_concurrent(),
            sweep_interval_ms: defaults::sweep_interval_ms(),
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            connection_ttl_secs: defaults::connection_ttl_secs(),
            request_ttl_secs: defaults::request_ttl_secs(),
            reap_interval_secs: defaults::reap_interval_secs(),
        }
    }
}

impl SwitchyardConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/switchyard/config.toml`
    /// 3. `~/.config/switchyard/config.toml`
    /// 4. `./switchyard.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources()?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        loader::load_layered(None)
    }

    /// Load from a specific file, then apply env overrides. System and user
    /// configs still load first.
    pub fn load_from(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = loader::load_layered(path)?;
        Ok(config)
    }

    /// Reject configurations the fabric cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.worker_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatcher.worker_pool_size".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.dispatcher.retry_base_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatcher.retry_base_ms".into(),
                message: "must be non-zero".into(),
            });
        }
        if self.progress.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "progress.flush_interval_ms".into(),
                message: "must be non-zero".into(),
            });
        }
        if self.progress.max_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "progress.max_batch".into(),
                message: "must be at least 1".into(),
            });
        }
        if !(0.0..=100.0).contains(&self.progress.force_threshold) {
            return Err(ConfigError::Invalid {
                field: "progress.force_threshold".into(),
                message: "must be within [0, 100]".into(),
            });
        }
        if self.executor.handler_timeout() > HANDLER_TIMEOUT_CEILING {
            return Err(ConfigError::Invalid {
                field: "executor.handler_timeout_ms".into(),
                message: format!(
                    "exceeds the {}s platform ceiling",
                    HANDLER_TIMEOUT_CEILING.as_secs()
                ),
            });
        }
        if self.executor.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "executor.max_concurrent".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl RouterConfig {
    pub fn async_threshold(&self) -> Duration {
        Duration::from_millis(self.async_threshold_ms)
    }
}

impl DispatcherConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }

    pub fn circuit_open_duration(&self) -> Duration {
        Duration::from_millis(self.circuit_open_duration_ms)
    }
}

impl ProgressConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl ExecutorConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl TtlConfig {
    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let config = SwitchyardConfig::default();
        assert_eq!(config.router.async_threshold(), Duration::from_secs(5));
        assert_eq!(config.dispatcher.worker_pool_size, 10);
        assert_eq!(config.dispatcher.retry_base(), Duration::from_millis(100));
        assert_eq!(config.dispatcher.retry_cap(), Duration::from_secs(5));
        assert_eq!(config.dispatcher.circuit_open_threshold, 3);
        assert_eq!(
            config.dispatcher.circuit_open_duration(),
            Duration::from_secs(30)
        );
        assert_eq!(config.progress.flush_interval(), Duration::from_millis(100));
        assert_eq!(config.progress.max_batch, 5);
        assert_eq!(config.progress.force_threshold, 95.0);
        assert_eq!(config.executor.retry_base(), Duration::from_secs(1));
        assert_eq!(config.executor.retry_cap(), Duration::from_secs(32));
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.ttl.connection_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.ttl.request_ttl(), Duration::from_secs(604_800));
    }

    #[test]
    fn default_config_validates() {
        SwitchyardConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_pool() {
        let mut config = SwitchyardConfig::default();
        config.dispatcher.worker_pool_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "dispatcher.worker_pool_size"
        ));
    }

    #[test]
    fn rejects_timeout_above_ceiling() {
        let mut config = SwitchyardConfig::default();
        config.executor.handler_timeout_ms = 16 * 60 * 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: SwitchyardConfig = toml::from_str(
            r#"
            [dispatcher]
            worker_pool_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.worker_pool_size, 4);
        assert_eq!(config.dispatcher.retry_base_ms, 100);
        assert_eq!(config.router.async_threshold_ms, 5_000);
    }
}
