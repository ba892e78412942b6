// Layered runtime configuration

//! # Configuration
//!
//! [`OrchestratorConfig`] carries every tuning knob the engine and the
//! control server read. [`OrchestratorConfig::load`] layers an optional
//! `config/opsflow.toml` file under `OPSFLOW_*` environment variables, so a
//! deployment can override any field without a file edit. `Default` gives
//! sensible development values and is what the tests use.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::breaker::CircuitBreakerConfig;
use crate::engine::retry::RetryPolicy;
use crate::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Scheduler tick interval in seconds
    pub poll_interval_secs: u64,
    /// Deadline for a single workflow body invocation
    pub body_timeout_secs: u64,
    /// Parallel stage dispatches inside one pipeline wave
    pub max_parallel_stages: usize,

    // Circuit breaker
    pub breaker_failure_threshold: usize,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,

    // Retry policy
    pub retry_max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,

    // Control server
    pub bind_address: String,
    pub port: u16,

    /// JSON snapshot path; `None` runs purely in memory
    pub storage_path: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            poll_interval_secs: 5,
            body_timeout_secs: 300,
            max_parallel_stages: 4,
            breaker_failure_threshold: 5,
            breaker_window_secs: 300,
            breaker_cooldown_secs: 120,
            retry_max_attempts: 3,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 900,
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            storage_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration: defaults, then `config/opsflow.toml` when present,
    /// then `OPSFLOW_*` environment variables.
    pub fn load() -> Result<Self> {
        let defaults = config::Config::try_from(&OrchestratorConfig::default())
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("config/opsflow").required(false))
            .add_source(config::Environment::with_prefix("OPSFLOW"))
            .build()
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_secs(self.body_timeout_secs.max(1))
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            window: Duration::from_secs(self.breaker_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: chrono::Duration::seconds(self.retry_base_delay_secs as i64),
            max_delay: chrono::Duration::seconds(self.retry_max_delay_secs as i64),
            jitter: true,
        }
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
