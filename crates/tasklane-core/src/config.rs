//! Processor configuration.
//!
//! Layered with config-rs, later layers overriding earlier ones:
//! 1. built-in defaults
//! 2. an optional file (TOML, YAML or JSON, picked by extension)
//! 3. environment variables `TASKLANE__<FIELD>`, nested with `__`
//!    (`TASKLANE__NUM_WORKERS=8`, `TASKLANE__LOGGING__FORMAT=json`)

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::QueueOptions;
use crate::worker::WorkerOptions;

const ENV_PREFIX: &str = "TASKLANE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Key prefix in the backing store.
    pub queue_name: String,
    pub num_workers: usize,
    /// Execution slots per worker.
    pub worker_concurrency: usize,
    /// Tasks declaring more CPUs than this run on the parallel pool.
    pub cpu_threshold: f64,
    pub parallel_pool_size: usize,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub monitor_interval_secs: u64,
    pub scheduler_tick_secs: u64,
    pub reaper_interval_secs: u64,
    pub lease_ttl_secs: u64,
    pub lease_grace_secs: u64,
    pub payload_ttl_secs: u64,
    pub result_ttl_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Register the built-in maintenance schedules on `initialize()`.
    pub register_default_jobs: bool,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// "pretty", "compact" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn default_parallel_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_name: "tasklane".to_string(),
            num_workers: 3,
            worker_concurrency: 4,
            cpu_threshold: 2.0,
            parallel_pool_size: default_parallel_pool_size(),
            poll_interval_ms: 1000,
            error_backoff_ms: 5000,
            monitor_interval_secs: 60,
            scheduler_tick_secs: 60,
            reaper_interval_secs: 30,
            lease_ttl_secs: 3600,
            lease_grace_secs: 30,
            payload_ttl_secs: 86_400,
            result_ttl_secs: 604_800,
            shutdown_grace_secs: 30,
            register_default_jobs: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Defaults overridden by the process environment.
    pub fn load() -> Result<Self> {
        Self::from_sources(None, None)
    }

    /// Defaults, then `path`, then the process environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_sources(Some(path.as_ref()), None)
    }

    /// Build from explicit layers. `env` replaces the process environment
    /// when given (keys still carry the `TASKLANE__` prefix).
    pub fn from_sources(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ProcessorConfig::default())?);

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            name: self.queue_name.clone(),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs.max(1)),
            lease_grace: Duration::from_secs(self.lease_grace_secs),
            payload_ttl: Duration::from_secs(self.payload_ttl_secs.max(1)),
            result_ttl: Duration::from_secs(self.result_ttl_secs.max(1)),
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
        }
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
