//! Bus configuration, loadable from JSON.
//!
//! ```json
//! {
//!   "transport": { "kind": "log", "path": "var/events.journal", "fsync": true, "compact_threshold": 50000 },
//!   "retry": { "max_attempts": 5, "backoff": { "kind": "fixed", "delay_ms": 200 } },
//!   "workers": 2
//! }
//! ```
//!
//! Every field is optional; missing ones take the defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::{Backoff, RetryPolicy};
use crate::publisher::PublisherOptions;
use crate::transport::{DeliveryGuarantee, TransportOptions, DEFAULT_COMPACT_THRESHOLD};
use crate::worker::WorkerOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which bundled transport to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    InMemory {
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default)]
        guarantee: DeliveryGuarantee,
    },
    Log {
        path: PathBuf,
        #[serde(default)]
        fsync: bool,
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default)]
        guarantee: DeliveryGuarantee,
        /// Journal entries between automatic compactions; 0 turns them off.
        #[serde(default = "default_compact_threshold")]
        compact_threshold: usize,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::InMemory {
            capacity: default_capacity(),
            guarantee: DeliveryGuarantee::default(),
        }
    }
}

impl TransportConfig {
    pub fn log(path: impl Into<PathBuf>) -> Self {
        TransportConfig::Log {
            path: path.into(),
            fsync: false,
            capacity: default_capacity(),
            guarantee: DeliveryGuarantee::default(),
            compact_threshold: default_compact_threshold(),
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            TransportConfig::InMemory { capacity, .. } | TransportConfig::Log { capacity, .. } => {
                *capacity
            }
        }
    }

    pub fn guarantee(&self) -> DeliveryGuarantee {
        match self {
            TransportConfig::InMemory { guarantee, .. }
            | TransportConfig::Log { guarantee, .. } => *guarantee,
        }
    }
}

/// Settings for [`EventBus::start`](crate::EventBus::start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Lease length. A delivery not settled within it is redelivered.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub deduplicate: bool,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// Partition keys whose last sequence token the publisher keeps cached.
    #[serde(default = "default_sequence_cache")]
    pub sequence_cache: usize,
    /// How long `EventBus::shutdown` waits for busy workers. Absent waits
    /// for every handler to finish.
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,
}

fn default_capacity() -> usize {
    10_000
}
fn default_workers() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_submit_timeout_ms() -> u64 {
    1_000
}
fn default_ack_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_dedup_window() -> usize {
    10_000
}
fn default_sequence_cache() -> usize {
    10_000
}
fn default_compact_threshold() -> usize {
    DEFAULT_COMPACT_THRESHOLD
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            retry: RetryPolicy::default(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            deduplicate: true,
            dedup_window: default_dedup_window(),
            sequence_cache: default_sequence_cache(),
            shutdown_timeout_ms: None,
        }
    }
}

impl BusConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.transport.capacity() == 0 {
            return Err(ConfigError::Invalid("transport.capacity must be at least 1".into()));
        }
        if let Backoff::Exponential { multiplier, .. } = self.retry.backoff {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(ConfigError::Invalid(
                    "retry.backoff.multiplier must be at least 1.0".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval_ms = poll_interval.as_millis() as u64;
        self
    }

    pub fn with_submit_timeout(mut self, submit_timeout: Duration) -> Self {
        self.submit_timeout_ms = submit_timeout.as_millis() as u64;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout_ms = ack_timeout.as_millis() as u64;
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout_ms = Some(shutdown_timeout.as_millis() as u64);
        self
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_ms.map(Duration::from_millis)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions::default()
            .with_capacity(self.transport.capacity())
            .with_guarantee(self.transport.guarantee())
            .with_ack_timeout(Duration::from_millis(self.ack_timeout_ms))
    }

    pub fn publisher_options(&self) -> PublisherOptions {
        PublisherOptions::default()
            .with_submit_timeout(Duration::from_millis(self.submit_timeout_ms))
            .with_deduplicate(self.deduplicate)
            .with_dedup_window(self.dedup_window)
            .with_sequence_cache(self.sequence_cache)
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .with_workers(self.workers)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}
