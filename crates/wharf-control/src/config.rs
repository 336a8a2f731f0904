//! Configuration for wharf-control.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use tracing::warn;
use wharf_build::BuildConfig;
use wharf_state::{BrokerConfig, StateConfig, DEFAULT_MAX_RETRIES};

use crate::error::{ControlError, ControlResult};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::jobs::QueueKind;
use crate::pipeline::DEFAULT_DEPLOYMENT_LEASE;

/// Top-level configuration for the worker service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Ledger database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Queue and lock backends.
    #[serde(default)]
    pub state: StateConfig,

    /// Retry and polling behaviour of the job broker.
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Queue names and message lifetimes.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Paths, limits and runtime binaries for the pipeline.
    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `wharf.toml` in the current directory (if present)
    /// 3. Environment variables with `WHARF_` prefix, `__` separating sections
    pub fn load() -> ControlResult<Self> {
        Self::from_file("wharf.toml")
    }

    /// [`load`](Self::load), falling back to defaults with a warning.
    pub fn load_or_default() -> Self {
        Self::from_file_or_default("wharf.toml")
    }

    pub fn from_file_or_default(path: impl AsRef<std::path::Path>) -> Self {
        Self::from_file(path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            Self::default()
        })
    }

    /// Load configuration from a specific TOML file, with environment overrides.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WHARF_").split("__"))
            .extract()
            .map_err(|e| ControlError::configuration(e.to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "postgres://localhost/wharf".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Job broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// Republishes allowed after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Lease on a received job, renewed every third of its length while the
    /// job runs. A worker that dies mid-job loses the lease after this long.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_visibility_timeout_secs() -> u64 {
    900
}

const fn default_poll_interval_ms() -> u64 {
    250
}

impl BrokerSettings {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_retries: self.max_retries,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Name and message lifetime of one queue. Its dead-letter queue is
/// `<name>_dlq`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QueueSettings {
    pub name: String,
    pub ttl_secs: u64,
}

impl QueueSettings {
    fn new(name: &str, ttl_secs: u64) -> Self {
        Self {
            name: name.to_owned(),
            ttl_secs,
        }
    }

    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// The three job queues.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_deployment_queue")]
    pub deployment: QueueSettings,

    #[serde(default = "default_container_queue")]
    pub container: QueueSettings,

    #[serde(default = "default_source_push_queue")]
    pub source_push: QueueSettings,
}

fn default_deployment_queue() -> QueueSettings {
    QueueSettings::new("deployment_queue", 3600)
}

fn default_container_queue() -> QueueSettings {
    QueueSettings::new("container_operations_queue", 600)
}

fn default_source_push_queue() -> QueueSettings {
    QueueSettings::new("source_push_queue", 1800)
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            deployment: default_deployment_queue(),
            container: default_container_queue(),
            source_push: default_source_push_queue(),
        }
    }
}

/// Which queues this worker consumes, and how many jobs it runs at once
/// per queue.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_queues")]
    pub queues: Vec<QueueKind>,

    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Lease a worker holds on a deployment while building it. A dead
    /// worker's deployment can be rebuilt once this lapses, so keep it below
    /// the broker's visibility timeout.
    #[serde(default = "default_deployment_lease_secs")]
    pub deployment_lease_secs: u64,
}

impl WorkerConfig {
    pub const fn deployment_lease(&self) -> Duration {
        Duration::from_secs(self.deployment_lease_secs)
    }
}

fn default_worker_queues() -> Vec<QueueKind> {
    QueueKind::ALL.to_vec()
}

const fn default_prefetch() -> usize {
    1
}

const fn default_deployment_lease_secs() -> u64 {
    DEFAULT_DEPLOYMENT_LEASE.as_secs()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_worker_queues(),
            prefetch: default_prefetch(),
            deployment_lease_secs: default_deployment_lease_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before it lags.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

const fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}
