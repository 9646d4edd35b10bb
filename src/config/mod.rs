//! Typed configuration.
//!
//! `Config` loads once at startup from environment variables and fails fast if
//! required vars are missing. Consumer settings can also come from a TOML
//! file. The connection string is wrapped in `SecretString` to keep it out of
//! logs.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Collection location
// ---------------------------------------------------------------------------

/// Where a set of documents lives inside the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionDefinition {
    pub db_name: String,
    pub collection_name: String,
    /// Provisioning hint passed to `ensure_collection`.
    #[serde(default = "default_throughput")]
    pub throughput: u32,
}

fn default_throughput() -> u32 {
    400
}

impl CollectionDefinition {
    pub fn new(db_name: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            collection_name: collection_name.into(),
            throughput: default_throughput(),
        }
    }

    pub fn throughput(mut self, throughput: u32) -> Self {
        self.throughput = throughput;
        self
    }

    /// Fully qualified `db/collection` key used by the stores.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.db_name, self.collection_name)
    }
}

// ---------------------------------------------------------------------------
// Consumer / producer settings
// ---------------------------------------------------------------------------

/// Settings for a consumer session.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Collection holding queue items.
    pub queue_collection: CollectionDefinition,
    /// Collection holding change-feed leases and checkpoints.
    pub lease_collection: CollectionDefinition,
    /// Worker identity. Empty means "generate one at start".
    pub worker_id: String,
    pub lease_renew_interval: Duration,
    /// Lease duration stamped on claimed items.
    pub processing_item_timeout: Duration,
    pub single_threaded_processing: bool,
    pub auto_complete: bool,
    pub start_from_beginning: bool,
    pub max_batch_size: usize,
    /// Period of the expired-lease sweep. `None` disables it.
    pub reclaim_interval: Option<Duration>,
}

impl ConsumerSettings {
    pub fn new(queue_collection: CollectionDefinition, lease_collection: CollectionDefinition) -> Self {
        Self {
            queue_collection,
            lease_collection,
            worker_id: "default".to_string(),
            lease_renew_interval: Duration::from_secs(15),
            processing_item_timeout: Duration::from_secs(60),
            single_threaded_processing: false,
            auto_complete: true,
            start_from_beginning: true,
            max_batch_size: 100,
            reclaim_interval: Some(Duration::from_secs(30)),
        }
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn processing_item_timeout(mut self, timeout: Duration) -> Self {
        self.processing_item_timeout = timeout;
        self
    }

    pub fn single_threaded(mut self, single_threaded: bool) -> Self {
        self.single_threaded_processing = single_threaded;
        self
    }

    pub fn auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    pub fn start_from_beginning(mut self, from_beginning: bool) -> Self {
        self.start_from_beginning = from_beginning;
        self
    }

    pub fn reclaim_interval(mut self, interval: Option<Duration>) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Parse a `[consumer]` table. Durations are given in seconds.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConsumerFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad consumer config: {e}")))?;
        Ok(file.consumer.into())
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read consumer config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}

/// Settings for a producer.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub queue_collection: CollectionDefinition,
}

impl ProducerSettings {
    pub fn new(queue_collection: CollectionDefinition) -> Self {
        Self { queue_collection }
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ConsumerFile {
    consumer: ConsumerToml,
}

#[derive(Debug, Deserialize)]
struct ConsumerToml {
    queue_collection: CollectionDefinition,
    lease_collection: CollectionDefinition,
    #[serde(default = "default_worker_id")]
    worker_id: String,
    #[serde(default = "default_lease_renew_secs")]
    lease_renew_interval_secs: u64,
    #[serde(default = "default_item_timeout_secs")]
    processing_item_timeout_secs: u64,
    #[serde(default)]
    single_threaded_processing: bool,
    #[serde(default = "default_true")]
    auto_complete: bool,
    #[serde(default = "default_true")]
    start_from_beginning: bool,
    #[serde(default = "default_max_batch_size")]
    max_batch_size: usize,
    /// 0 disables the sweep.
    #[serde(default = "default_reclaim_secs")]
    reclaim_interval_secs: u64,
}

fn default_worker_id() -> String {
    "default".to_string()
}

fn default_lease_renew_secs() -> u64 {
    15
}

fn default_item_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    100
}

fn default_reclaim_secs() -> u64 {
    30
}

impl From<ConsumerToml> for ConsumerSettings {
    fn from(t: ConsumerToml) -> Self {
        Self {
            queue_collection: t.queue_collection,
            lease_collection: t.lease_collection,
            worker_id: t.worker_id,
            lease_renew_interval: Duration::from_secs(t.lease_renew_interval_secs),
            processing_item_timeout: Duration::from_secs(t.processing_item_timeout_secs),
            single_threaded_processing: t.single_threaded_processing,
            auto_complete: t.auto_complete,
            start_from_beginning: t.start_from_beginning,
            max_batch_size: t.max_batch_size.max(1),
            reclaim_interval: (t.reclaim_interval_secs > 0)
                .then(|| Duration::from_secs(t.reclaim_interval_secs)),
        }
    }
}

// ---------------------------------------------------------------------------
// Process configuration
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub db_name: String,
    pub queue_collection: String,
    pub lease_collection: String,
    pub worker_id: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            db_name: var_or("DOCQUEUE_DB", "docqueue"),
            queue_collection: var_or("DOCQUEUE_QUEUE_COLLECTION", "queue"),
            lease_collection: var_or("DOCQUEUE_LEASE_COLLECTION", "leases"),
            worker_id: var_or("DOCQUEUE_WORKER_ID", "default"),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }

    pub fn queue_collection(&self) -> CollectionDefinition {
        CollectionDefinition::new(&self.db_name, &self.queue_collection)
    }

    pub fn lease_collection(&self) -> CollectionDefinition {
        CollectionDefinition::new(&self.db_name, &self.lease_collection)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings::new(self.queue_collection(), self.lease_collection())
            .worker_id(&self.worker_id)
    }

    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings::new(self.queue_collection())
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
