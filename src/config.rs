use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the eventpipe service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Public HTTP API configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Backing event store selection.
    #[serde(default)]
    pub store: StoreConfig,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Ingestion pipeline configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Metrics query configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Public HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Which store backend holds events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    ClickHouse,
    Memory,
}

impl Default for StoreKind {
    fn default() -> Self {
        Self::ClickHouse
    }
}

/// Store backend configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend kind (clickhouse, memory). Default: clickhouse.
    #[serde(default)]
    pub kind: StoreKind,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port). Default: "localhost:9000".
    #[serde(default = "default_clickhouse_endpoint")]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username. Default: "default".
    #[serde(default = "default_username")]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Connection attempts before giving up on startup. Default: 20.
    #[serde(default = "default_ping_retries")]
    pub ping_retries: u32,

    /// Initial delay between connection attempts. Default: 1500ms.
    #[serde(default = "default_ping_delay", with = "humantime_serde")]
    pub ping_delay: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// How accepted events reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Enqueue into the batch buffer; the background flusher writes batches.
    Buffered,
    /// Write each event synchronously within the request.
    Direct,
}

impl Default for IngestMode {
    fn default() -> Self {
        Self::Buffered
    }
}

/// Ingestion pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Delivery mode (buffered, direct). Default: buffered.
    #[serde(default)]
    pub mode: IngestMode,

    /// How far in the future an event timestamp may be. Zero disables the
    /// check. Default: 0s.
    #[serde(default = "default_future_tolerance", with = "humantime_serde")]
    pub future_tolerance: Duration,

    /// Capacity of the pending-event queue. Default: 10000.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Events per batch insert. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between flushes. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Upper bound on a single batch write. Default: 5s.
    #[serde(default = "default_flush_timeout", with = "humantime_serde")]
    pub flush_timeout: Duration,

    /// Maximum events accepted by one bulk request. Default: 1000.
    #[serde(default = "default_bulk_limit")]
    pub bulk_limit: usize,
}

/// Metrics query configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Window applied when a query omits `from`. Default: 30 days.
    #[serde(default = "default_lookback", with = "humantime_serde")]
    pub lookback: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_clickhouse_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_username() -> String {
    "default".to_string()
}

fn default_ping_retries() -> u32 {
    20
}

fn default_ping_delay() -> Duration {
    Duration::from_millis(1500)
}

fn default_future_tolerance() -> Duration {
    Duration::ZERO
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_flush_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_bulk_limit() -> usize {
    1000
}

fn default_lookback() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            ingest: IngestConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_clickhouse_endpoint(),
            database: default_database(),
            username: default_username(),
            password: String::new(),
            ping_retries: default_ping_retries(),
            ping_delay: default_ping_delay(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: IngestMode::default(),
            future_tolerance: default_future_tolerance(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            flush_timeout: default_flush_timeout(),
            bulk_limit: default_bulk_limit(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        if self.store.kind == StoreKind::ClickHouse {
            if self.clickhouse.endpoint.is_empty() {
                bail!("clickhouse.endpoint is required when store.kind is clickhouse");
            }
            if self.clickhouse.database.is_empty() {
                bail!("clickhouse.database is required when store.kind is clickhouse");
            }
            if self.clickhouse.ping_retries == 0 {
                bail!("clickhouse.ping_retries must be positive");
            }
        }

        let ingest = &self.ingest;
        if ingest.buffer_size == 0 {
            bail!("ingest.buffer_size must be positive");
        }
        if ingest.batch_size == 0 {
            bail!("ingest.batch_size must be positive");
        }
        if ingest.flush_interval.is_zero() {
            bail!("ingest.flush_interval must be positive");
        }
        if ingest.flush_timeout.is_zero() {
            bail!("ingest.flush_timeout must be positive");
        }
        if ingest.bulk_limit == 0 {
            bail!("ingest.bulk_limit must be positive");
        }

        if self.metrics.lookback.is_zero() {
            bail!("metrics.lookback must be positive");
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand into a bindable address.
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
