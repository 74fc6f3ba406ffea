use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use crate::event::Event;
use crate::health::HealthMetrics;
use crate::metrics::{GroupBy, MetricsFilter, MetricsGroup, MetricsResult};

use super::EventStore;

/// Upper bound on the growing delay between connection attempts.
const MAX_PING_DELAY: Duration = Duration::from_secs(5);
const PING_DELAY_STEP: Duration = Duration::from_millis(500);

const INSERT_COLUMNS: &str =
    "event_name, channel, campaign_id, user_id, ts, tags, metadata, idempotency_key";

/// Opens a ClickHouse native TCP connection pool.
///
/// Uses LZ4 compression and a small pool (min=2, max=5).
pub struct ClickHouseConnector {
    cfg: ClickHouseConfig,
}

impl ClickHouseConnector {
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self { cfg }
    }

    /// Opens the pool, retrying the ping with a growing delay until the
    /// server answers or the attempts run out.
    pub async fn connect(&self) -> Result<Pool> {
        let pool = Pool::new(self.build_dsn());
        let attempts = self.cfg.ping_retries.max(1);
        let mut delay = self.cfg.ping_delay;

        for attempt in 1..=attempts {
            match ping(&pool).await {
                Ok(()) => {
                    tracing::info!(
                        endpoint = %self.cfg.endpoint,
                        database = %self.cfg.database,
                        attempt,
                        "ClickHouse connected",
                    );
                    return Ok(pool);
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        endpoint = %self.cfg.endpoint,
                        attempt,
                        retry_in = ?delay,
                        error = %e,
                        "ClickHouse not ready",
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay + PING_DELAY_STEP).min(MAX_PING_DELAY);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("ClickHouse unreachable after {attempts} attempts")
                    });
                }
            }
        }

        anyhow::bail!("ClickHouse ping_retries must be positive")
    }

    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    fn build_dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}

async fn ping(pool: &Pool) -> Result<()> {
    let mut handle = pool
        .get_handle()
        .await
        .context("opening ClickHouse connection")?;
    handle.ping().await.context("pinging ClickHouse")?;
    Ok(())
}

/// Event store backed by a ReplacingMergeTree `events` table.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStore {
    pub fn new(pool: Pool, database: String, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool,
            database,
            health,
        }
    }

    fn table(&self) -> String {
        format!("{}.events", self.database)
    }

    async fn insert(&self, events: &[Event], operation: &'static str) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let sql = build_insert_sql(&self.table(), events);
        let start = Instant::now();

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {operation}"))?;

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_error(operation);
            return Err(e).with_context(|| format!("sending {operation} ({} rows)", events.len()));
        }

        self.record_duration(operation, start);

        Ok(())
    }

    fn record_error(&self, operation: &str) {
        if let Some(h) = &self.health {
            h.store_errors.with_label_values(&[operation]).inc();
        }
    }

    fn record_duration(&self, operation: &str, start: Instant) {
        if let Some(h) = &self.health {
            h.store_duration
                .with_label_values(&[operation])
                .observe(start.elapsed().as_secs_f64());
        }
    }
}

impl EventStore for ClickHouseStore {
    async fn create(&self, event: &Event) -> Result<()> {
        self.insert(std::slice::from_ref(event), "insert").await
    }

    async fn create_batch(&self, events: &[Event]) -> Result<()> {
        self.insert(events, "insert_batch").await
    }

    async fn fetch_metrics(&self, filter: &MetricsFilter) -> Result<MetricsResult> {
        let table = self.table();
        let where_clause = build_where_clause(filter);
        let totals_sql = build_totals_query(&table, &where_clause);
        let groups_sql = build_group_query(&table, filter.group_by, &where_clause);
        let start = Instant::now();

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for metrics query")?;

        let totals = match handle.query(totals_sql.as_str()).fetch_all().await {
            Ok(block) => block,
            Err(e) => {
                self.record_error("fetch_metrics");
                return Err(e).context("querying metric totals");
            }
        };

        let (total, unique_users) = match totals.rows().next() {
            Some(row) => {
                let total: u64 = row.get("total").context("reading total")?;
                let unique: u64 = row.get("unique_users").context("reading unique_users")?;
                (total, unique)
            }
            None => (0, 0),
        };

        let block = match handle.query(groups_sql.as_str()).fetch_all().await {
            Ok(block) => block,
            Err(e) => {
                self.record_error("fetch_metrics");
                return Err(e).context("querying metric groups");
            }
        };

        let mut groups = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let key: String = row.get("key").context("reading group key")?;
            let total_count: u64 = row.get("total").context("reading group total")?;
            let unique_user_count: u64 =
                row.get("unique_users").context("reading group unique_users")?;
            groups.push(MetricsGroup {
                key,
                total_count,
                unique_user_count,
            });
        }

        self.record_duration("fetch_metrics", start);

        Ok(MetricsResult {
            total,
            unique_users,
            groups,
        })
    }
}

/// Builds a multi-row INSERT for the events table.
fn build_insert_sql(table: &str, events: &[Event]) -> String {
    let mut sql = String::with_capacity(64 + table.len() + events.len() * 256);
    let _ = write!(sql, "INSERT INTO {table} ({INSERT_COLUMNS}) VALUES ");

    for (idx, e) in events.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let campaign = if e.campaign_id.is_empty() {
            "NULL".to_string()
        } else {
            format!("'{}'", escape_sql(&e.campaign_id))
        };

        let _ = write!(
            sql,
            "('{}', '{}', {campaign}, '{}', {}, {}, '{}', '{}')",
            escape_sql(&e.event_name),
            escape_sql(&e.channel),
            escape_sql(&e.user_id),
            format_datetime(e.timestamp),
            format_string_array(&e.tags),
            escape_sql(&e.metadata_json()),
            e.dedup_key,
        );
    }

    sql
}

/// Builds the WHERE clause shared by the totals and group queries.
fn build_where_clause(filter: &MetricsFilter) -> String {
    let mut clause = String::with_capacity(160);
    let _ = write!(
        clause,
        "WHERE event_name = '{}' AND ts >= toDateTime64({}, 3, 'UTC') AND ts <= toDateTime64({}, 3, 'UTC')",
        escape_sql(&filter.event_name),
        format_datetime(filter.from),
        format_datetime(filter.to),
    );

    if let Some(channel) = &filter.channel {
        let _ = write!(clause, " AND channel = '{}'", escape_sql(channel));
    }

    clause
}

// FINAL collapses rows sharing an idempotency key that have not merged yet.
fn build_totals_query(table: &str, where_clause: &str) -> String {
    format!(
        "SELECT count() AS total, uniqExact(user_id) AS unique_users FROM {table} FINAL {where_clause}"
    )
}

fn build_group_query(table: &str, group_by: GroupBy, where_clause: &str) -> String {
    let key = match group_by {
        GroupBy::Channel => "channel",
        GroupBy::Hour => "formatDateTime(ts, '%Y-%m-%dT%H:00:00Z', 'UTC')",
        GroupBy::Day => "formatDateTime(ts, '%Y-%m-%d', 'UTC')",
    };

    format!(
        "SELECT {key} AS key, count() AS total, uniqExact(user_id) AS unique_users \
         FROM {table} FINAL {where_clause} GROUP BY key ORDER BY key"
    )
}

/// Formats a timestamp as a quoted ClickHouse DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn format_string_array(values: &[String]) -> String {
    if values.is_empty() {
        return "[]".to_string();
    }

    let mut out = String::with_capacity(values.len() * 16 + 2);
    out.push('[');
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let escaped = escape_sql(value);
        let _ = write!(out, "'{escaped}'");
    }
    out.push(']');
    out
}
