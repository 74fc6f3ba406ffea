pub mod clickhouse;
pub mod memory;

use anyhow::Result;

use crate::event::Event;
use crate::metrics::{MetricsFilter, MetricsResult};

pub use self::clickhouse::{ClickHouseConnector, ClickHouseStore};
pub use self::memory::MemoryStore;

/// Persistence gateway for events.
///
/// A repeated deduplication key must never add a row or fail the call. The
/// stored payload for that key is the latest write.
pub trait EventStore: Send + Sync + 'static {
    /// Insert a single event.
    fn create(&self, event: &Event) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Insert a batch of events. An empty slice performs no store call.
    fn create_batch(
        &self,
        events: &[Event],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Aggregate events matching the filter.
    fn fetch_metrics(
        &self,
        filter: &MetricsFilter,
    ) -> impl std::future::Future<Output = Result<MetricsResult>> + Send;
}

/// Store backend selected at startup.
pub enum Store {
    ClickHouse(ClickHouseStore),
    Memory(MemoryStore),
}

impl Store {
    /// Returns the backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClickHouse(_) => "clickhouse",
            Self::Memory(_) => "memory",
        }
    }
}

impl EventStore for Store {
    async fn create(&self, event: &Event) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.create(event).await,
            Self::Memory(s) => s.create(event).await,
        }
    }

    async fn create_batch(&self, events: &[Event]) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.create_batch(events).await,
            Self::Memory(s) => s.create_batch(events).await,
        }
    }

    async fn fetch_metrics(&self, filter: &MetricsFilter) -> Result<MetricsResult> {
        match self {
            Self::ClickHouse(s) => s.fetch_metrics(filter).await,
            Self::Memory(s) => s.fetch_metrics(filter).await,
        }
    }
}
