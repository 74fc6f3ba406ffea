use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{Config, IngestMode};
use crate::error::{ServiceError, ValidationError};
use crate::event::{BulkEventsRequest, Event, EventBuilder, EventRequest};
use crate::health::HealthMetrics;
use crate::ingest::{BatchBuffer, BufferConfig};
use crate::metrics::{MetricsAggregator, MetricsQuery, MetricsResponse};
use crate::store::EventStore;

/// Response body for an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub status: &'static str,
    pub idempotency_key: String,
}

/// Outcome of a bulk ingestion request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkInsertResult {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BulkError>,
}

/// Validation failure for one item of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkError {
    pub index: usize,
    pub error: String,
}

/// Ingestion and metrics use cases over one store.
pub struct EventService<S> {
    store: Arc<S>,
    builder: EventBuilder,
    aggregator: MetricsAggregator,
    /// Absent in direct mode.
    buffer: Option<BatchBuffer>,
    bulk_limit: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: EventStore> EventService<S> {
    /// Builds the service; in buffered mode this spawns the batch flusher.
    pub fn new(store: Arc<S>, cfg: &Config, health: Option<Arc<HealthMetrics>>) -> Self {
        let buffer = match cfg.ingest.mode {
            IngestMode::Buffered => Some(BatchBuffer::start(
                Arc::clone(&store),
                BufferConfig::from(&cfg.ingest),
                health.clone(),
            )),
            IngestMode::Direct => None,
        };

        Self {
            store,
            builder: EventBuilder::new(cfg.ingest.future_tolerance),
            aggregator: MetricsAggregator::new(cfg.metrics.lookback),
            buffer,
            bulk_limit: cfg.ingest.bulk_limit,
            health,
        }
    }

    /// Replaces the clock used for validation and window defaulting.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.builder = self.builder.with_clock(clock.clone());
        self.aggregator = self.aggregator.with_clock(clock);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate one event and hand it to the buffer or the store.
    pub async fn ingest(&self, req: EventRequest) -> Result<Accepted, ServiceError> {
        let event = self.build(req)?;
        let idempotency_key = event.dedup_key.clone();

        match &self.buffer {
            Some(buffer) => buffer.enqueue(event).await?,
            None => self
                .store
                .create(&event)
                .await
                .map_err(ServiceError::Persistence)?,
        }

        Ok(Accepted {
            status: "accepted",
            idempotency_key,
        })
    }

    /// Validate each item independently and accept the valid ones.
    ///
    /// Items whose key repeats within the request count as duplicates. In
    /// buffered mode events are enqueued one at a time, so if the buffer closes
    /// mid-request the error is returned after earlier items were accepted.
    pub async fn ingest_bulk(
        &self,
        req: BulkEventsRequest,
    ) -> Result<BulkInsertResult, ServiceError> {
        if req.events.is_empty() {
            return Err(ValidationError::new("events must not be empty").into());
        }
        if req.events.len() > self.bulk_limit {
            return Err(ValidationError::new(format!(
                "too many events (max {})",
                self.bulk_limit
            ))
            .into());
        }

        let mut result = BulkInsertResult::default();
        let mut seen = HashSet::with_capacity(req.events.len());
        let mut accepted = Vec::with_capacity(req.events.len());

        for (index, item) in req.events.into_iter().enumerate() {
            match self.build(item) {
                Ok(event) => {
                    if seen.insert(event.dedup_key.clone()) {
                        accepted.push(event);
                    } else {
                        result.duplicates += 1;
                    }
                }
                Err(ServiceError::Validation(e)) => {
                    result.failed += 1;
                    result.errors.push(BulkError {
                        index,
                        error: e.message,
                    });
                }
                Err(other) => return Err(other),
            }
        }

        result.inserted = accepted.len();

        match &self.buffer {
            Some(buffer) => {
                for event in accepted {
                    buffer.enqueue(event).await?;
                }
            }
            None => self
                .store
                .create_batch(&accepted)
                .await
                .map_err(ServiceError::Persistence)?,
        }

        debug!(
            inserted = result.inserted,
            duplicates = result.duplicates,
            failed = result.failed,
            "bulk ingest processed",
        );

        Ok(result)
    }

    /// Resolve a metrics query.
    pub async fn metrics(&self, query: &MetricsQuery) -> Result<MetricsResponse, ServiceError> {
        if let Some(h) = &self.health {
            h.metrics_queries.inc();
        }
        self.aggregator.resolve(self.store.as_ref(), query).await
    }

    /// Drain the batch buffer, if any.
    pub async fn shutdown(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.shutdown().await;
        }
    }

    fn build(&self, req: EventRequest) -> Result<Event, ServiceError> {
        if let Some(h) = &self.health {
            h.events_received.inc();
        }

        self.builder.build(req).map_err(|e| {
            if let Some(h) = &self.health {
                h.events_rejected.inc();
            }
            ServiceError::Validation(e)
        })
    }
}
