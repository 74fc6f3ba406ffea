use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::bind_addr;

const NAMESPACE: &str = "eventpipe";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "eventpipe" namespace and are served from a listener
/// separate from the public API.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Events received by the ingest endpoints.
    pub events_received: Counter,
    /// Events rejected by validation.
    pub events_rejected: Counter,
    /// Events accepted into the batch buffer.
    pub events_enqueued: Counter,
    /// Successful batch writes.
    pub batches_flushed: Counter,
    /// Batch writes that failed or timed out.
    pub flush_errors: Counter,
    /// Events lost to failed batch writes.
    pub events_dropped: Counter,
    /// Metrics queries served.
    pub metrics_queries: Counter,
    /// Pending events in the batch buffer, sampled at enqueue.
    pub queue_length: Gauge,
    /// Batch write duration (1ms-5s buckets).
    pub flush_duration: Histogram,
    /// Events per successful batch write.
    pub flush_batch_size: Histogram,
    /// Store failures by operation.
    pub store_errors: CounterVec,
    /// Store call duration by operation.
    pub store_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events received by the ingest endpoints.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_rejected = Counter::with_opts(
            Opts::new(
                "events_rejected_total",
                "Total events rejected by validation.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_enqueued = Counter::with_opts(
            Opts::new(
                "events_enqueued_total",
                "Total events accepted into the batch buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_flushed = Counter::with_opts(
            Opts::new("batches_flushed_total", "Total successful batch writes.")
                .namespace(NAMESPACE),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new(
                "flush_errors_total",
                "Total batch writes that failed or timed out.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Total events dropped after a failed batch write.",
            )
            .namespace(NAMESPACE),
        )?;
        let metrics_queries = Counter::with_opts(
            Opts::new("metrics_queries_total", "Total metrics queries served.")
                .namespace(NAMESPACE),
        )?;
        let queue_length = Gauge::with_opts(
            Opts::new(
                "queue_length",
                "Events waiting in the batch buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to write one batch to the store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new("flush_batch_size", "Events per successful batch write.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )?;
        let store_errors = CounterVec::new(
            Opts::new("store_errors_total", "Total store failures by operation.")
                .namespace(NAMESPACE),
            &["operation"],
        )?;
        let store_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_duration_seconds",
                "Store call duration by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["operation"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(events_enqueued.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(metrics_queries.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(store_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_rejected,
            events_enqueued,
            batches_flushed,
            flush_errors,
            events_dropped,
            metrics_queries,
            queue_length,
            flush_duration,
            flush_batch_size,
            store_errors,
            store_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind = bind_addr(addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
