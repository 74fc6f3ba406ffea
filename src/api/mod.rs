use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::bind_addr;
use crate::error::ServiceError;
use crate::event::{BulkEventsRequest, EventRequest};
use crate::metrics::MetricsQuery;
use crate::service::EventService;
use crate::store::EventStore;

/// Builds the public API router.
pub fn router<S: EventStore>(service: Arc<EventService<S>>) -> Router {
    Router::new()
        .route("/events", post(create_event::<S>))
        .route("/events/bulk", post(create_events_bulk::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/health", get(health))
        .with_state(service)
}

/// Running public API listener.
pub struct ApiServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ApiServer {
    /// Binds the listener and starts serving in the background.
    pub async fn start<S: EventStore>(addr: &str, service: Arc<EventService<S>>) -> Result<Self> {
        let bind = bind_addr(addr);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let app = router(service);
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();

        let task = tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "API server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        });

        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await.context("joining API server task")?;
        tracing::info!("API server stopped");
        Ok(())
    }
}

/// POST /events
async fn create_event<S: EventStore>(
    State(service): State<Arc<EventService<S>>>,
    body: Bytes,
) -> Response {
    let req: EventRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    match service.ingest(req).await {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(e) => error_response(e, "failed to process event"),
    }
}

/// POST /events/bulk
async fn create_events_bulk<S: EventStore>(
    State(service): State<Arc<EventService<S>>>,
    body: Bytes,
) -> Response {
    let req: BulkEventsRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    match service.ingest_bulk(req).await {
        Ok(result) => (StatusCode::ACCEPTED, Json(result)).into_response(),
        Err(e) => error_response(e, "failed to process events"),
    }
}

/// GET /metrics
async fn get_metrics<S: EventStore>(
    State(service): State<Arc<EventService<S>>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    match service.metrics(&query).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e, "failed to fetch metrics"),
    }
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid json payload").into_response())
}

/// Client errors echo their message; server errors are logged and masked.
fn error_response(err: ServiceError, internal_message: &'static str) -> Response {
    match err {
        ServiceError::Validation(e) => (StatusCode::BAD_REQUEST, e.message).into_response(),
        other => {
            let err = format!("{other:#}");
            tracing::error!(error = %err, "{internal_message}");
            (StatusCode::INTERNAL_SERVER_ERROR, internal_message).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IngestError, ValidationError};

    #[test]
    fn test_error_response_status_mapping() {
        let resp = error_response(ValidationError::new("bad").into(), "x");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = error_response(
            ServiceError::Persistence(anyhow::anyhow!("down")),
            "failed to fetch metrics",
        );
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = error_response(IngestError::Closed.into(), "failed to process event");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_json_rejects_malformed_body() {
        let resp = parse_json::<EventRequest>(b"{not json").expect_err("malformed");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = parse_json::<EventRequest>(br#"{"event_name":"a"}"#).expect("valid json");
        assert_eq!(req.event_name, "a");
    }
}
