use thiserror::Error;

/// A request was rejected before reaching the store.
///
/// The message is safe to return to clients verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure to hand an event to the batch buffer.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The buffer has begun shutting down and accepts no more events.
    #[error("batch buffer is closed")]
    Closed,
}

/// Errors surfaced by the event service to its transport.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl ServiceError {
    /// Whether the client caused the failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
