use std::fmt::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::error::ValidationError;

/// Inbound event payload as received from clients.
///
/// Every field defaults when missing so that validation, not
/// deserialization, reports what is absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventRequest {
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Bulk ingestion payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkEventsRequest {
    #[serde(default)]
    pub events: Vec<EventRequest>,
}

/// A validated, content-addressed event ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_name: String,
    pub channel: String,
    /// Empty when the event has no campaign.
    pub campaign_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    /// Lowercase hex SHA-256 over the identifying fields.
    pub dedup_key: String,
}

impl Event {
    /// Metadata serialized for storage, `{}` when empty.
    pub fn metadata_json(&self) -> String {
        if self.metadata.is_empty() {
            return "{}".to_string();
        }
        Value::Object(self.metadata.clone()).to_string()
    }
}

/// Derive the deduplication key for an event.
///
/// The key covers `user|name|channel|unix_seconds|campaign`; two events that
/// agree on all five collapse into one row in the store.
pub fn dedup_key(
    user_id: &str,
    event_name: &str,
    channel: &str,
    unix_secs: i64,
    campaign_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(event_name.as_bytes());
    hasher.update(b"|");
    hasher.update(channel.as_bytes());
    hasher.update(b"|");
    hasher.update(unix_secs.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(campaign_id.as_bytes());
    let digest = hasher.finalize();

    let mut key = String::with_capacity(64);
    for byte in digest.iter() {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

/// Validates raw requests and produces canonical events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    future_tolerance: Duration,
    clock: Clock,
}

impl EventBuilder {
    /// Creates a builder. A zero tolerance disables the future-timestamp check.
    pub fn new(future_tolerance: Duration) -> Self {
        Self {
            future_tolerance,
            clock: Clock::System,
        }
    }

    /// Replaces the clock used for the future-timestamp check.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Validate a request and build the event it describes.
    pub fn build(&self, req: EventRequest) -> Result<Event, ValidationError> {
        if req.event_name.is_empty() {
            return Err(ValidationError::new("event_name is required"));
        }
        if req.channel.is_empty() {
            return Err(ValidationError::new("channel is required"));
        }
        if req.user_id.is_empty() {
            return Err(ValidationError::new("user_id is required"));
        }
        if req.timestamp == 0 {
            return Err(ValidationError::new("timestamp is required"));
        }

        let timestamp = DateTime::<Utc>::from_timestamp(req.timestamp, 0)
            .ok_or_else(|| ValidationError::new("timestamp is out of range"))?;

        if !self.future_tolerance.is_zero() {
            let limit = chrono::Duration::from_std(self.future_tolerance)
                .ok()
                .and_then(|tolerance| self.clock.now().checked_add_signed(tolerance));
            if matches!(limit, Some(limit) if timestamp > limit) {
                return Err(ValidationError::new("timestamp cannot be in the future"));
            }
        }

        let campaign_id = req.campaign_id.unwrap_or_default();
        let dedup_key = dedup_key(
            &req.user_id,
            &req.event_name,
            &req.channel,
            req.timestamp,
            &campaign_id,
        );

        Ok(Event {
            event_name: req.event_name,
            channel: req.channel,
            campaign_id,
            user_id: req.user_id,
            timestamp,
            tags: req.tags.unwrap_or_default(),
            metadata: req.metadata.unwrap_or_default(),
            dedup_key,
        })
    }
}
