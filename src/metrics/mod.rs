use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ServiceError, ValidationError};
use crate::store::EventStore;

/// Dimension a metrics query is bucketed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum GroupBy {
    #[default]
    Channel,
    Hour,
    Day,
}

impl GroupBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Group key for a stored event.
    ///
    /// Hour keys are `YYYY-MM-DDTHH:00:00Z`, day keys `YYYY-MM-DD`.
    pub fn key_for(self, channel: &str, ts: DateTime<Utc>) -> String {
        match self {
            Self::Channel => channel.to_string(),
            Self::Hour => ts.format("%Y-%m-%dT%H:00:00Z").to_string(),
            Self::Day => ts.format("%Y-%m-%d").to_string(),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupBy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" => Ok(Self::Channel),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(ValidationError::new(format!(
                "unsupported group_by: {other}"
            ))),
        }
    }
}

/// Normalized aggregation request handed to the store.
///
/// `from <= to` always holds; both bounds are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsFilter {
    pub event_name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub channel: Option<String>,
    pub group_by: GroupBy,
}

impl MetricsFilter {
    /// Whether a stored row falls inside this filter.
    pub fn matches(&self, event_name: &str, channel: &str, ts: DateTime<Utc>) -> bool {
        event_name == self.event_name
            && ts >= self.from
            && ts <= self.to
            && self.channel.as_deref().map_or(true, |c| c == channel)
    }
}

/// One bucket of an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsGroup {
    pub key: String,
    pub total_count: u64,
    pub unique_user_count: u64,
}

/// Raw aggregation output from a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsResult {
    pub total: u64,
    pub unique_users: u64,
    pub groups: Vec<MetricsGroup>,
}

/// Metrics query parameters as they arrive on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsQuery {
    pub event_name: Option<String>,
    pub group_by: Option<String>,
    /// Unix seconds.
    pub from: Option<String>,
    /// Unix seconds.
    pub to: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsResponse {
    pub meta: MetricsMeta,
    pub data: MetricsData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsMeta {
    pub event_name: String,
    pub period: Period,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    pub group_by: &'static str,
}

/// RFC 3339 window bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Period {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filters {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsData {
    pub total_event_count: u64,
    pub unique_event_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<MetricsGroup>,
}

/// Normalizes metrics queries and shapes store results into responses.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    lookback: Duration,
    clock: Clock,
}

impl MetricsAggregator {
    pub fn new(lookback: Duration) -> Self {
        Self {
            lookback,
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Turn raw query parameters into a validated filter.
    pub fn normalize(&self, query: &MetricsQuery) -> Result<MetricsFilter, ValidationError> {
        let event_name = match query.event_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ValidationError::new("event_name is required")),
        };

        let group_by = match query.group_by.as_deref() {
            None | Some("") => GroupBy::Channel,
            Some(raw) => raw.parse()?,
        };

        let from = parse_unix(query.from.as_deref(), "from")?;
        let to = parse_unix(query.to.as_deref(), "to")?;

        let to = match to {
            Some(to) => to,
            None => self.clock.now(),
        };
        let from = match from {
            Some(from) => from,
            None => chrono::Duration::from_std(self.lookback)
                .ok()
                .and_then(|lookback| to.checked_sub_signed(lookback))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };

        if from > to {
            return Err(ValidationError::new("from must be before to"));
        }

        let channel = query.channel.clone().filter(|c| !c.is_empty());

        Ok(MetricsFilter {
            event_name,
            from,
            to,
            channel,
            group_by,
        })
    }

    /// Validate a query, aggregate it in the store and build the response.
    pub async fn resolve<S: EventStore>(
        &self,
        store: &S,
        query: &MetricsQuery,
    ) -> Result<MetricsResponse, ServiceError> {
        let filter = self.normalize(query)?;

        let result = store
            .fetch_metrics(&filter)
            .await
            .map_err(ServiceError::Persistence)?;

        Ok(build_response(&filter, result))
    }
}

/// Assemble the response envelope for a filter and its aggregation.
pub fn build_response(filter: &MetricsFilter, result: MetricsResult) -> MetricsResponse {
    MetricsResponse {
        meta: MetricsMeta {
            event_name: filter.event_name.clone(),
            period: Period {
                start: filter.from.to_rfc3339_opts(SecondsFormat::Secs, true),
                end: filter.to.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            filters: filter.channel.as_ref().map(|channel| Filters {
                channel: channel.clone(),
            }),
            group_by: filter.group_by.as_str(),
        },
        data: MetricsData {
            total_event_count: result.total,
            unique_event_count: result.unique_users,
            groups: result.groups,
        },
    }
}

fn parse_unix(raw: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return Ok(None);
    };

    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(Some)
        .ok_or_else(|| ValidationError::new(format!("{field} must be a unix timestamp")))
}
