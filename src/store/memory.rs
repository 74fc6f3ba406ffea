use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use dashmap::DashMap;

use crate::event::Event;
use crate::metrics::{MetricsFilter, MetricsGroup, MetricsResult};

use super::EventStore;

/// In-process event store keyed by deduplication key.
///
/// Mirrors the ClickHouse aggregation semantics so the service can run
/// without a database.
#[derive(Default)]
pub struct MemoryStore {
    events: DashMap<String, Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct events held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    // A repeated key never adds a row; the latest write replaces the stored
    // payload, as ReplacingMergeTree does.
    fn insert(&self, event: &Event) {
        self.events.insert(event.dedup_key.clone(), event.clone());
    }
}

impl EventStore for MemoryStore {
    async fn create(&self, event: &Event) -> Result<()> {
        self.insert(event);
        Ok(())
    }

    async fn create_batch(&self, events: &[Event]) -> Result<()> {
        for event in events {
            self.insert(event);
        }
        Ok(())
    }

    async fn fetch_metrics(&self, filter: &MetricsFilter) -> Result<MetricsResult> {
        let mut total = 0u64;
        let mut users: HashSet<String> = HashSet::new();
        // Ordered by key, matching ORDER BY in the SQL backend.
        let mut groups: BTreeMap<String, (u64, HashSet<String>)> = BTreeMap::new();

        for entry in self.events.iter() {
            let event = entry.value();
            if !filter.matches(&event.event_name, &event.channel, event.timestamp) {
                continue;
            }

            total += 1;
            users.insert(event.user_id.clone());

            let key = filter.group_by.key_for(&event.channel, event.timestamp);
            let bucket = groups.entry(key).or_default();
            bucket.0 += 1;
            bucket.1.insert(event.user_id.clone());
        }

        let groups = groups
            .into_iter()
            .map(|(key, (total_count, users))| MetricsGroup {
                key,
                total_count,
                unique_user_count: users.len() as u64,
            })
            .collect();

        Ok(MetricsResult {
            total,
            unique_users: users.len() as u64,
            groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::event::{EventBuilder, EventRequest};
    use crate::metrics::GroupBy;

    fn event(user: &str, channel: &str, ts: i64) -> Event {
        EventBuilder::new(Duration::ZERO)
            .build(EventRequest {
                event_name: "purchase".to_string(),
                channel: channel.to_string(),
                user_id: user.to_string(),
                timestamp: ts,
                ..Default::default()
            })
            .expect("valid event")
    }

    fn filter(group_by: GroupBy) -> MetricsFilter {
        MetricsFilter {
            event_name: "purchase".to_string(),
            from: Utc.timestamp_opt(0, 0).unwrap(),
            to: Utc.timestamp_opt(2_000_000_000, 0).unwrap(),
            channel: None,
            group_by,
        }
    }

    #[tokio::test]
    async fn test_duplicate_keys_collapse_to_one_row() {
        let store = MemoryStore::new();
        let e = event("u1", "web", 1_700_000_000);

        store.create(&e).await.expect("create");
        store.create(&e).await.expect("create again");
        store
            .create_batch(&[e.clone(), e.clone()])
            .await
            .expect("batch");

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_key_keeps_latest_payload() {
        let store = MemoryStore::new();
        let first = event("u1", "web", 1_700_000_000);
        let mut replay = first.clone();
        replay.tags = vec!["retry".to_string()];

        store.create(&first).await.expect("create");
        store.create_batch(&[replay]).await.expect("replay");

        assert_eq!(store.len(), 1);
        let stored = store.events.get(&first.dedup_key).expect("stored event");
        assert_eq!(stored.tags, vec!["retry".to_string()]);

        let result = store
            .fetch_metrics(&filter(GroupBy::Channel))
            .await
            .expect("fetch");
        assert_eq!(result.total, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_ok() {
        let store = MemoryStore::new();
        store.create_batch(&[]).await.expect("empty batch");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_group_by_hour_and_day() {
        let store = MemoryStore::new();
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 15, 0)
            .unwrap()
            .timestamp();
        store
            .create_batch(&[
                event("u1", "web", base),
                event("u2", "web", base + 60),
                event("u1", "ios", base + 3600),
                event("u3", "ios", base + 86_400),
            ])
            .await
            .expect("batch");

        let hourly = store
            .fetch_metrics(&filter(GroupBy::Hour))
            .await
            .expect("hourly");
        assert_eq!(hourly.total, 4);
        assert_eq!(hourly.unique_users, 3);
        let keys: Vec<_> = hourly.groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "2024-01-01T10:00:00Z",
                "2024-01-01T11:00:00Z",
                "2024-01-02T10:00:00Z"
            ]
        );
        assert_eq!(hourly.groups[0].total_count, 2);
        assert_eq!(hourly.groups[0].unique_user_count, 2);

        let daily = store
            .fetch_metrics(&filter(GroupBy::Day))
            .await
            .expect("daily");
        assert_eq!(daily.groups.len(), 2);
        assert_eq!(daily.groups[0].key, "2024-01-01");
        assert_eq!(daily.groups[0].total_count, 3);
        assert_eq!(daily.groups[0].unique_user_count, 2);
    }

    #[tokio::test]
    async fn test_channel_filter_and_window() {
        let store = MemoryStore::new();
        store
            .create_batch(&[
                event("u1", "web", 100),
                event("u2", "web", 200),
                event("u3", "ios", 150),
                event("u4", "web", 300),
            ])
            .await
            .expect("batch");

        let mut f = filter(GroupBy::Channel);
        f.channel = Some("web".to_string());
        f.from = Utc.timestamp_opt(100, 0).unwrap();
        f.to = Utc.timestamp_opt(200, 0).unwrap();

        let result = store.fetch_metrics(&f).await.expect("fetch");
        assert_eq!(result.total, 2);
        assert_eq!(result.unique_users, 2);
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].key, "web");
    }
}
