use crate::extract::{extract, TypedValue};
use crate::rule::{PartitionKey, TopicRule};
use crate::store::Store;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Relative tolerance for double comparison. Matches single-precision
/// fuzziness: values within 1e-5 of each other (relative to the smaller
/// magnitude) count as unchanged.
const DOUBLE_FUZZ: f64 = 1e-5;

/// Whether two values count as equal for change detection. Doubles use a
/// relative tolerance, everything else compares exactly.
pub fn values_equal(a: &TypedValue, b: &TypedValue) -> bool {
    match (a, b) {
        (TypedValue::Double(x), TypedValue::Double(y)) => {
            x == y || (x - y).abs() <= DOUBLE_FUZZ * x.abs().min(y.abs())
        }
        _ => a == b,
    }
}

/// Ingestion pipeline: extraction, change detection and persistence.
///
/// Owns the last-value cache and the seen-topics set. Processing is
/// strictly sequential (one message at a time, driven by the dispatcher),
/// so the cache-then-store lookup cannot race within the process.
pub struct Pipeline {
    store: Arc<dyn Store>,
    /// Partition key -> most recently persisted value
    last_values: HashMap<PartitionKey, TypedValue>,
    /// Topics already recorded in the seen table this process lifetime
    seen_topics: HashSet<String>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            last_values: HashMap::new(),
            seen_topics: HashSet::new(),
        }
    }

    /// Run one message through extract -> compare -> persist.
    ///
    /// Every failure here is per-message: log, drop, return. The caller's
    /// loop keeps running.
    pub async fn handle_rule_message(&mut self, rule: &TopicRule, topic: &str, payload: &[u8]) {
        debug!(topic, len = payload.len(), "Message received");

        let value = match extract(payload, rule) {
            Ok(value) => value,
            Err(e) => {
                warn!(topic, error = %e, "Dropping message");
                return;
            }
        };

        let key = rule.partition_key();
        if !self.should_persist(&key, &value).await {
            debug!(topic, key = %key, "Skipping value, as it has not changed");
            return;
        }

        match self.store.insert_value(&key, Utc::now(), &value).await {
            Ok(()) => {
                self.last_values.insert(key, value);
            }
            Err(e) => {
                // Dropped; cache stays on the last *persisted* value
                error!(topic, key = %key, error = %e, "Failed to store value");
            }
        }
    }

    /// Change detection against the last persisted value for this key.
    ///
    /// Cache first; on a miss the store is consulted once and the cache
    /// seeded. No previous value means the first observation is always
    /// persisted. A failed store read also persists: losing one
    /// deduplication beats losing the sample.
    async fn should_persist(&mut self, key: &PartitionKey, candidate: &TypedValue) -> bool {
        if let Some(previous) = self.last_values.get(key) {
            return !values_equal(previous, candidate);
        }

        match self.store.last_value(key, candidate.kind()).await {
            Ok(Some(previous)) => {
                let changed = !values_equal(&previous, candidate);
                self.last_values.insert(key.clone(), previous);
                changed
            }
            Ok(None) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read last value, persisting anyway");
                true
            }
        }
    }

    /// Catch-all bookkeeping: record the first sighting of every topic.
    ///
    /// Later sightings within this process are ignored; a restart records
    /// the topic again with its then-current payload.
    pub async fn handle_any_message(&mut self, topic: &str, payload: &[u8]) {
        if self.seen_topics.contains(topic) {
            return;
        }
        self.seen_topics.insert(topic.to_string());

        let data = String::from_utf8_lossy(payload);
        if let Err(e) = self.store.upsert_seen(topic, Utc::now(), &data).await {
            error!(topic, error = %e, "Failed to record seen topic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::ValueKind;
    use crate::store::MemoryStore;

    fn double_rule() -> TopicRule {
        TopicRule {
            pattern: "sensors/temp".to_string(),
            json_path: Some("$.value".to_string()),
            kind: ValueKind::Double,
            scale: None,
            group: "g".to_string(),
            name: "temp".to_string(),
            sensor_id: Some(1),
            unit: None,
        }
    }

    fn pipeline() -> (Arc<MemoryStore>, Pipeline) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(store.clone());
        (store, pipeline)
    }

    #[test]
    fn double_equality_is_fuzzy() {
        let a = TypedValue::Double(21.5);
        assert!(values_equal(&a, &TypedValue::Double(21.5)));
        assert!(values_equal(&a, &TypedValue::Double(21.50001)));
        assert!(!values_equal(&a, &TypedValue::Double(22.0)));
        assert!(!values_equal(&a, &TypedValue::Double(21.51)));
    }

    #[test]
    fn other_kinds_compare_exactly() {
        assert!(values_equal(
            &TypedValue::Integer(5),
            &TypedValue::Integer(5)
        ));
        assert!(!values_equal(
            &TypedValue::Integer(5),
            &TypedValue::Integer(6)
        ));
        assert!(!values_equal(
            &TypedValue::Text("on".to_string()),
            &TypedValue::Text("off".to_string())
        ));
        // Kind mismatch is never equal
        assert!(!values_equal(
            &TypedValue::Integer(1),
            &TypedValue::Double(1.0)
        ));
    }

    #[tokio::test]
    async fn first_observation_always_persists() {
        let (store, mut pipeline) = pipeline();
        let key = PartitionKey::SensorId(1);

        assert!(pipeline.should_persist(&key, &TypedValue::Double(1.0)).await);

        // Pre-existing row in the store, no cache entry: store is consulted
        store
            .insert_value(&key, Utc::now(), &TypedValue::Double(2.0))
            .await
            .unwrap();
        assert!(!pipeline.should_persist(&key, &TypedValue::Double(2.0)).await);
        assert!(pipeline.should_persist(&key, &TypedValue::Double(3.0)).await);
    }

    #[tokio::test]
    async fn cache_hit_skips_store_query() {
        let (store, mut pipeline) = pipeline();
        let rule = double_rule();

        pipeline
            .handle_rule_message(&rule, "sensors/temp", br#"{"value": 21.5}"#)
            .await;
        let queries_after_first = store.last_value_queries();

        // Identical repeat: decided from the cache, no further store reads
        pipeline
            .handle_rule_message(&rule, "sensors/temp", br#"{"value": 21.5}"#)
            .await;
        assert_eq!(store.last_value_queries(), queries_after_first);
        assert_eq!(
            store.rows(&PartitionKey::SensorId(1), ValueKind::Double).len(),
            1
        );
    }

    #[tokio::test]
    async fn cache_seeded_from_store_on_miss() {
        let (store, mut pipeline) = pipeline();
        let key = PartitionKey::SensorId(7);
        store
            .insert_value(&key, Utc::now(), &TypedValue::Integer(4))
            .await
            .unwrap();

        // Miss -> one store read, cache seeded
        assert!(!pipeline.should_persist(&key, &TypedValue::Integer(4)).await);
        assert_eq!(store.last_value_queries(), 1);
        // Second call answered from the cache
        assert!(!pipeline.should_persist(&key, &TypedValue::Integer(4)).await);
        assert_eq!(store.last_value_queries(), 1);
    }

    #[tokio::test]
    async fn failed_insert_leaves_cache_unchanged() {
        // A store whose inserts always fail
        struct FailingStore;
        #[async_trait::async_trait]
        impl Store for FailingStore {
            async fn last_value(
                &self,
                _key: &PartitionKey,
                _kind: ValueKind,
            ) -> anyhow::Result<Option<TypedValue>> {
                Ok(None)
            }
            async fn insert_value(
                &self,
                _key: &PartitionKey,
                _ts: chrono::DateTime<Utc>,
                _value: &TypedValue,
            ) -> anyhow::Result<()> {
                anyhow::bail!("disk on fire")
            }
            async fn upsert_seen(
                &self,
                _topic: &str,
                _ts: chrono::DateTime<Utc>,
                _payload: &str,
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut pipeline = Pipeline::new(Arc::new(FailingStore));
        let rule = double_rule();
        pipeline
            .handle_rule_message(&rule, "sensors/temp", br#"{"value": 1.0}"#)
            .await;
        // Value was never persisted, so the next identical message must
        // still be considered changed
        assert!(pipeline
            .should_persist(&PartitionKey::SensorId(1), &TypedValue::Double(1.0))
            .await);
    }

    #[tokio::test]
    async fn catch_all_upserts_once_per_topic() {
        let (store, mut pipeline) = pipeline();

        pipeline.handle_any_message("devices/x/status", b"first").await;
        pipeline.handle_any_message("devices/x/status", b"second").await;
        pipeline.handle_any_message("devices/x/status", b"third").await;

        assert_eq!(store.upserts(), 1);
        assert_eq!(store.seen("devices/x/status").unwrap().data, "first");

        // A different topic gets its own upsert
        pipeline.handle_any_message("devices/y/status", b"hi").await;
        assert_eq!(store.upserts(), 2);
    }

    #[tokio::test]
    async fn group_name_addressing() {
        let (store, mut pipeline) = pipeline();
        let rule = TopicRule {
            sensor_id: None,
            ..double_rule()
        };
        let key = PartitionKey::GroupName {
            group: "g".to_string(),
            name: "temp".to_string(),
        };

        pipeline
            .handle_rule_message(&rule, "sensors/temp", br#"{"value": 1.5}"#)
            .await;
        assert_eq!(store.rows(&key, ValueKind::Double).len(), 1);
    }
}
