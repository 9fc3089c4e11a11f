pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::extract::TypedValue;
use crate::rule::{PartitionKey, ValueKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage backend the pipeline writes through.
///
/// Value rows are append-only time series partitioned by kind; the seen
/// table is upsert-by-topic. Backends are injected into the pipeline at
/// construction so the pipeline is testable without a database.
#[async_trait]
pub trait Store: Send + Sync {
    /// Most recently stored value for a partition key, if any (ordered by
    /// timestamp descending, limit 1).
    async fn last_value(&self, key: &PartitionKey, kind: ValueKind) -> Result<Option<TypedValue>>;

    /// Append one time-series row to the partition matching the value's kind.
    async fn insert_value(
        &self,
        key: &PartitionKey,
        ts: DateTime<Utc>,
        value: &TypedValue,
    ) -> Result<()>;

    /// Record that a topic without a configured rule was seen; overwrites
    /// the previous snapshot for the same topic.
    async fn upsert_seen(&self, topic: &str, ts: DateTime<Utc>, payload: &str) -> Result<()>;
}
