//! In-memory storage backend.
//!
//! Backs the pipeline in tests and local experiments. Mirrors the Postgres
//! backend's semantics (append-only value rows, upsert-by-topic seen
//! records) and counts store accesses so tests can assert cache behavior.

use super::Store;
use crate::extract::TypedValue;
use crate::rule::{PartitionKey, ValueKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub struct ValueRow {
    pub ts: DateTime<Utc>,
    pub value: TypedValue,
}

#[derive(Clone, Debug)]
pub struct SeenRow {
    pub lastseen: DateTime<Utc>,
    pub data: String,
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(PartitionKey, ValueKind), Vec<ValueRow>>>,
    seen: Mutex<HashMap<String, SeenRow>>,
    last_value_queries: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows stored for a key, in insertion order.
    pub fn rows(&self, key: &PartitionKey, kind: ValueKind) -> Vec<ValueRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&(key.clone(), kind))
            .cloned()
            .unwrap_or_default()
    }

    pub fn seen(&self, topic: &str) -> Option<SeenRow> {
        self.seen.lock().unwrap().get(topic).cloned()
    }

    pub fn last_value_queries(&self) -> usize {
        self.last_value_queries.load(Ordering::SeqCst)
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn last_value(&self, key: &PartitionKey, kind: ValueKind) -> Result<Option<TypedValue>> {
        self.last_value_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&(key.clone(), kind))
            .and_then(|rows| rows.last())
            .map(|row| row.value.clone()))
    }

    async fn insert_value(
        &self,
        key: &PartitionKey,
        ts: DateTime<Utc>,
        value: &TypedValue,
    ) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .entry((key.clone(), value.kind()))
            .or_default()
            .push(ValueRow {
                ts,
                value: value.clone(),
            });
        Ok(())
    }

    async fn upsert_seen(&self, topic: &str, ts: DateTime<Utc>, payload: &str) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().insert(
            topic.to_string(),
            SeenRow {
                lastseen: ts,
                data: payload.to_string(),
            },
        );
        Ok(())
    }
}
