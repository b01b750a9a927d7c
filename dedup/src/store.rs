//! Durable deduplication store seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use crate::Result;

/// Durable record of processed idempotency keys.
///
/// Implementations live at the edges (relational store, key-value store);
/// the guard treats the store as a collaborator that may be down and fails
/// open on every error.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Most recent processing timestamp for `key` within `window`, if any
    async fn find_recent(&self, key: &str, window: Duration) -> Result<Option<DateTime<Utc>>>;

    /// Persist `key` as processed at `processed_at`
    async fn record(
        &self,
        key: &str,
        interface_name: &str,
        adapter_name: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// A processed key as remembered by the in-memory store
#[derive(Debug, Clone)]
pub struct StoredKey {
    /// Interface the record belonged to
    pub interface_name: String,
    /// Adapter that processed it
    pub adapter_name: String,
    /// When it was processed
    pub processed_at: DateTime<Utc>,
}

/// In-memory store for tests and single-process deployments
#[derive(Default)]
pub struct MemoryDedupStore {
    entries: DashMap<String, StoredKey>,
}

impl MemoryDedupStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored entry for `key`, if present
    pub fn get(&self, key: &str) -> Option<StoredKey> {
        self.entries.get(key).map(|entry| entry.clone())
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn find_recent(&self, key: &str, window: Duration) -> Result<Option<DateTime<Utc>>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.processed_at > cutoff)
            .map(|entry| entry.processed_at))
    }

    async fn record(
        &self,
        key: &str,
        interface_name: &str,
        adapter_name: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredKey {
                interface_name: interface_name.to_string(),
                adapter_name: adapter_name.to_string(),
                processed_at,
            },
        );
        Ok(())
    }
}
