//! Duplicate detection with an in-process cache over a durable store

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::key::idempotency_key;
use crate::store::DedupStore;

/// Deduplication guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Duplicate-detection window applied when the caller passes none
    pub default_window: Duration,
    /// Cache entries older than this are dropped by the purge sweep
    pub cache_ttl: Duration,
    /// Minimum time between purge sweeps
    pub purge_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            default_window: Duration::from_secs(crate::DEFAULT_WINDOW_HOURS * 3_600),
            cache_ttl: Duration::from_secs(crate::DEFAULT_CACHE_TTL_SECONDS),
            purge_interval: Duration::from_secs(crate::DEFAULT_PURGE_INTERVAL_SECONDS),
        }
    }
}

/// Duplicate detector for processed records.
///
/// Checks an in-process seen-key cache first, then the durable store. Store
/// outages degrade to at-least-once: the guard logs and reports "not a
/// duplicate" rather than blocking the message path.
pub struct DeduplicationGuard {
    cache: DashMap<String, DateTime<Utc>>,
    store: Arc<dyn DedupStore>,
    config: DedupConfig,
    last_purge: Mutex<DateTime<Utc>>,
}

impl DeduplicationGuard {
    /// Create a guard over a durable store
    pub fn new(store: Arc<dyn DedupStore>, config: DedupConfig) -> Self {
        Self {
            cache: DashMap::new(),
            store,
            config,
            last_purge: Mutex::new(Utc::now()),
        }
    }

    /// Deterministic idempotency key for a record on an interface
    pub fn generate_key(
        &self,
        record: &HashMap<String, String>,
        interface_name: &str,
        source_instance: Option<Uuid>,
    ) -> String {
        idempotency_key(record, interface_name, source_instance)
    }

    /// Whether `key` was already processed within `window` (defaults to the
    /// configured window). A durable-store hit is promoted into the cache.
    pub async fn is_duplicate(&self, key: &str, window: Option<Duration>) -> bool {
        self.maybe_purge();

        let window = window.unwrap_or(self.config.default_window);
        let cutoff = Utc::now() - to_chrono(window);

        if let Some(seen_at) = self.cache.get(key) {
            if *seen_at > cutoff {
                return true;
            }
        }

        match self.store.find_recent(key, window).await {
            Ok(Some(processed_at)) if processed_at > cutoff => {
                self.cache.insert(key.to_string(), processed_at);
                true
            }
            Ok(_) => false,
            Err(err) => {
                // Fail open on store errors
                warn!("Dedup store unavailable, treating {} as new: {}", key, err);
                false
            }
        }
    }

    /// Remember `key` as processed, in the cache and the durable store.
    /// Store failures are logged and swallowed.
    pub async fn mark_processed(&self, key: &str, interface_name: &str, adapter_name: &str) {
        let now = Utc::now();
        self.cache.insert(key.to_string(), now);

        if let Err(err) = self
            .store
            .record(key, interface_name, adapter_name, now)
            .await
        {
            warn!("Failed to persist dedup record for {}: {}", key, err);
        }
    }

    /// Number of keys currently cached
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop cache entries older than the TTL, at most once per purge
    /// interval.
    fn maybe_purge(&self) {
        let now = Utc::now();
        {
            let mut last = self.last_purge.lock();
            if now - *last < to_chrono(self.config.purge_interval) {
                return;
            }
            *last = now;
        }

        let cutoff = now - to_chrono(self.config.cache_ttl);
        let before = self.cache.len();
        self.cache.retain(|_, seen_at| *seen_at > cutoff);
        let purged = before.saturating_sub(self.cache.len());
        if purged > 0 {
            debug!("Purged {} expired dedup cache entries", purged);
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDedupStore;
    use crate::Result;
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl DedupStore for FailingStore {
        async fn find_recent(&self, _key: &str, _window: Duration) -> Result<Option<DateTime<Utc>>> {
            Err(crate::Error::Store("connection refused".to_string()))
        }

        async fn record(
            &self,
            _key: &str,
            _interface_name: &str,
            _adapter_name: &str,
            _processed_at: DateTime<Utc>,
        ) -> Result<()> {
            Err(crate::Error::Store("connection refused".to_string()))
        }
    }

    fn guard_with(store: Arc<dyn DedupStore>) -> DeduplicationGuard {
        DeduplicationGuard::new(store, DedupConfig::default())
    }

    #[tokio::test]
    async fn test_marked_key_is_duplicate() {
        let guard = guard_with(Arc::new(MemoryDedupStore::new()));

        guard.mark_processed("k1", "orders", "sql-writer").await;
        assert!(guard.is_duplicate("k1", None).await);
        assert!(!guard.is_duplicate("other", None).await);
    }

    #[tokio::test]
    async fn test_zero_window_sees_nothing() {
        let guard = guard_with(Arc::new(MemoryDedupStore::new()));

        guard.mark_processed("k1", "orders", "sql-writer").await;
        assert!(!guard.is_duplicate("k1", Some(Duration::ZERO)).await);
    }

    #[tokio::test]
    async fn test_store_hit_promoted_into_cache() {
        let store = Arc::new(MemoryDedupStore::new());
        store
            .record("k1", "orders", "sql-writer", Utc::now())
            .await
            .unwrap();

        // Fresh guard: nothing cached, answer comes from the store
        let guard = guard_with(store);
        assert_eq!(guard.cache_len(), 0);
        assert!(guard.is_duplicate("k1", None).await);
        assert_eq!(guard.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let guard = guard_with(Arc::new(FailingStore));

        assert!(!guard.is_duplicate("k1", None).await);

        // Write path swallows the store error; the cache still works
        guard.mark_processed("k1", "orders", "sql-writer").await;
        assert!(guard.is_duplicate("k1", None).await);
    }

    #[tokio::test]
    async fn test_lazy_purge_drops_expired_entries() {
        let config = DedupConfig {
            default_window: Duration::from_secs(3_600),
            cache_ttl: Duration::ZERO,
            purge_interval: Duration::ZERO,
        };
        let guard = DeduplicationGuard::new(Arc::new(MemoryDedupStore::new()), config);

        guard.mark_processed("k1", "orders", "sql-writer").await;
        assert_eq!(guard.cache_len(), 1);

        // Any later check runs a sweep; with a zero TTL everything goes
        assert!(!guard.is_duplicate("other", None).await);
        assert_eq!(guard.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_generate_key_ignores_field_order() {
        let guard = guard_with(Arc::new(MemoryDedupStore::new()));

        let mut forward = HashMap::new();
        forward.insert("a".to_string(), "1".to_string());
        forward.insert("b".to_string(), "2".to_string());

        let mut reverse = HashMap::new();
        reverse.insert("b".to_string(), "2".to_string());
        reverse.insert("a".to_string(), "1".to_string());

        assert_eq!(
            guard.generate_key(&forward, "orders", None),
            guard.generate_key(&reverse, "orders", None)
        );
    }
}
