//! Durable records of in-flight deliveries
//!
//! Every locked delivery is written here so a process that dies mid-flight
//! leaves a trail. A recovery sweep finds records whose locks expired
//! without settlement and releases the messages back to the broker.
//! Writes are advisory: the broker stays authoritative, so persistence
//! failures are logged and never block message flow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Settlement state of a recorded lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Delivery is held under lock, awaiting settlement
    Locked,
    /// Delivery was completed
    Completed,
    /// Delivery was abandoned back to the broker
    Abandoned,
    /// Delivery was dead-lettered
    DeadLettered,
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockStatus::Locked => write!(f, "locked"),
            LockStatus::Completed => write!(f, "completed"),
            LockStatus::Abandoned => write!(f, "abandoned"),
            LockStatus::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// Persistent record of one locked delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightLockRecord {
    /// Message under lock
    pub message_id: Uuid,
    /// Token for the current lock
    pub lock_token: Uuid,
    /// Topic the message was received from
    pub topic_name: String,
    /// Subscription holding the lock
    pub subscription_name: String,
    /// Interface the message belongs to
    pub interface_name: String,
    /// Destination adapter instance that received it
    pub destination_instance_id: Uuid,
    /// Delivery attempt number at lock time
    pub delivery_count: u32,
    /// When the broker lock expires
    pub locked_until: DateTime<Utc>,
    /// Current settlement state
    pub status: LockStatus,
    /// When this record was written
    pub recorded_at: DateTime<Utc>,
}

/// Store for in-flight lock records
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Persist a record for a newly locked delivery
    async fn record_lock(&self, record: InFlightLockRecord) -> Result<()>;

    /// Mark a recorded lock as settled
    async fn update_status(
        &self,
        message_id: Uuid,
        lock_token: Uuid,
        status: LockStatus,
    ) -> Result<()>;

    /// Records still marked locked whose lock expired before `now`
    async fn find_stale(&self, now: DateTime<Utc>) -> Result<Vec<InFlightLockRecord>>;
}

/// In-memory lock store
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: DashMap<(Uuid, Uuid), InFlightLockRecord>,
}

impl MemoryLockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no records are held
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up one record
    pub fn get(&self, message_id: Uuid, lock_token: Uuid) -> Option<InFlightLockRecord> {
        self.records
            .get(&(message_id, lock_token))
            .map(|r| r.clone())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn record_lock(&self, record: InFlightLockRecord) -> Result<()> {
        self.records
            .insert((record.message_id, record.lock_token), record);
        Ok(())
    }

    async fn update_status(
        &self,
        message_id: Uuid,
        lock_token: Uuid,
        status: LockStatus,
    ) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&(message_id, lock_token))
            .ok_or_else(|| {
                Error::LockStore(format!("no lock record for message {}", message_id))
            })?;
        record.status = status;
        Ok(())
    }

    async fn find_stale(&self, now: DateTime<Utc>) -> Result<Vec<InFlightLockRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.status == LockStatus::Locked && entry.locked_until < now)
            .map(|entry| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(locked_until: DateTime<Utc>) -> InFlightLockRecord {
        InFlightLockRecord {
            message_id: Uuid::new_v4(),
            lock_token: Uuid::new_v4(),
            topic_name: "interface-orders".to_string(),
            subscription_name: "destination-d1".to_string(),
            interface_name: "Orders".to_string(),
            destination_instance_id: Uuid::new_v4(),
            delivery_count: 1,
            locked_until,
            status: LockStatus::Locked,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_update() {
        let store = MemoryLockStore::new();
        let rec = record(Utc::now() + Duration::seconds(30));
        let (id, token) = (rec.message_id, rec.lock_token);

        store.record_lock(rec).await.unwrap();
        assert_eq!(store.len(), 1);

        store
            .update_status(id, token, LockStatus::Completed)
            .await
            .unwrap();
        assert_eq!(store.get(id, token).unwrap().status, LockStatus::Completed);
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() {
        let store = MemoryLockStore::new();
        let err = store
            .update_status(Uuid::new_v4(), Uuid::new_v4(), LockStatus::Abandoned)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockStore(_)));
    }

    #[tokio::test]
    async fn test_find_stale_filters_by_status_and_expiry() {
        let store = MemoryLockStore::new();
        let now = Utc::now();

        let expired = record(now - Duration::seconds(10));
        let expired_id = expired.message_id;
        let live = record(now + Duration::seconds(30));
        let settled = record(now - Duration::seconds(10));
        let (settled_id, settled_token) = (settled.message_id, settled.lock_token);

        store.record_lock(expired).await.unwrap();
        store.record_lock(live).await.unwrap();
        store.record_lock(settled).await.unwrap();
        store
            .update_status(settled_id, settled_token, LockStatus::Completed)
            .await
            .unwrap();

        let stale = store.find_stale(now).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].message_id, expired_id);
    }
}
