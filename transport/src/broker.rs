//! Broker seam: peek-lock messaging over pluggable backends

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::Result;

/// A message as handed to the broker
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Stable message identity, set by the transport
    pub message_id: Uuid,
    /// Serialized envelope
    pub payload: Bytes,
    /// Application properties (interface, adapter, content hash)
    pub properties: HashMap<String, String>,
}

impl BrokerMessage {
    /// Create a broker message
    pub fn new(message_id: Uuid, payload: Bytes, properties: HashMap<String, String>) -> Self {
        Self {
            message_id,
            payload,
            properties,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A delivery handed out under peek-lock
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    /// Message identity
    pub message_id: Uuid,
    /// Serialized envelope
    pub payload: Bytes,
    /// Application properties as published
    pub properties: HashMap<String, String>,
    /// Token guarding settlement of this delivery
    pub lock_token: Uuid,
    /// Deliveries of this message so far, this one included
    pub delivery_count: u32,
    /// When the broker accepted the message
    pub enqueued_at: DateTime<Utc>,
}

/// Peek-lock message broker.
///
/// One topic per interface fans out to one subscription per destination
/// adapter instance. Deliveries are settled per message with the lock token
/// issued at receive time; the broker is the authority on lock validity and
/// fails settlement attempts with stale tokens.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Create the topic if missing (idempotent)
    async fn ensure_topic(&self, topic_name: &str) -> Result<()>;

    /// Create the subscription if missing (idempotent)
    async fn ensure_subscription(&self, topic_name: &str, subscription_name: &str) -> Result<()>;

    /// Publish one message
    async fn send(&self, topic_name: &str, message: BrokerMessage) -> Result<()>;

    /// Publish a pre-sized batch. Callers are responsible for keeping the
    /// total under [`MessageBroker::max_batch_bytes`].
    async fn send_batch(&self, topic_name: &str, messages: Vec<BrokerMessage>) -> Result<()>;

    /// Pull up to `max_messages` from a subscription under peek-lock
    async fn receive(
        &self,
        topic_name: &str,
        subscription_name: &str,
        max_messages: usize,
        lock_duration: Duration,
    ) -> Result<Vec<BrokerDelivery>>;

    /// Settle a delivery as processed
    async fn complete(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()>;

    /// Release a delivery for redelivery
    async fn abandon(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()>;

    /// Move a delivery to the subscription's dead-letter queue
    async fn dead_letter(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
        reason: &str,
    ) -> Result<()>;

    /// Non-destructive look at the most recent payloads on a topic. Never
    /// locks or consumes.
    async fn peek(&self, topic_name: &str, max_messages: usize) -> Result<Vec<Bytes>>;

    /// Names of the subscriptions currently existing on a topic
    async fn list_subscriptions(&self, topic_name: &str) -> Result<Vec<String>>;

    /// Size limit for a single message or batch, in bytes
    fn max_batch_bytes(&self) -> usize;
}
