//! NATS JetStream broker
//!
//! Maps the peek-lock contract onto JetStream primitives:
//! - topic        -> file-backed stream (one subject per stream)
//! - subscription -> durable pull consumer with explicit acks
//! - complete     -> ack
//! - abandon      -> nak (JetStream redelivers)
//! - dead-letter  -> publish to the DLQ stream, then terminate
//!
//! Lock tokens are synthesized per delivery and map to held JetStream
//! message handles. JetStream enforces the real lock through the
//! consumer-level ack wait, so the broker stays authoritative: a token
//! for a delivery this process no longer holds settles as `LockLost`.

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{self, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BrokerDelivery, BrokerMessage, MessageBroker};
use crate::message::properties;
use crate::{Error, Result};

/// Header carrying the broker-assigned message id across the wire
const HEADER_MESSAGE_ID: &str = "broker-message-id";
/// Header carrying the original enqueue timestamp (RFC 3339)
const HEADER_ENQUEUED_AT: &str = "broker-enqueued-at";
/// JetStream server-side deduplication header
const HEADER_NATS_MSG_ID: &str = "Nats-Msg-Id";

/// Message properties restored from headers on receive
const PROPERTY_HEADERS: [&str; 6] = [
    properties::INTERFACE_NAME,
    properties::ADAPTER_NAME,
    properties::ADAPTER_TYPE,
    properties::ADAPTER_INSTANCE_ID,
    properties::CONTENT_HASH,
    properties::DEAD_LETTER_REASON,
];

/// NATS broker configuration
#[derive(Debug, Clone)]
pub struct NatsBrokerConfig {
    /// NATS server URL
    pub url: String,
    /// How long JetStream holds a delivery before redelivering it
    pub ack_wait: Duration,
    /// Deliveries after which JetStream stops redelivering
    pub max_deliver: i64,
    /// Retention age for topic streams
    pub max_message_age: Duration,
    /// Server-side deduplication window for `Nats-Msg-Id`
    pub duplicate_window: Duration,
    /// How long a fetch waits for messages before returning
    pub fetch_timeout: Duration,
    /// Payload limit per message or batch
    pub max_batch_bytes: usize,
    /// Name of the stream that collects dead-lettered messages
    pub dlq_stream: String,
}

impl Default for NatsBrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            ack_wait: Duration::from_secs(crate::DEFAULT_LOCK_SECONDS),
            max_deliver: 10,
            max_message_age: Duration::from_secs(24 * 60 * 60),
            duplicate_window: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(5),
            max_batch_bytes: 1024 * 1024,
            dlq_stream: "dlq".to_string(),
        }
    }
}

/// JetStream-backed broker
pub struct NatsBroker {
    jetstream: Context,
    config: NatsBrokerConfig,
    held: DashMap<(Uuid, Uuid), jetstream::Message>,
}

impl NatsBroker {
    /// Connect to NATS and provision the DLQ stream
    pub async fn connect(config: NatsBrokerConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let jetstream = jetstream::new(client);

        let broker = Self {
            jetstream,
            config,
            held: DashMap::new(),
        };
        broker.ensure_dlq_stream().await?;
        Ok(broker)
    }

    /// Deliveries currently held by this process awaiting settlement
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    async fn ensure_dlq_stream(&self) -> Result<()> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: self.config.dlq_stream.clone(),
                subjects: vec![format!("{}.>", self.config.dlq_stream)],
                retention: RetentionPolicy::Limits,
                storage: StorageType::File,
                max_age: self.config.max_message_age,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Broker {
                operation: "create_dlq_stream".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn stream(&self, topic_name: &str) -> Result<stream::Stream> {
        self.jetstream
            .get_stream(topic_name)
            .await
            .map_err(|_| Error::TopicNotFound(topic_name.to_string()))
    }

    fn take_held(&self, message_id: Uuid, lock_token: Uuid) -> Result<jetstream::Message> {
        self.held
            .remove(&(message_id, lock_token))
            .map(|(_, msg)| msg)
            .ok_or(Error::LockLost {
                message_id,
                reason: "no delivery held for this lock token".to_string(),
            })
    }

    fn headers_for(&self, message: &BrokerMessage) -> async_nats::HeaderMap {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(HEADER_MESSAGE_ID, message.message_id.to_string().as_str());
        headers.insert(HEADER_ENQUEUED_AT, Utc::now().to_rfc3339().as_str());

        // Content hash doubles as the server-side deduplication id
        let msg_id = message
            .properties
            .get(properties::CONTENT_HASH)
            .cloned()
            .unwrap_or_else(|| message.message_id.to_string());
        headers.insert(HEADER_NATS_MSG_ID, msg_id.as_str());

        for (name, value) in &message.properties {
            headers.insert(name.as_str(), value.as_str());
        }
        headers
    }

    async fn publish(&self, subject: String, message: BrokerMessage) -> Result<()> {
        if message.size() > self.config.max_batch_bytes {
            return Err(Error::PayloadTooLarge {
                size: message.size(),
                limit: self.config.max_batch_bytes,
            });
        }

        let headers = self.headers_for(&message);
        self.jetstream
            .publish_with_headers(subject, headers, message.payload)
            .await
            .map_err(|e| Error::Broker {
                operation: "publish".to_string(),
                message: e.to_string(),
            })?
            .await
            .map_err(|e| Error::Broker {
                operation: "publish_ack".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

fn header(msg: &jetstream::Message, name: &str) -> Option<String> {
    msg.headers
        .as_ref()
        .and_then(|h| h.get(name))
        .map(|v| v.as_str().to_string())
}

fn delivery_from(msg: &jetstream::Message, lock_token: Uuid) -> BrokerDelivery {
    let message_id = header(msg, HEADER_MESSAGE_ID)
        .and_then(|v| Uuid::parse_str(&v).ok())
        .unwrap_or_else(Uuid::new_v4);

    let enqueued_at = header(msg, HEADER_ENQUEUED_AT)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let delivery_count = msg
        .info()
        .map(|info| info.delivered.max(1) as u32)
        .unwrap_or(1);

    let mut props = HashMap::new();
    for name in PROPERTY_HEADERS {
        if let Some(value) = header(msg, name) {
            props.insert(name.to_string(), value);
        }
    }

    BrokerDelivery {
        message_id,
        payload: msg.payload.clone(),
        properties: props,
        lock_token,
        delivery_count,
        enqueued_at,
    }
}

#[async_trait]
impl MessageBroker for NatsBroker {
    async fn ensure_topic(&self, topic_name: &str) -> Result<()> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: topic_name.to_string(),
                subjects: vec![topic_name.to_string()],
                retention: RetentionPolicy::Limits,
                storage: StorageType::File,
                max_age: self.config.max_message_age,
                duplicate_window: self.config.duplicate_window,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Broker {
                operation: "create_stream".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn ensure_subscription(&self, topic_name: &str, subscription_name: &str) -> Result<()> {
        // Destinations only see traffic sent after they register
        self.stream(topic_name)
            .await?
            .get_or_create_consumer(
                subscription_name,
                pull::Config {
                    durable_name: Some(subscription_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    deliver_policy: DeliverPolicy::New,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Broker {
                operation: "create_consumer".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn send(&self, topic_name: &str, message: BrokerMessage) -> Result<()> {
        self.publish(topic_name.to_string(), message).await
    }

    async fn send_batch(&self, topic_name: &str, messages: Vec<BrokerMessage>) -> Result<()> {
        let total: usize = messages.iter().map(|m| m.size()).sum();
        if total > self.config.max_batch_bytes {
            return Err(Error::PayloadTooLarge {
                size: total,
                limit: self.config.max_batch_bytes,
            });
        }

        for message in messages {
            self.publish(topic_name.to_string(), message).await?;
        }
        Ok(())
    }

    async fn receive(
        &self,
        topic_name: &str,
        subscription_name: &str,
        max_messages: usize,
        _lock_duration: Duration,
    ) -> Result<Vec<BrokerDelivery>> {
        // JetStream enforces the consumer-level ack wait, not a per-call lock
        let consumer = self
            .stream(topic_name)
            .await?
            .get_or_create_consumer(
                subscription_name,
                pull::Config {
                    durable_name: Some(subscription_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    deliver_policy: DeliverPolicy::New,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::SubscriptionNotFound {
                topic_name: topic_name.to_string(),
                subscription_name: format!("{} ({})", subscription_name, e),
            })?;

        let batch = consumer
            .fetch()
            .max_messages(max_messages)
            .expires(self.config.fetch_timeout)
            .messages()
            .await
            .map_err(|e| Error::Broker {
                operation: "fetch".to_string(),
                message: e.to_string(),
            })?;

        let mut deliveries = Vec::new();
        tokio::pin!(batch);
        while let Some(result) = batch.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Error receiving message from {}: {}", subscription_name, e);
                    continue;
                }
            };

            let lock_token = Uuid::new_v4();
            let delivery = delivery_from(&msg, lock_token);
            self.held.insert((delivery.message_id, lock_token), msg);
            deliveries.push(delivery);
        }

        debug!(
            "Fetched {} message(s) from {}/{}",
            deliveries.len(),
            topic_name,
            subscription_name
        );
        Ok(deliveries)
    }

    async fn complete(
        &self,
        _topic_name: &str,
        _subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()> {
        let msg = self.take_held(message_id, lock_token)?;
        msg.ack().await.map_err(|e| Error::Broker {
            operation: "ack".to_string(),
            message: e.to_string(),
        })
    }

    async fn abandon(
        &self,
        _topic_name: &str,
        _subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()> {
        let msg = self.take_held(message_id, lock_token)?;
        msg.ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| Error::Broker {
                operation: "nak".to_string(),
                message: e.to_string(),
            })
    }

    async fn dead_letter(
        &self,
        topic_name: &str,
        _subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
        reason: &str,
    ) -> Result<()> {
        let msg = self.take_held(message_id, lock_token)?;

        let mut headers = msg.headers.clone().unwrap_or_default();
        headers.insert(properties::DEAD_LETTER_REASON, reason);

        let subject = format!("{}.{}", self.config.dlq_stream, topic_name);
        self.jetstream
            .publish_with_headers(subject, headers, msg.payload.clone())
            .await
            .map_err(|e| Error::Broker {
                operation: "dlq_publish".to_string(),
                message: e.to_string(),
            })?
            .await
            .map_err(|e| Error::Broker {
                operation: "dlq_publish_ack".to_string(),
                message: e.to_string(),
            })?;

        warn!("Message {} dead-lettered to {}: {}", message_id, self.config.dlq_stream, reason);

        // Terminate so JetStream never redelivers the original
        msg.ack_with(AckKind::Term)
            .await
            .map_err(|e| Error::Broker {
                operation: "term".to_string(),
                message: e.to_string(),
            })
    }

    async fn peek(&self, topic_name: &str, max_messages: usize) -> Result<Vec<Bytes>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let mut stream = self.stream(topic_name).await?;
        let info = stream.info().await.map_err(|e| Error::Broker {
            operation: "stream_info".to_string(),
            message: e.to_string(),
        })?;

        let last_sequence = info.state.last_sequence;
        if last_sequence == 0 {
            return Ok(Vec::new());
        }
        let start_sequence = last_sequence
            .saturating_sub(max_messages as u64 - 1)
            .max(1);

        // Ephemeral observer consumer, no durable name and no acks
        let consumer = stream
            .create_consumer(pull::Config {
                deliver_policy: DeliverPolicy::ByStartSequence { start_sequence },
                ack_policy: AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Broker {
                operation: "create_peek_consumer".to_string(),
                message: e.to_string(),
            })?;

        let batch = consumer
            .fetch()
            .max_messages(max_messages)
            .expires(self.config.fetch_timeout)
            .messages()
            .await
            .map_err(|e| Error::Broker {
                operation: "peek_fetch".to_string(),
                message: e.to_string(),
            })?;

        let mut payloads = Vec::new();
        tokio::pin!(batch);
        while let Some(result) = batch.next().await {
            match result {
                Ok(msg) => payloads.push(msg.payload.clone()),
                Err(e) => warn!("Error peeking {}: {}", topic_name, e),
            }
        }
        Ok(payloads)
    }

    async fn list_subscriptions(&self, topic_name: &str) -> Result<Vec<String>> {
        let stream = self.stream(topic_name).await?;
        let names = stream.consumer_names();

        let mut subscriptions = Vec::new();
        tokio::pin!(names);
        while let Some(result) = names.next().await {
            subscriptions.push(result.map_err(|e| Error::Broker {
                operation: "consumer_names".to_string(),
                message: e.to_string(),
            })?);
        }
        Ok(subscriptions)
    }

    fn max_batch_bytes(&self) -> usize {
        self.config.max_batch_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests need a JetStream-enabled server:
    // docker run -p 4222:4222 nats:latest -js

    #[test]
    fn test_default_config() {
        let config = NatsBrokerConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.max_deliver, 10);
        assert_eq!(config.dlq_stream, "dlq");
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_round_trip_with_settlement() {
        let broker = NatsBroker::connect(NatsBrokerConfig::default()).await.unwrap();
        broker.ensure_topic("interface-nats-test").await.unwrap();
        broker
            .ensure_subscription("interface-nats-test", "destination-rt")
            .await
            .unwrap();

        let message = BrokerMessage::new(
            Uuid::new_v4(),
            Bytes::from_static(b"{\"k\":\"v\"}"),
            HashMap::new(),
        );
        let id = message.message_id;
        broker.send("interface-nats-test", message).await.unwrap();

        let deliveries = broker
            .receive(
                "interface-nats-test",
                "destination-rt",
                10,
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, id);

        broker
            .complete(
                "interface-nats-test",
                "destination-rt",
                id,
                deliveries[0].lock_token,
            )
            .await
            .unwrap();
        assert_eq!(broker.held_count(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_dead_letter_routes_to_dlq_stream() {
        let broker = NatsBroker::connect(NatsBrokerConfig::default()).await.unwrap();
        broker.ensure_topic("interface-nats-dlq").await.unwrap();
        broker
            .ensure_subscription("interface-nats-dlq", "destination-dlq")
            .await
            .unwrap();

        let message = BrokerMessage::new(
            Uuid::new_v4(),
            Bytes::from_static(b"{\"bad\":true}"),
            HashMap::new(),
        );
        let id = message.message_id;
        broker.send("interface-nats-dlq", message).await.unwrap();

        let deliveries = broker
            .receive(
                "interface-nats-dlq",
                "destination-dlq",
                1,
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        broker
            .dead_letter(
                "interface-nats-dlq",
                "destination-dlq",
                id,
                deliveries[0].lock_token,
                "schema mismatch",
            )
            .await
            .unwrap();

        // Terminated messages never come back
        let redelivered = broker
            .receive(
                "interface-nats-dlq",
                "destination-dlq",
                1,
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(redelivered.is_empty());
    }
}
