//! In-memory peek-lock broker for tests and single-process pipelines

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BrokerDelivery, BrokerMessage, MessageBroker};
use crate::{Error, Result};

/// In-memory broker configuration
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// Deliveries after which the broker dead-letters a message on its own
    pub max_delivery_count: u32,
    /// Recent messages retained per topic for peeking
    pub peek_buffer: usize,
    /// Payload limit per message or batch
    pub max_batch_bytes: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_delivery_count: 10,
            peek_buffer: 1_000,
            max_batch_bytes: crate::DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: BrokerMessage,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Debug)]
struct LockedMessage {
    stored: StoredMessage,
    lock_token: Uuid,
    locked_until: DateTime<Utc>,
}

#[derive(Debug)]
struct DeadMessage {
    stored: StoredMessage,
    reason: String,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    pending: VecDeque<StoredMessage>,
    locked: HashMap<Uuid, LockedMessage>,
    dead: Vec<DeadMessage>,
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionState>,
    recent: VecDeque<StoredMessage>,
}

/// In-memory topic/subscription broker with full peek-lock semantics:
/// per-delivery lock tokens, lock expiry with redelivery, per-subscription
/// dead-letter queues and a broker-side delivery-count ceiling.
pub struct InMemoryBroker {
    topics: DashMap<String, TopicState>,
    config: InMemoryBrokerConfig,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

impl InMemoryBroker {
    /// Create a broker
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            topics: DashMap::new(),
            config,
        }
    }

    /// Messages waiting for delivery on a subscription
    pub fn pending_count(&self, topic_name: &str, subscription_name: &str) -> usize {
        self.topics
            .get(topic_name)
            .and_then(|t| t.subscriptions.get(subscription_name).map(|s| s.pending.len()))
            .unwrap_or(0)
    }

    /// Deliveries currently held under lock on a subscription
    pub fn locked_count(&self, topic_name: &str, subscription_name: &str) -> usize {
        self.topics
            .get(topic_name)
            .and_then(|t| t.subscriptions.get(subscription_name).map(|s| s.locked.len()))
            .unwrap_or(0)
    }

    /// Dead-lettered messages on a subscription, with reasons
    pub fn dead_letters(&self, topic_name: &str, subscription_name: &str) -> Vec<(BrokerMessage, String)> {
        self.topics
            .get(topic_name)
            .and_then(|t| {
                t.subscriptions.get(subscription_name).map(|s| {
                    s.dead
                        .iter()
                        .map(|d| (d.stored.message.clone(), d.reason.clone()))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    fn with_topic<T>(
        &self,
        topic_name: &str,
        f: impl FnOnce(&mut TopicState) -> Result<T>,
    ) -> Result<T> {
        let mut topic = self
            .topics
            .get_mut(topic_name)
            .ok_or_else(|| Error::TopicNotFound(topic_name.to_string()))?;
        f(topic.value_mut())
    }

    fn store(&self, topic_state: &mut TopicState, message: BrokerMessage) {
        let stored = StoredMessage {
            message,
            enqueued_at: Utc::now(),
            delivery_count: 0,
        };

        topic_state.recent.push_back(stored.clone());
        while topic_state.recent.len() > self.config.peek_buffer {
            topic_state.recent.pop_front();
        }

        for subscription in topic_state.subscriptions.values_mut() {
            subscription.pending.push_back(stored.clone());
        }
    }

    /// Requeue expired locks; messages over the delivery ceiling go to the
    /// dead-letter queue instead.
    fn release_expired(&self, subscription: &mut SubscriptionState, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = subscription
            .locked
            .iter()
            .filter(|(_, lock)| lock.locked_until <= now)
            .map(|(id, _)| *id)
            .collect();

        for message_id in expired {
            if let Some(lock) = subscription.locked.remove(&message_id) {
                debug!("Lock expired for message {}, releasing", message_id);
                self.requeue_or_dead_letter(subscription, lock.stored, "lock expired");
            }
        }
    }

    fn requeue_or_dead_letter(
        &self,
        subscription: &mut SubscriptionState,
        stored: StoredMessage,
        context: &str,
    ) {
        if stored.delivery_count >= self.config.max_delivery_count {
            warn!(
                "Message {} exceeded broker delivery ceiling of {} ({}), dead-lettering",
                stored.message.message_id, self.config.max_delivery_count, context
            );
            let reason = format!(
                "max delivery count {} reached ({})",
                self.config.max_delivery_count, context
            );
            subscription.dead.push(DeadMessage { stored, reason });
        } else {
            subscription.pending.push_back(stored);
        }
    }
}

fn take_locked(
    subscription: &mut SubscriptionState,
    message_id: Uuid,
    lock_token: Uuid,
    entity: &str,
    now: DateTime<Utc>,
) -> Result<StoredMessage> {
    {
        let lock = subscription
            .locked
            .get(&message_id)
            .ok_or(Error::MessageNotFound {
                message_id,
                entity: entity.to_string(),
            })?;

        if lock.lock_token != lock_token {
            return Err(Error::LockLost {
                message_id,
                reason: "token does not match current lock".to_string(),
            });
        }
        if lock.locked_until <= now {
            // Leave the entry in place; the next receive sweep requeues it
            return Err(Error::LockLost {
                message_id,
                reason: "lock expired".to_string(),
            });
        }
    }

    subscription
        .locked
        .remove(&message_id)
        .map(|lock| lock.stored)
        .ok_or(Error::MessageNotFound {
            message_id,
            entity: entity.to_string(),
        })
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn ensure_topic(&self, topic_name: &str) -> Result<()> {
        self.topics
            .entry(topic_name.to_string())
            .or_insert_with(TopicState::default);
        Ok(())
    }

    async fn ensure_subscription(&self, topic_name: &str, subscription_name: &str) -> Result<()> {
        self.with_topic(topic_name, |topic_state| {
            topic_state
                .subscriptions
                .entry(subscription_name.to_string())
                .or_insert_with(SubscriptionState::default);
            Ok(())
        })
    }

    async fn send(&self, topic_name: &str, message: BrokerMessage) -> Result<()> {
        if message.size() > self.config.max_batch_bytes {
            return Err(Error::PayloadTooLarge {
                size: message.size(),
                limit: self.config.max_batch_bytes,
            });
        }

        self.with_topic(topic_name, |topic_state| {
            self.store(topic_state, message);
            Ok(())
        })
    }

    async fn send_batch(&self, topic_name: &str, messages: Vec<BrokerMessage>) -> Result<()> {
        let total: usize = messages.iter().map(|m| m.size()).sum();
        if total > self.config.max_batch_bytes {
            return Err(Error::PayloadTooLarge {
                size: total,
                limit: self.config.max_batch_bytes,
            });
        }

        self.with_topic(topic_name, |topic_state| {
            for message in messages {
                self.store(topic_state, message);
            }
            Ok(())
        })
    }

    async fn receive(
        &self,
        topic_name: &str,
        subscription_name: &str,
        max_messages: usize,
        lock_duration: Duration,
    ) -> Result<Vec<BrokerDelivery>> {
        let lock_for = chrono::Duration::from_std(lock_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(crate::DEFAULT_LOCK_SECONDS as i64));

        self.with_topic(topic_name, |topic_state| {
            let subscription = topic_state
                .subscriptions
                .get_mut(subscription_name)
                .ok_or_else(|| Error::SubscriptionNotFound {
                    topic_name: topic_name.to_string(),
                    subscription_name: subscription_name.to_string(),
                })?;

            let now = Utc::now();
            self.release_expired(subscription, now);

            let mut deliveries = Vec::new();
            while deliveries.len() < max_messages {
                let Some(mut stored) = subscription.pending.pop_front() else {
                    break;
                };

                stored.delivery_count += 1;
                let lock_token = Uuid::new_v4();

                deliveries.push(BrokerDelivery {
                    message_id: stored.message.message_id,
                    payload: stored.message.payload.clone(),
                    properties: stored.message.properties.clone(),
                    lock_token,
                    delivery_count: stored.delivery_count,
                    enqueued_at: stored.enqueued_at,
                });

                subscription.locked.insert(
                    stored.message.message_id,
                    LockedMessage {
                        stored,
                        lock_token,
                        locked_until: now + lock_for,
                    },
                );
            }

            Ok(deliveries)
        })
    }

    async fn complete(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()> {
        self.with_topic(topic_name, |topic_state| {
            let subscription = topic_state
                .subscriptions
                .get_mut(subscription_name)
                .ok_or_else(|| Error::SubscriptionNotFound {
                    topic_name: topic_name.to_string(),
                    subscription_name: subscription_name.to_string(),
                })?;

            take_locked(subscription, message_id, lock_token, subscription_name, Utc::now())?;
            debug!("Message {} completed on {}", message_id, subscription_name);
            Ok(())
        })
    }

    async fn abandon(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()> {
        self.with_topic(topic_name, |topic_state| {
            let subscription = topic_state
                .subscriptions
                .get_mut(subscription_name)
                .ok_or_else(|| Error::SubscriptionNotFound {
                    topic_name: topic_name.to_string(),
                    subscription_name: subscription_name.to_string(),
                })?;

            let stored =
                take_locked(subscription, message_id, lock_token, subscription_name, Utc::now())?;
            self.requeue_or_dead_letter(subscription, stored, "abandoned");
            Ok(())
        })
    }

    async fn dead_letter(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
        reason: &str,
    ) -> Result<()> {
        self.with_topic(topic_name, |topic_state| {
            let subscription = topic_state
                .subscriptions
                .get_mut(subscription_name)
                .ok_or_else(|| Error::SubscriptionNotFound {
                    topic_name: topic_name.to_string(),
                    subscription_name: subscription_name.to_string(),
                })?;

            let stored =
                take_locked(subscription, message_id, lock_token, subscription_name, Utc::now())?;
            warn!("Message {} dead-lettered: {}", message_id, reason);
            subscription.dead.push(DeadMessage {
                stored,
                reason: reason.to_string(),
            });
            Ok(())
        })
    }

    async fn peek(&self, topic_name: &str, max_messages: usize) -> Result<Vec<Bytes>> {
        self.with_topic(topic_name, |topic_state| {
            let start = topic_state.recent.len().saturating_sub(max_messages);
            Ok(topic_state
                .recent
                .iter()
                .skip(start)
                .map(|stored| stored.message.payload.clone())
                .collect())
        })
    }

    async fn list_subscriptions(&self, topic_name: &str) -> Result<Vec<String>> {
        self.with_topic(topic_name, |topic_state| {
            Ok(topic_state.subscriptions.keys().cloned().collect())
        })
    }

    fn max_batch_bytes(&self) -> usize {
        self.config.max_batch_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &str) -> BrokerMessage {
        BrokerMessage::new(
            Uuid::new_v4(),
            Bytes::copy_from_slice(payload.as_bytes()),
            HashMap::new(),
        )
    }

    async fn broker_with_subscription() -> InMemoryBroker {
        let broker = InMemoryBroker::default();
        broker.ensure_topic("t1").await.unwrap();
        broker.ensure_subscription("t1", "s1").await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_send_receive_complete() {
        let broker = broker_with_subscription().await;
        let msg = message("hello");
        let id = msg.message_id;

        broker.send("t1", msg).await.unwrap();
        assert_eq!(broker.pending_count("t1", "s1"), 1);

        let deliveries = broker
            .receive("t1", "s1", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, id);
        assert_eq!(deliveries[0].delivery_count, 1);
        assert_eq!(broker.pending_count("t1", "s1"), 0);
        assert_eq!(broker.locked_count("t1", "s1"), 1);

        broker
            .complete("t1", "s1", id, deliveries[0].lock_token)
            .await
            .unwrap();
        assert_eq!(broker.locked_count("t1", "s1"), 0);
    }

    #[tokio::test]
    async fn test_receive_unknown_subscription() {
        let broker = InMemoryBroker::default();
        broker.ensure_topic("t1").await.unwrap();

        let err = broker
            .receive("t1", "nope", 10, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubscriptionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_messages_before_subscription_are_not_delivered() {
        let broker = InMemoryBroker::default();
        broker.ensure_topic("t1").await.unwrap();
        broker.send("t1", message("early")).await.unwrap();

        // Subscription created after the send sees nothing, topic semantics
        broker.ensure_subscription("t1", "late").await.unwrap();
        let deliveries = broker
            .receive("t1", "late", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(deliveries.is_empty());

        // The peek buffer still has it
        let peeked = broker.peek("t1", 10).await.unwrap();
        assert_eq!(peeked.len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_redelivers_with_higher_count() {
        let broker = broker_with_subscription().await;
        broker.send("t1", message("retry me")).await.unwrap();

        let first = broker
            .receive("t1", "s1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        broker
            .abandon("t1", "s1", first[0].message_id, first[0].lock_token)
            .await
            .unwrap();

        let second = broker
            .receive("t1", "s1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_count, 2);
        assert_ne!(second[0].lock_token, first[0].lock_token);
    }

    #[tokio::test]
    async fn test_wrong_lock_token_rejected() {
        let broker = broker_with_subscription().await;
        broker.send("t1", message("guarded")).await.unwrap();

        let deliveries = broker
            .receive("t1", "s1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        let id = deliveries[0].message_id;

        let err = broker
            .complete("t1", "s1", id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockLost { .. }));

        // The real token still settles it
        broker
            .complete("t1", "s1", id, deliveries[0].lock_token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_redelivers() {
        let broker = broker_with_subscription().await;
        broker.send("t1", message("slow consumer")).await.unwrap();

        let first = broker
            .receive("t1", "s1", 1, Duration::ZERO)
            .await
            .unwrap();

        // Zero lock duration: the next receive sweep releases it
        let second = broker
            .receive("t1", "s1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);

        // Settling with the stale token fails
        let err = broker
            .complete("t1", "s1", first[0].message_id, first[0].lock_token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockLost { .. }));
    }

    #[tokio::test]
    async fn test_delivery_ceiling_dead_letters() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            max_delivery_count: 2,
            ..InMemoryBrokerConfig::default()
        });
        broker.ensure_topic("t1").await.unwrap();
        broker.ensure_subscription("t1", "s1").await.unwrap();
        broker.send("t1", message("poison")).await.unwrap();

        for _ in 0..2 {
            let deliveries = broker
                .receive("t1", "s1", 1, Duration::from_secs(30))
                .await
                .unwrap();
            broker
                .abandon("t1", "s1", deliveries[0].message_id, deliveries[0].lock_token)
                .await
                .unwrap();
        }

        // Two failed deliveries hit the ceiling; nothing left to deliver
        let deliveries = broker
            .receive("t1", "s1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(deliveries.is_empty());

        let dead = broker.dead_letters("t1", "s1");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("max delivery count"));
    }

    #[tokio::test]
    async fn test_explicit_dead_letter_with_reason() {
        let broker = broker_with_subscription().await;
        broker.send("t1", message("bad record")).await.unwrap();

        let deliveries = broker
            .receive("t1", "s1", 1, Duration::from_secs(30))
            .await
            .unwrap();
        broker
            .dead_letter(
                "t1",
                "s1",
                deliveries[0].message_id,
                deliveries[0].lock_token,
                "schema mismatch",
            )
            .await
            .unwrap();

        let dead = broker.dead_letters("t1", "s1");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "schema mismatch");
    }

    #[tokio::test]
    async fn test_peek_is_non_destructive() {
        let broker = broker_with_subscription().await;
        broker.send("t1", message("observable")).await.unwrap();

        let peeked = broker.peek("t1", 10).await.unwrap();
        assert_eq!(peeked.len(), 1);

        // Peeking did not consume or lock anything
        let deliveries = broker
            .receive("t1", "s1", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
    }

    #[tokio::test]
    async fn test_peek_buffer_keeps_most_recent() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            peek_buffer: 2,
            ..InMemoryBrokerConfig::default()
        });
        broker.ensure_topic("t1").await.unwrap();

        for i in 0..3 {
            broker.send("t1", message(&format!("m{i}"))).await.unwrap();
        }

        let peeked = broker.peek("t1", 10).await.unwrap();
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0], Bytes::from_static(b"m1"));
        assert_eq!(peeked[1], Bytes::from_static(b"m2"));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            max_batch_bytes: 8,
            ..InMemoryBrokerConfig::default()
        });
        broker.ensure_topic("t1").await.unwrap();

        let err = broker
            .send("t1", message("way too big for this broker"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_list_subscriptions() {
        let broker = broker_with_subscription().await;
        broker.ensure_subscription("t1", "s2").await.unwrap();

        let mut subs = broker.list_subscriptions("t1").await.unwrap();
        subs.sort();
        assert_eq!(subs, vec!["s1".to_string(), "s2".to_string()]);
    }
}
