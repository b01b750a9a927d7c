//! Message transport engine
//!
//! Orchestrates peek-lock messaging over a pluggable broker:
//! - send paths validate, stamp properties and run under retry + breaker
//! - receive tracks every locked delivery in an in-flight table and
//!   persists a lock record for crash recovery
//! - settlement defers to the broker as the single source of truth for
//!   lock validity; a mismatched caller token is logged, never trusted
//!   over the broker's answer

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use resilience::{ResilientExecutor, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerDelivery, BrokerMessage, MessageBroker};
use crate::lock_store::{InFlightLockRecord, LockStatus, LockStore};
use crate::message::{properties, subscription_for_instance, topic_for_interface, Message};
use crate::metrics::{
    TRANSPORT_DEAD_LETTER_TOTAL, TRANSPORT_RECEIVE_TOTAL, TRANSPORT_SEND_DURATION,
    TRANSPORT_SEND_TOTAL, TRANSPORT_SETTLE_TOTAL,
};
use crate::{Error, Result};

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// How long received messages stay locked before the broker
    /// redelivers them
    pub lock_duration: Duration,
    /// Delivery attempts after which the transport dead-letters proactively
    pub max_delivery_count: u32,
    /// Retry policy for broker operations
    pub retry_policy: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(crate::DEFAULT_LOCK_SECONDS),
            max_delivery_count: crate::DEFAULT_MAX_DELIVERY_COUNT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Result of a batch send
#[derive(Debug, Default)]
pub struct BatchSendOutcome {
    /// Ids of messages the broker accepted
    pub sent: Vec<Uuid>,
    /// Messages rejected individually, without aborting the rest
    pub rejected: Vec<(Uuid, Error)>,
}

/// Outcome of a stale-lock recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Locks released back to their subscriptions
    pub recovered: usize,
    /// Locks the broker had already released on its own
    pub already_released: usize,
    /// Records that could not be recovered this sweep
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct InFlightEntry {
    lock_token: Uuid,
    topic_name: String,
    subscription_name: String,
    interface_name: String,
    delivery_count: u32,
}

#[derive(Debug, Clone)]
enum SettleOp {
    Complete,
    Abandon,
    DeadLetter(String),
}

impl SettleOp {
    fn outcome_label(&self) -> &'static str {
        match self {
            SettleOp::Complete => "completed",
            SettleOp::Abandon => "abandoned",
            SettleOp::DeadLetter(_) => "dead_lettered",
        }
    }

    fn status(&self) -> LockStatus {
        match self {
            SettleOp::Complete => LockStatus::Completed,
            SettleOp::Abandon => LockStatus::Abandoned,
            SettleOp::DeadLetter(_) => LockStatus::DeadLettered,
        }
    }
}

/// Peek-lock message transport over a broker
pub struct MessageTransport {
    broker: Arc<dyn MessageBroker>,
    lock_store: Arc<dyn LockStore>,
    executor: Arc<ResilientExecutor>,
    config: TransportConfig,
    in_flight: DashMap<Uuid, InFlightEntry>,
    ensured_topics: DashSet<String>,
    ensured_subscriptions: DashSet<(String, String)>,
}

impl MessageTransport {
    /// Create a transport over the given broker and lock store
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        lock_store: Arc<dyn LockStore>,
        executor: Arc<ResilientExecutor>,
        config: TransportConfig,
    ) -> Self {
        Self {
            broker,
            lock_store,
            executor,
            config,
            in_flight: DashMap::new(),
            ensured_topics: DashSet::new(),
            ensured_subscriptions: DashSet::new(),
        }
    }

    /// Messages currently held under lock by this transport
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Create the topic and subscription for a destination adapter instance
    pub async fn register_destination(
        &self,
        interface_name: &str,
        destination_instance_id: Uuid,
    ) -> Result<String> {
        let topic_name = topic_for_interface(interface_name);
        let subscription_name = subscription_for_instance(destination_instance_id);
        self.ensure_topic_once(&topic_name).await?;
        self.ensure_subscription_once(&topic_name, &subscription_name)
            .await?;
        Ok(subscription_name)
    }

    /// Send one message to its interface topic
    pub async fn send(&self, message: Message, cancel: &CancellationToken) -> Result<Uuid> {
        if message.interface_name.trim().is_empty() {
            return Err(Error::InvalidInput {
                field: "interface_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let interface_name = message.interface_name.clone();
        let topic_name = message.topic_name();
        self.ensure_topic_once(&topic_name).await?;

        let broker_message = self.broker_message(&message)?;
        let message_id = broker_message.message_id;

        let operation_key = format!("send:{}", interface_name);
        let start = Instant::now();
        let broker = Arc::clone(&self.broker);
        let result = self
            .executor
            .execute(&operation_key, &self.config.retry_policy, cancel, move || {
                let broker = Arc::clone(&broker);
                let topic_name = topic_name.clone();
                let broker_message = broker_message.clone();
                async move { broker.send(&topic_name, broker_message).await }
            })
            .await;

        match result {
            Ok(()) => {
                TRANSPORT_SEND_TOTAL
                    .with_label_values(&[&interface_name, "success"])
                    .inc();
                TRANSPORT_SEND_DURATION
                    .with_label_values(&[&interface_name])
                    .observe(start.elapsed().as_secs_f64());
                debug!("Sent message {} to interface {}", message_id, interface_name);
                Ok(message_id)
            }
            Err(e) => {
                TRANSPORT_SEND_TOTAL
                    .with_label_values(&[&interface_name, "error"])
                    .inc();
                Err(Error::from(e))
            }
        }
    }

    /// Send a batch of messages, packing them under the broker size limit.
    ///
    /// Messages that cannot be sent at all (oversized, invalid) are
    /// reported in `rejected` without aborting the rest. A broker failure
    /// surfaces as an error after earlier packs may already have been
    /// accepted; the deduplication layer absorbs the overlap when the
    /// caller retries.
    pub async fn send_batch(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<BatchSendOutcome> {
        let mut outcome = BatchSendOutcome::default();
        if messages.is_empty() {
            return Ok(outcome);
        }

        let mut by_interface: Vec<(String, Vec<BrokerMessage>)> = Vec::new();
        for message in &messages {
            if message.interface_name.trim().is_empty() {
                outcome.rejected.push((
                    message.message_id,
                    Error::InvalidInput {
                        field: "interface_name".to_string(),
                        reason: "must not be empty".to_string(),
                    },
                ));
                continue;
            }
            match self.broker_message(message) {
                Ok(broker_message) => {
                    match by_interface
                        .iter_mut()
                        .find(|(name, _)| name == &message.interface_name)
                    {
                        Some((_, group)) => group.push(broker_message),
                        None => by_interface
                            .push((message.interface_name.clone(), vec![broker_message])),
                    }
                }
                Err(e) => {
                    warn!("Rejecting message {} from batch: {}", message.message_id, e);
                    TRANSPORT_SEND_TOTAL
                        .with_label_values(&[&message.interface_name, "rejected"])
                        .inc();
                    outcome.rejected.push((message.message_id, e));
                }
            }
        }

        let limit = self.broker.max_batch_bytes();
        for (interface_name, group) in by_interface {
            let topic_name = topic_for_interface(&interface_name);
            self.ensure_topic_once(&topic_name).await?;

            let mut packs: Vec<Vec<BrokerMessage>> = Vec::new();
            let mut pack: Vec<BrokerMessage> = Vec::new();
            let mut pack_bytes = 0usize;
            for broker_message in group {
                let size = broker_message.size();
                if !pack.is_empty() && pack_bytes + size > limit {
                    packs.push(std::mem::take(&mut pack));
                    pack_bytes = 0;
                }
                pack_bytes += size;
                pack.push(broker_message);
            }
            if !pack.is_empty() {
                packs.push(pack);
            }

            let operation_key = format!("send-batch:{}", interface_name);
            for pack in packs {
                let ids: Vec<Uuid> = pack.iter().map(|m| m.message_id).collect();
                let broker = Arc::clone(&self.broker);
                let topic = topic_name.clone();
                let result = self
                    .executor
                    .execute(&operation_key, &self.config.retry_policy, cancel, move || {
                        let broker = Arc::clone(&broker);
                        let topic = topic.clone();
                        let pack = pack.clone();
                        async move { broker.send_batch(&topic, pack).await }
                    })
                    .await;

                match result {
                    Ok(()) => {
                        TRANSPORT_SEND_TOTAL
                            .with_label_values(&[&interface_name, "success"])
                            .inc_by(ids.len() as f64);
                        outcome.sent.extend(ids);
                    }
                    Err(e) => {
                        TRANSPORT_SEND_TOTAL
                            .with_label_values(&[&interface_name, "error"])
                            .inc_by(ids.len() as f64);
                        return Err(Error::from(e));
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Receive up to `max_messages` for a destination adapter instance.
    ///
    /// Returned messages carry their lock token and delivery count and
    /// must be settled with [`complete`](Self::complete),
    /// [`abandon`](Self::abandon) or [`dead_letter`](Self::dead_letter).
    pub async fn receive(
        &self,
        interface_name: &str,
        destination_instance_id: Uuid,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let topic_name = topic_for_interface(interface_name);
        let subscription_name = subscription_for_instance(destination_instance_id);
        self.ensure_topic_once(&topic_name).await?;
        self.ensure_subscription_once(&topic_name, &subscription_name)
            .await?;

        let operation_key = format!("receive:{}", subscription_name);
        let lock_duration = self.config.lock_duration;
        let broker = Arc::clone(&self.broker);
        let topic = topic_name.clone();
        let subscription = subscription_name.clone();
        let deliveries = self
            .executor
            .execute(&operation_key, &self.config.retry_policy, cancel, move || {
                let broker = Arc::clone(&broker);
                let topic = topic.clone();
                let subscription = subscription.clone();
                async move {
                    broker
                        .receive(&topic, &subscription, max_messages, lock_duration)
                        .await
                }
            })
            .await
            .map_err(Error::from)?;

        let locked_until = Utc::now() + to_chrono(lock_duration);
        let mut messages = Vec::new();
        for delivery in deliveries {
            let mut message = match Message::from_bytes(&delivery.payload) {
                Ok(message) => message,
                Err(e) => {
                    // Poison payload: hand it back, the delivery ceiling
                    // eventually dead-letters it
                    warn!(
                        "Undecodable payload for message {}, abandoning: {}",
                        delivery.message_id, e
                    );
                    TRANSPORT_RECEIVE_TOTAL
                        .with_label_values(&[interface_name, "decode_error"])
                        .inc();
                    if let Err(abandon_err) = self
                        .broker
                        .abandon(
                            &topic_name,
                            &subscription_name,
                            delivery.message_id,
                            delivery.lock_token,
                        )
                        .await
                    {
                        warn!(
                            "Could not abandon undecodable message {}: {}",
                            delivery.message_id, abandon_err
                        );
                    }
                    continue;
                }
            };

            if delivery.delivery_count > self.config.max_delivery_count {
                let reason = format!(
                    "delivery count {} exceeds limit {}",
                    delivery.delivery_count, self.config.max_delivery_count
                );
                warn!(
                    "Dead-lettering message {} on {}: {}",
                    delivery.message_id, subscription_name, reason
                );
                match self
                    .broker
                    .dead_letter(
                        &topic_name,
                        &subscription_name,
                        delivery.message_id,
                        delivery.lock_token,
                        &reason,
                    )
                    .await
                {
                    Ok(()) => {
                        TRANSPORT_DEAD_LETTER_TOTAL
                            .with_label_values(&[interface_name, "max_deliveries"])
                            .inc();
                    }
                    Err(e) => {
                        warn!("Could not dead-letter message {}: {}", delivery.message_id, e);
                    }
                }
                continue;
            }

            message.lock_token = Some(delivery.lock_token);
            message.delivery_count = delivery.delivery_count;
            self.track(
                &delivery,
                &topic_name,
                &subscription_name,
                interface_name,
                destination_instance_id,
                locked_until,
            )
            .await;
            TRANSPORT_RECEIVE_TOTAL
                .with_label_values(&[interface_name, "success"])
                .inc();
            messages.push(message);
        }

        Ok(messages)
    }

    /// Mark a received message as successfully processed
    pub async fn complete(
        &self,
        message_id: Uuid,
        lock_token: Uuid,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.settle(message_id, lock_token, SettleOp::Complete, cancel)
            .await
    }

    /// Release a received message for redelivery
    pub async fn abandon(
        &self,
        message_id: Uuid,
        lock_token: Uuid,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.settle(message_id, lock_token, SettleOp::Abandon, cancel)
            .await
    }

    /// Move a received message to the dead-letter queue
    pub async fn dead_letter(
        &self,
        message_id: Uuid,
        lock_token: Uuid,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.settle(
            message_id,
            lock_token,
            SettleOp::DeadLetter(reason.to_string()),
            cancel,
        )
        .await
    }

    /// Non-destructive view of the most recent messages on an interface
    pub async fn recent_messages(
        &self,
        interface_name: &str,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let topic_name = topic_for_interface(interface_name);
        self.ensure_topic_once(&topic_name).await?;

        let operation_key = format!("peek:{}", topic_name);
        let broker = Arc::clone(&self.broker);
        let topic = topic_name.clone();
        let payloads = self
            .executor
            .execute(&operation_key, &self.config.retry_policy, cancel, move || {
                let broker = Arc::clone(&broker);
                let topic = topic.clone();
                async move { broker.peek(&topic, max_messages).await }
            })
            .await
            .map_err(Error::from)?;

        let mut messages = Vec::new();
        for payload in payloads {
            match Message::from_bytes(&payload) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping undecodable peeked payload on {}: {}", topic_name, e),
            }
        }
        Ok(messages)
    }

    /// Subscriptions currently attached to an interface topic
    pub async fn subscriptions(&self, interface_name: &str) -> Result<Vec<String>> {
        self.broker
            .list_subscriptions(&topic_for_interface(interface_name))
            .await
    }

    /// Release locks recorded by a previous process that died mid-flight.
    ///
    /// Records whose subscription no longer exists are marked released and
    /// counted as skipped; the broker already owns their fate.
    pub async fn recover_stale_locks(&self, cancel: &CancellationToken) -> Result<RecoveryReport> {
        let stale = self.lock_store.find_stale(Utc::now()).await?;
        let mut report = RecoveryReport::default();
        if stale.is_empty() {
            return Ok(report);
        }

        info!("Recovering {} stale lock(s)", stale.len());
        let mut known_subscriptions: HashMap<String, Vec<String>> = HashMap::new();

        for record in stale {
            if !known_subscriptions.contains_key(&record.topic_name) {
                match self.broker.list_subscriptions(&record.topic_name).await {
                    Ok(list) => {
                        known_subscriptions.insert(record.topic_name.clone(), list);
                    }
                    Err(Error::TopicNotFound(_)) => {
                        known_subscriptions.insert(record.topic_name.clone(), Vec::new());
                    }
                    Err(e) => {
                        warn!(
                            "Could not list subscriptions on {}: {}",
                            record.topic_name, e
                        );
                        report.skipped += 1;
                        continue;
                    }
                }
            }
            let Some(subscriptions) = known_subscriptions.get(&record.topic_name) else {
                continue;
            };

            if !subscriptions.contains(&record.subscription_name) {
                debug!(
                    "Subscription {} is gone, marking lock on {} released",
                    record.subscription_name, record.message_id
                );
                self.mark_released(&record).await;
                report.skipped += 1;
                continue;
            }

            let operation_key = format!("recover:{}", record.topic_name);
            let broker = Arc::clone(&self.broker);
            let topic = record.topic_name.clone();
            let subscription = record.subscription_name.clone();
            let (message_id, lock_token) = (record.message_id, record.lock_token);
            let result = self
                .executor
                .execute(&operation_key, &self.config.retry_policy, cancel, move || {
                    let broker = Arc::clone(&broker);
                    let topic = topic.clone();
                    let subscription = subscription.clone();
                    async move {
                        broker
                            .abandon(&topic, &subscription, message_id, lock_token)
                            .await
                    }
                })
                .await
                .map_err(Error::from);

            match result {
                Ok(()) => {
                    self.mark_released(&record).await;
                    self.in_flight.remove(&record.message_id);
                    report.recovered += 1;
                }
                Err(Error::LockLost { .. }) | Err(Error::MessageNotFound { .. }) => {
                    self.mark_released(&record).await;
                    self.in_flight.remove(&record.message_id);
                    report.already_released += 1;
                }
                Err(e) => {
                    warn!("Could not recover lock on {}: {}", record.message_id, e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "Stale lock recovery: {} recovered, {} already released, {} skipped",
            report.recovered, report.already_released, report.skipped
        );
        Ok(report)
    }

    /// Best-effort release of everything still held, for graceful shutdown
    pub async fn shutdown(&self) {
        let entries: Vec<(Uuid, InFlightEntry)> = self
            .in_flight
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        if entries.is_empty() {
            return;
        }

        info!("Releasing {} in-flight message(s) on shutdown", entries.len());
        for (message_id, entry) in entries {
            match self
                .broker
                .abandon(
                    &entry.topic_name,
                    &entry.subscription_name,
                    message_id,
                    entry.lock_token,
                )
                .await
            {
                Ok(()) => {
                    if let Err(e) = self
                        .lock_store
                        .update_status(message_id, entry.lock_token, LockStatus::Abandoned)
                        .await
                    {
                        debug!("Lock store update failed for {}: {}", message_id, e);
                    }
                }
                Err(e) => warn!("Could not release message {} on shutdown: {}", message_id, e),
            }
            self.in_flight.remove(&message_id);
        }
    }

    async fn settle(
        &self,
        message_id: Uuid,
        lock_token: Uuid,
        op: SettleOp,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let entry = self
            .in_flight
            .get(&message_id)
            .map(|e| e.clone())
            .ok_or(Error::UntrackedMessage { message_id })?;

        if entry.lock_token != lock_token {
            // The broker validates tokens; ours may be stale after recovery
            warn!(
                "Lock token mismatch for message {} (held {}, caller {}), deferring to broker",
                message_id, entry.lock_token, lock_token
            );
        }

        let operation_key = format!("settle:{}", entry.subscription_name);
        let broker = Arc::clone(&self.broker);
        let topic = entry.topic_name.clone();
        let subscription = entry.subscription_name.clone();
        let settle_op = op.clone();
        let result = self
            .executor
            .execute(&operation_key, &self.config.retry_policy, cancel, move || {
                let broker = Arc::clone(&broker);
                let topic = topic.clone();
                let subscription = subscription.clone();
                let settle_op = settle_op.clone();
                async move {
                    match settle_op {
                        SettleOp::Complete => {
                            broker.complete(&topic, &subscription, message_id, lock_token).await
                        }
                        SettleOp::Abandon => {
                            broker.abandon(&topic, &subscription, message_id, lock_token).await
                        }
                        SettleOp::DeadLetter(reason) => {
                            broker
                                .dead_letter(&topic, &subscription, message_id, lock_token, &reason)
                                .await
                        }
                    }
                }
            })
            .await
            .map_err(Error::from);

        match result {
            Ok(()) => {
                self.in_flight.remove(&message_id);
                if let Err(e) = self
                    .lock_store
                    .update_status(message_id, entry.lock_token, op.status())
                    .await
                {
                    debug!("Lock store update failed for {}: {}", message_id, e);
                }
                TRANSPORT_SETTLE_TOTAL
                    .with_label_values(&[&entry.interface_name, op.outcome_label()])
                    .inc();
                if let SettleOp::DeadLetter(reason) = &op {
                    debug!(
                        "Message {} dead-lettered after {} deliveries: {}",
                        message_id, entry.delivery_count, reason
                    );
                    TRANSPORT_DEAD_LETTER_TOTAL
                        .with_label_values(&[&entry.interface_name, "requested"])
                        .inc();
                }
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::LockLost { .. }) && entry.lock_token == lock_token {
                    // The broker released our lock already; the entry is stale
                    self.in_flight.remove(&message_id);
                }
                TRANSPORT_SETTLE_TOTAL
                    .with_label_values(&[&entry.interface_name, "error"])
                    .inc();
                Err(e)
            }
        }
    }

    async fn track(
        &self,
        delivery: &BrokerDelivery,
        topic_name: &str,
        subscription_name: &str,
        interface_name: &str,
        destination_instance_id: Uuid,
        locked_until: DateTime<Utc>,
    ) {
        self.in_flight.insert(
            delivery.message_id,
            InFlightEntry {
                lock_token: delivery.lock_token,
                topic_name: topic_name.to_string(),
                subscription_name: subscription_name.to_string(),
                interface_name: interface_name.to_string(),
                delivery_count: delivery.delivery_count,
            },
        );

        let record = InFlightLockRecord {
            message_id: delivery.message_id,
            lock_token: delivery.lock_token,
            topic_name: topic_name.to_string(),
            subscription_name: subscription_name.to_string(),
            interface_name: interface_name.to_string(),
            destination_instance_id,
            delivery_count: delivery.delivery_count,
            locked_until,
            status: LockStatus::Locked,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.lock_store.record_lock(record).await {
            // Advisory write, message flow continues
            warn!(
                "Could not persist lock record for {}: {}",
                delivery.message_id, e
            );
        }
    }

    async fn mark_released(&self, record: &InFlightLockRecord) {
        if let Err(e) = self
            .lock_store
            .update_status(record.message_id, record.lock_token, LockStatus::Abandoned)
            .await
        {
            debug!("Lock store update failed for {}: {}", record.message_id, e);
        }
    }

    fn broker_message(&self, message: &Message) -> Result<BrokerMessage> {
        let payload = message.to_bytes()?;
        let limit = self.broker.max_batch_bytes();
        if payload.len() > limit {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let content_hash = dedup::idempotency_key(
            &message.record,
            &message.interface_name,
            Some(message.adapter_instance_id),
        );

        let mut props = HashMap::new();
        props.insert(
            properties::INTERFACE_NAME.to_string(),
            message.interface_name.clone(),
        );
        props.insert(
            properties::ADAPTER_NAME.to_string(),
            message.adapter_name.clone(),
        );
        props.insert(
            properties::ADAPTER_TYPE.to_string(),
            message.adapter_type.to_string(),
        );
        props.insert(
            properties::ADAPTER_INSTANCE_ID.to_string(),
            message.adapter_instance_id.to_string(),
        );
        props.insert(properties::CONTENT_HASH.to_string(), content_hash);

        Ok(BrokerMessage::new(
            message.message_id,
            Bytes::from(payload),
            props,
        ))
    }

    async fn ensure_topic_once(&self, topic_name: &str) -> Result<()> {
        if self.ensured_topics.contains(topic_name) {
            return Ok(());
        }
        self.broker.ensure_topic(topic_name).await?;
        self.ensured_topics.insert(topic_name.to_string());
        Ok(())
    }

    async fn ensure_subscription_once(
        &self,
        topic_name: &str,
        subscription_name: &str,
    ) -> Result<()> {
        let key = (topic_name.to_string(), subscription_name.to_string());
        if self.ensured_subscriptions.contains(&key) {
            return Ok(());
        }
        self.broker
            .ensure_subscription(topic_name, subscription_name)
            .await?;
        self.ensured_subscriptions.insert(key);
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(crate::DEFAULT_LOCK_SECONDS as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{InMemoryBroker, InMemoryBrokerConfig};
    use crate::lock_store::MemoryLockStore;
    use crate::message::AdapterType;
    use resilience::CircuitBreakerConfig;

    fn test_transport() -> (MessageTransport, Arc<InMemoryBroker>, Arc<MemoryLockStore>) {
        let broker = Arc::new(InMemoryBroker::new(InMemoryBrokerConfig::default()));
        let lock_store = Arc::new(MemoryLockStore::new());
        let executor = Arc::new(ResilientExecutor::with_seed(
            CircuitBreakerConfig::default(),
            42,
        ));
        let config = TransportConfig {
            retry_policy: RetryPolicy::immediate(1),
            ..TransportConfig::default()
        };
        let transport = MessageTransport::new(
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            Arc::clone(&lock_store) as Arc<dyn LockStore>,
            executor,
            config,
        );
        (transport, broker, lock_store)
    }

    fn order_message(interface: &str, instance: Uuid, value: &str) -> Message {
        let mut record = HashMap::new();
        record.insert("order_id".to_string(), value.to_string());
        Message::new(
            interface,
            "sap-main",
            AdapterType::Source,
            instance,
            vec!["order_id".to_string()],
            record,
        )
    }

    #[tokio::test]
    async fn test_send_rejects_empty_interface() {
        let (transport, _, _) = test_transport();
        let cancel = CancellationToken::new();
        let message = order_message("  ", Uuid::new_v4(), "o-1");

        let err = transport.send(message, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_send_then_receive_carries_lock_state() {
        let (transport, _, lock_store) = test_transport();
        let cancel = CancellationToken::new();
        let source = Uuid::new_v4();
        let destination = Uuid::new_v4();

        transport
            .register_destination("Orders", destination)
            .await
            .unwrap();
        let sent_id = transport
            .send(order_message("Orders", source, "o-1"), &cancel)
            .await
            .unwrap();

        let received = transport
            .receive("Orders", destination, 10, &cancel)
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, sent_id);
        assert_eq!(received[0].delivery_count, 1);
        let token = received[0].lock_token.unwrap();

        assert_eq!(transport.in_flight_count(), 1);
        let record = lock_store.get(sent_id, token).unwrap();
        assert_eq!(record.status, LockStatus::Locked);
        assert_eq!(record.interface_name, "Orders");
    }

    #[tokio::test]
    async fn test_complete_removes_tracking_and_updates_store() {
        let (transport, broker, lock_store) = test_transport();
        let cancel = CancellationToken::new();
        let destination = Uuid::new_v4();

        transport
            .register_destination("Orders", destination)
            .await
            .unwrap();
        transport
            .send(order_message("Orders", Uuid::new_v4(), "o-1"), &cancel)
            .await
            .unwrap();

        let received = transport
            .receive("Orders", destination, 1, &cancel)
            .await
            .unwrap();
        let (id, token) = (received[0].message_id, received[0].lock_token.unwrap());

        transport.complete(id, token, &cancel).await.unwrap();
        assert_eq!(transport.in_flight_count(), 0);
        assert_eq!(lock_store.get(id, token).unwrap().status, LockStatus::Completed);
        assert_eq!(
            broker.locked_count("interface-orders", &subscription_for_instance(destination)),
            0
        );
    }

    #[tokio::test]
    async fn test_settle_unknown_message_fails() {
        let (transport, _, _) = test_transport();
        let cancel = CancellationToken::new();

        let err = transport
            .complete(Uuid::new_v4(), Uuid::new_v4(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UntrackedMessage { .. }));
    }

    #[tokio::test]
    async fn test_token_mismatch_defers_to_broker() {
        let (transport, _, _) = test_transport();
        let cancel = CancellationToken::new();
        let destination = Uuid::new_v4();

        transport
            .register_destination("Orders", destination)
            .await
            .unwrap();
        transport
            .send(order_message("Orders", Uuid::new_v4(), "o-1"), &cancel)
            .await
            .unwrap();
        let received = transport
            .receive("Orders", destination, 1, &cancel)
            .await
            .unwrap();
        let id = received[0].message_id;

        // Wrong token: the transport warns and lets the broker decide
        let err = transport
            .complete(id, Uuid::new_v4(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockLost { .. }));

        // The valid lock is untouched, so the rightful token still settles
        assert_eq!(transport.in_flight_count(), 1);
        let token = received[0].lock_token.unwrap();
        transport.complete(id, token, &cancel).await.unwrap();
        assert_eq!(transport.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_messages_round_trip() {
        let (transport, _, _) = test_transport();
        let cancel = CancellationToken::new();
        let source = Uuid::new_v4();

        for i in 0..3 {
            transport
                .send(order_message("Orders", source, &format!("o-{i}")), &cancel)
                .await
                .unwrap();
        }

        let recent = transport.recent_messages("Orders", 2, &cancel).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record["order_id"], "o-1");
        assert_eq!(recent[1].record["order_id"], "o-2");
    }

    #[tokio::test]
    async fn test_shutdown_releases_held_messages() {
        let (transport, broker, _) = test_transport();
        let cancel = CancellationToken::new();
        let destination = Uuid::new_v4();

        transport
            .register_destination("Orders", destination)
            .await
            .unwrap();
        transport
            .send(order_message("Orders", Uuid::new_v4(), "o-1"), &cancel)
            .await
            .unwrap();
        transport
            .receive("Orders", destination, 1, &cancel)
            .await
            .unwrap();
        assert_eq!(transport.in_flight_count(), 1);

        transport.shutdown().await;
        assert_eq!(transport.in_flight_count(), 0);
        assert_eq!(
            broker.pending_count("interface-orders", &subscription_for_instance(destination)),
            1
        );
    }
}
