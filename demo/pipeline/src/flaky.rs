//! Failure-injecting broker wrapper for the demo

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use colored::Colorize;
use uuid::Uuid;

use transport::{BrokerDelivery, BrokerMessage, Error, InMemoryBroker, MessageBroker, Result};

/// Wraps an in-memory broker and injects failures into the publish path.
///
/// A fixed budget of transient failures is burned by the first sends, after
/// which publishes pass through. Flipping the outage switch makes every
/// publish fail until it is flipped back.
pub struct FlakyBroker {
    inner: Arc<InMemoryBroker>,
    transient_failures: AtomicU32,
    outage: AtomicBool,
}

impl FlakyBroker {
    pub fn new(inner: Arc<InMemoryBroker>, transient_failures: u32) -> Self {
        Self {
            inner,
            transient_failures: AtomicU32::new(transient_failures),
            outage: AtomicBool::new(false),
        }
    }

    /// Make every publish fail (or stop doing so)
    pub fn set_outage(&self, on: bool) {
        self.outage.store(on, Ordering::Relaxed);
    }

    fn inject(&self, operation: &str) -> Result<()> {
        if self.outage.load(Ordering::Relaxed) {
            return Err(Error::Connection(
                "broker unreachable (injected outage)".to_string(),
            ));
        }
        let burned = self
            .transient_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if burned {
            println!("    {} transient broker failure injected", "✗".red());
            return Err(Error::Broker {
                operation: operation.to_string(),
                message: "injected transient failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn ensure_topic(&self, topic_name: &str) -> Result<()> {
        self.inner.ensure_topic(topic_name).await
    }

    async fn ensure_subscription(&self, topic_name: &str, subscription_name: &str) -> Result<()> {
        self.inner
            .ensure_subscription(topic_name, subscription_name)
            .await
    }

    async fn send(&self, topic_name: &str, message: BrokerMessage) -> Result<()> {
        self.inject("send")?;
        self.inner.send(topic_name, message).await
    }

    async fn send_batch(&self, topic_name: &str, messages: Vec<BrokerMessage>) -> Result<()> {
        self.inject("send_batch")?;
        self.inner.send_batch(topic_name, messages).await
    }

    async fn receive(
        &self,
        topic_name: &str,
        subscription_name: &str,
        max_messages: usize,
        lock_duration: Duration,
    ) -> Result<Vec<BrokerDelivery>> {
        self.inner
            .receive(topic_name, subscription_name, max_messages, lock_duration)
            .await
    }

    async fn complete(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()> {
        self.inner
            .complete(topic_name, subscription_name, message_id, lock_token)
            .await
    }

    async fn abandon(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
    ) -> Result<()> {
        self.inner
            .abandon(topic_name, subscription_name, message_id, lock_token)
            .await
    }

    async fn dead_letter(
        &self,
        topic_name: &str,
        subscription_name: &str,
        message_id: Uuid,
        lock_token: Uuid,
        reason: &str,
    ) -> Result<()> {
        self.inner
            .dead_letter(topic_name, subscription_name, message_id, lock_token, reason)
            .await
    }

    async fn peek(&self, topic_name: &str, max_messages: usize) -> Result<Vec<Bytes>> {
        self.inner.peek(topic_name, max_messages).await
    }

    async fn list_subscriptions(&self, topic_name: &str) -> Result<Vec<String>> {
        self.inner.list_subscriptions(topic_name).await
    }

    fn max_batch_bytes(&self) -> usize {
        self.inner.max_batch_bytes()
    }
}
