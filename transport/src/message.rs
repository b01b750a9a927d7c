//! Message envelope and entity naming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Application property names attached to every published message
pub mod properties {
    /// Interface name
    pub const INTERFACE_NAME: &str = "interface-name";
    /// Producing adapter name
    pub const ADAPTER_NAME: &str = "adapter-name";
    /// Producing adapter role
    pub const ADAPTER_TYPE: &str = "adapter-type";
    /// Producing adapter instance id
    pub const ADAPTER_INSTANCE_ID: &str = "adapter-instance-id";
    /// Content hash of the record (idempotency key)
    pub const CONTENT_HASH: &str = "content-hash";
    /// Why a message was dead-lettered
    pub const DEAD_LETTER_REASON: &str = "dead-letter-reason";
}

/// Adapter role on an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterType {
    /// Reads records from an external system
    Source,
    /// Writes records to an external system
    Destination,
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterType::Source => write!(f, "source"),
            AdapterType::Destination => write!(f, "destination"),
        }
    }
}

/// Message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message ID
    pub message_id: Uuid,

    /// Interface the record travels on
    pub interface_name: String,

    /// Adapter that produced the record
    pub adapter_name: String,

    /// Producer role
    pub adapter_type: AdapterType,

    /// Producing adapter instance
    pub adapter_instance_id: Uuid,

    /// Field names in source order
    pub headers: Vec<String>,

    /// Record payload, field name to value
    pub record: HashMap<String, String>,

    /// When the message was enqueued
    pub enqueued_at: DateTime<Utc>,

    /// Lock token while held under peek-lock. Delivery state owned by the
    /// broker, never part of the payload.
    #[serde(skip)]
    pub lock_token: Option<Uuid>,

    /// Deliveries so far, this one included. Delivery state, never part of
    /// the payload.
    #[serde(skip)]
    pub delivery_count: u32,
}

impl Message {
    /// Create a new message for publishing
    pub fn new(
        interface_name: impl Into<String>,
        adapter_name: impl Into<String>,
        adapter_type: AdapterType,
        adapter_instance_id: Uuid,
        headers: Vec<String>,
        record: HashMap<String, String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            interface_name: interface_name.into(),
            adapter_name: adapter_name.into(),
            adapter_type,
            adapter_instance_id,
            headers,
            record,
            enqueued_at: Utc::now(),
            lock_token: None,
            delivery_count: 0,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| crate::Error::Deserialization(e.to_string()))
    }

    /// Topic this message belongs on
    pub fn topic_name(&self) -> String {
        topic_for_interface(&self.interface_name)
    }
}

/// Topic name for an interface: `interface-{lowercased name}`
pub fn topic_for_interface(interface_name: &str) -> String {
    format!("interface-{}", sanitize_entity(interface_name))
}

/// Subscription name for a destination adapter instance:
/// `destination-{lowercased instance id}`
pub fn subscription_for_instance(destination_instance_id: Uuid) -> String {
    format!("destination-{}", destination_instance_id)
}

/// Lowercase and strip characters brokers reject in entity names
fn sanitize_entity(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> HashMap<String, String> {
        let mut record = HashMap::new();
        record.insert("order_id".to_string(), "4711".to_string());
        record.insert("status".to_string(), "open".to_string());
        record
    }

    #[test]
    fn test_message_creation() {
        let msg = Message::new(
            "Orders",
            "sql-reader",
            AdapterType::Source,
            Uuid::new_v4(),
            vec!["order_id".to_string(), "status".to_string()],
            sample_record(),
        );

        assert_eq!(msg.interface_name, "Orders");
        assert_eq!(msg.record["order_id"], "4711");
        assert!(msg.lock_token.is_none());
        assert_eq!(msg.delivery_count, 0);
    }

    #[test]
    fn test_topic_naming_lowercases_and_sanitizes() {
        assert_eq!(topic_for_interface("Orders"), "interface-orders");
        assert_eq!(
            topic_for_interface("Invoice Export 2024"),
            "interface-invoice_export_2024"
        );
        assert_eq!(topic_for_interface("A/B"), "interface-a_b");
    }

    #[test]
    fn test_subscription_naming() {
        let id = Uuid::parse_str("6E1B9E58-5C0A-4E2B-9270-3C7B50C1F1AA").unwrap();
        assert_eq!(
            subscription_for_instance(id),
            "destination-6e1b9e58-5c0a-4e2b-9270-3c7b50c1f1aa"
        );
    }

    #[test]
    fn test_serialization_round_trip_drops_delivery_state() {
        let mut msg = Message::new(
            "Orders",
            "sql-reader",
            AdapterType::Source,
            Uuid::new_v4(),
            vec!["order_id".to_string()],
            sample_record(),
        );
        msg.lock_token = Some(Uuid::new_v4());
        msg.delivery_count = 3;

        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.record, msg.record);
        assert_eq!(decoded.enqueued_at, msg.enqueued_at);
        // Lock state belongs to the broker, not the payload
        assert!(decoded.lock_token.is_none());
        assert_eq!(decoded.delivery_count, 0);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Message::from_bytes(b"not json").is_err());
    }
}
