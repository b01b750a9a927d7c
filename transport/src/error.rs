//! Error types for the transport

use resilience::{Classify, ErrorKind, ExecutorError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Error, Debug)]
pub enum Error {
    /// Broker connectivity failure
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Broker failed an operation
    #[error("Broker error during {operation}: {message}")]
    Broker {
        /// Operation that failed
        operation: String,
        /// Broker-reported message
        message: String,
    },

    /// Circuit open for an operation key
    #[error("Circuit open for operation {operation_key}, retry in {retry_in:?}")]
    CircuitOpen {
        /// Operation key
        operation_key: String,
        /// Time remaining until the breaker half-opens
        retry_in: Duration,
    },

    /// Operation cancelled by the caller
    #[error("Operation {operation_key} cancelled")]
    Cancelled {
        /// Operation key
        operation_key: String,
    },

    /// Lock token rejected or expired at the broker
    #[error("Lock lost for message {message_id}: {reason}")]
    LockLost {
        /// Message ID
        message_id: Uuid,
        /// Broker-reported reason
        reason: String,
    },

    /// Message unknown at the broker
    #[error("Message {message_id} not found on {entity}")]
    MessageNotFound {
        /// Message ID
        message_id: Uuid,
        /// Topic or subscription looked at
        entity: String,
    },

    /// Message not in the transport's in-flight table
    #[error("Message {message_id} is not tracked by this transport instance")]
    UntrackedMessage {
        /// Message ID
        message_id: Uuid,
    },

    /// Topic missing
    #[error("Topic {0} does not exist")]
    TopicNotFound(String),

    /// Subscription missing
    #[error("Subscription {subscription_name} does not exist on {topic_name}")]
    SubscriptionNotFound {
        /// Topic name
        topic_name: String,
        /// Subscription name
        subscription_name: String,
    },

    /// Payload exceeds the broker limit
    #[error("Message of {size} bytes exceeds broker limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Broker limit
        limit: usize,
    },

    /// Invalid caller input
    #[error("Invalid {field}: {reason}")]
    InvalidInput {
        /// Offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Durable lock store failure
    #[error("Lock store error: {0}")]
    LockStore(String),
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) | Error::Broker { .. } | Error::LockStore(_) => {
                ErrorKind::Transient
            }
            Error::LockLost { .. }
            | Error::MessageNotFound { .. }
            | Error::UntrackedMessage { .. }
            | Error::TopicNotFound(_)
            | Error::SubscriptionNotFound { .. }
            | Error::PayloadTooLarge { .. }
            | Error::InvalidInput { .. }
            | Error::Serialization(_)
            | Error::Deserialization(_) => ErrorKind::Permanent,
            // Already the outcome of resilience handling, not retryable
            Error::CircuitOpen { .. } | Error::Cancelled { .. } => ErrorKind::Permanent,
        }
    }
}

impl From<ExecutorError<Error>> for Error {
    fn from(err: ExecutorError<Error>) -> Self {
        match err {
            ExecutorError::CircuitOpen {
                operation_key,
                retry_in,
            } => Error::CircuitOpen {
                operation_key,
                retry_in,
            },
            ExecutorError::Cancelled { operation_key, .. } => Error::Cancelled { operation_key },
            ExecutorError::Exhausted { source, .. } => source,
        }
    }
}
