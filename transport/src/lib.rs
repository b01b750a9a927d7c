//! # Datarail Transport
//!
//! Message transport for integration interfaces:
//! - Topic per interface, subscription per destination adapter instance
//! - Peek-lock delivery: receive, then complete, abandon or dead-letter
//! - Every broker call runs through the resilience executor
//! - In-flight ownership table plus a durable lock store for crash recovery
//! - Size-bounded batch publishing with per-message oversize rejection
//!
//! ## Architecture
//!
//! ```text
//! source adapter ──▶ MessageTransport::send ──▶ topic interface-{name}
//!                                                    │ fan-out
//!                                   subscription destination-{instance}
//!                                                    │ peek-lock
//! destination adapter ◀── receive / complete / abandon / dead-letter
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod broker;
pub mod engine;
pub mod error;
pub mod lock_store;
pub mod message;
pub mod metrics;

pub use broker::memory::{InMemoryBroker, InMemoryBrokerConfig};
pub use broker::nats::{NatsBroker, NatsBrokerConfig};
pub use broker::{BrokerDelivery, BrokerMessage, MessageBroker};
pub use engine::{BatchSendOutcome, MessageTransport, RecoveryReport, TransportConfig};
pub use error::{Error, Result};
pub use lock_store::{InFlightLockRecord, LockStatus, LockStore, MemoryLockStore};
pub use message::{subscription_for_instance, topic_for_interface, AdapterType, Message};

/// Default peek-lock duration (seconds)
pub const DEFAULT_LOCK_SECONDS: u64 = 30;

/// Default transport-level delivery ceiling before proactive dead-lettering
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 5;

/// Default broker-native size limit per message batch (bytes)
pub const DEFAULT_MAX_BATCH_BYTES: usize = 256 * 1024;
