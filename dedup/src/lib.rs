//! # Datarail Dedup
//!
//! Effective-once processing on top of at-least-once delivery:
//! - Deterministic, content-derived idempotency keys (SHA-256)
//! - In-process seen-key cache with lazy TTL purging
//! - Pluggable durable store consulted on cache misses
//!
//! The guard fails open: a store outage degrades to at-least-once for its
//! duration instead of blocking the message path.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod error;
pub mod guard;
pub mod key;
pub mod store;

pub use error::{Error, Result};
pub use guard::{DedupConfig, DeduplicationGuard};
pub use key::idempotency_key;
pub use store::{DedupStore, MemoryDedupStore, StoredKey};

/// Default duplicate-detection window (hours)
pub const DEFAULT_WINDOW_HOURS: u64 = 24;

/// Cache entries older than this are purged (seconds)
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3_600;

/// Minimum time between cache purge sweeps (seconds)
pub const DEFAULT_PURGE_INTERVAL_SECONDS: u64 = 600;
