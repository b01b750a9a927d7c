//! # Datarail Batching
//!
//! Adaptive batch sizing for record publishing:
//! - Per-interface throughput statistics (processing time per record)
//! - Optimal batch size converging on a processing-time target, damped to
//!   avoid oscillation
//! - Greedy batch construction bounded by record count, payload bytes and
//!   accumulation time

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod batcher;

pub use batcher::{AdaptiveBatcher, BatchStatsSnapshot, BatcherConfig};

/// Default batch size before any throughput history exists
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Smallest batch size the adaptive policy will choose
pub const MIN_BATCH_SIZE: usize = 10;

/// Largest batch size the adaptive policy will choose
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Processing-time target per batch (milliseconds)
pub const TARGET_BATCH_MILLIS: u64 = 3_000;

/// Successful batches required before the optimal size adapts
pub const MIN_SAMPLE_BATCHES: u64 = 10;

/// Default payload ceiling per batch (bytes), aligned with broker limits
pub const DEFAULT_MAX_BATCH_BYTES: usize = 200 * 1024;
