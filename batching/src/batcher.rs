//! Adaptive batch sizing driven by per-interface throughput

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Batcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Batch size used before any throughput history exists
    pub default_batch_size: usize,
    /// Smallest size the adaptive policy will choose
    pub min_batch_size: usize,
    /// Largest size the adaptive policy will choose
    pub max_batch_size: usize,
    /// Processing-time target per batch
    pub target_batch_time: Duration,
    /// Successful batches required before the optimal size adapts
    pub min_sample_batches: u64,
    /// Payload ceiling per batch in bytes
    pub max_batch_bytes: usize,
    /// How long a batch may keep accumulating before it is closed
    pub max_batch_wait: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            default_batch_size: crate::DEFAULT_BATCH_SIZE,
            min_batch_size: crate::MIN_BATCH_SIZE,
            max_batch_size: crate::MAX_BATCH_SIZE,
            target_batch_time: Duration::from_millis(crate::TARGET_BATCH_MILLIS),
            min_sample_batches: crate::MIN_SAMPLE_BATCHES,
            max_batch_bytes: crate::DEFAULT_MAX_BATCH_BYTES,
            max_batch_wait: Duration::from_secs(5),
        }
    }
}

/// Per-interface batch throughput state
#[derive(Debug, Clone)]
struct BatchStats {
    optimal_batch_size: usize,
    processed_batches: u64,
    failed_batches: u64,
    total_records: u64,
    total_processing: Duration,
}

impl BatchStats {
    fn new(initial_size: usize) -> Self {
        Self {
            optimal_batch_size: initial_size,
            processed_batches: 0,
            failed_batches: 0,
            total_records: 0,
            total_processing: Duration::ZERO,
        }
    }

    /// Midpoint of the current optimal and the throughput-derived candidate.
    /// One unusual batch moves the size at most halfway.
    fn recompute_optimal(&mut self, config: &BatcherConfig) {
        if self.processed_batches < config.min_sample_batches || self.total_records == 0 {
            return;
        }

        let batches = self.processed_batches as f64;
        let avg_records = self.total_records as f64 / batches;
        let avg_time_ms = self.total_processing.as_millis() as f64 / batches;
        let time_per_record_ms = avg_time_ms / avg_records;

        let target_ms = config.target_batch_time.as_millis() as f64;
        let candidate = if time_per_record_ms > 0.0 {
            target_ms / time_per_record_ms
        } else {
            config.max_batch_size as f64
        };
        let candidate =
            candidate.clamp(config.min_batch_size as f64, config.max_batch_size as f64) as usize;

        self.optimal_batch_size = (self.optimal_batch_size + candidate) / 2;
    }

    fn average_records_per_batch(&self) -> f64 {
        if self.processed_batches == 0 {
            return 0.0;
        }
        self.total_records as f64 / self.processed_batches as f64
    }

    fn average_processing_time(&self) -> Duration {
        if self.processed_batches == 0 {
            return Duration::ZERO;
        }
        self.total_processing / self.processed_batches as u32
    }
}

/// Point-in-time view of an interface's batch statistics
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatsSnapshot {
    /// Current learned batch size
    pub optimal_batch_size: usize,
    /// Successful batches recorded
    pub processed_batches: u64,
    /// Failed batches recorded (excluded from averages)
    pub failed_batches: u64,
    /// Mean records per successful batch
    pub average_records_per_batch: f64,
    /// Mean processing time per successful batch
    pub average_processing_time: Duration,
}

/// Adaptive batcher with per-interface throughput learning
pub struct AdaptiveBatcher {
    stats: DashMap<String, BatchStats>,
    config: BatcherConfig,
}

impl Default for AdaptiveBatcher {
    fn default() -> Self {
        Self::new(BatcherConfig::default())
    }
}

impl AdaptiveBatcher {
    /// Create a batcher
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            stats: DashMap::new(),
            config,
        }
    }

    /// Batch size to use for the next publish on `interface_name`.
    ///
    /// Returns `default_size` until enough successful batches were recorded,
    /// then the learned optimal. When `average_record_size_bytes` is given,
    /// the result shrinks so a full batch stays under the payload ceiling;
    /// the ceiling is applied at read time and never written back into the
    /// learned state.
    pub fn optimal_batch_size(
        &self,
        interface_name: &str,
        default_size: usize,
        average_record_size_bytes: Option<usize>,
    ) -> usize {
        let mut entry = self
            .stats
            .entry(interface_name.to_string())
            .or_insert_with(|| BatchStats::new(default_size));
        let stats = entry.value_mut();

        let mut size = if stats.processed_batches >= self.config.min_sample_batches {
            stats.optimal_batch_size
        } else {
            default_size
        };

        if let Some(record_bytes) = average_record_size_bytes {
            if record_bytes > 0 {
                let ceiling = (self.config.max_batch_bytes / record_bytes).max(1);
                if ceiling < size {
                    debug!(
                        "Shrinking batch size for {} from {} to {} to respect payload ceiling",
                        interface_name, size, ceiling
                    );
                    size = ceiling;
                }
            }
        }

        size.max(1)
    }

    /// Record the outcome of a processed batch.
    ///
    /// Failed batches only bump the failure counter; their timings never
    /// pollute the latency averages the optimal size is derived from.
    pub fn record_batch_performance(
        &self,
        interface_name: &str,
        record_count: usize,
        processing_time: Duration,
        success: bool,
    ) {
        let mut entry = self
            .stats
            .entry(interface_name.to_string())
            .or_insert_with(|| BatchStats::new(self.config.default_batch_size));
        let stats = entry.value_mut();

        if !success {
            stats.failed_batches += 1;
            return;
        }

        stats.processed_batches += 1;
        stats.total_records += record_count as u64;
        stats.total_processing += processing_time;

        let before = stats.optimal_batch_size;
        stats.recompute_optimal(&self.config);
        if stats.optimal_batch_size != before {
            debug!(
                "Optimal batch size for {} adjusted {} -> {}",
                interface_name, before, stats.optimal_batch_size
            );
        }
    }

    /// Split `records` into batches bounded by record count, payload bytes
    /// and accumulation time. Record order is preserved and every record
    /// lands in exactly one batch. A single record larger than the byte
    /// bound is emitted as its own batch; splitting a record is not an
    /// option at this layer.
    pub fn create_batches<R: Serialize>(
        &self,
        records: Vec<R>,
        interface_name: &str,
        max_batch_size: Option<usize>,
        max_wait_time: Option<Duration>,
        max_batch_bytes: Option<usize>,
    ) -> Vec<Vec<R>> {
        let max_records = max_batch_size
            .unwrap_or_else(|| {
                self.optimal_batch_size(interface_name, self.config.default_batch_size, None)
            })
            .max(1);
        let max_bytes = max_batch_bytes.unwrap_or(self.config.max_batch_bytes);
        let max_wait = max_wait_time.unwrap_or(self.config.max_batch_wait);

        let mut batches = Vec::new();
        let mut current: Vec<R> = Vec::new();
        let mut current_bytes = 0usize;
        let mut batch_started = Instant::now();

        for record in records {
            let record_bytes = estimated_size(&record);
            let full_by_bytes = !current.is_empty() && current_bytes + record_bytes > max_bytes;
            let full_by_count = current.len() >= max_records;
            let full_by_time = !current.is_empty() && batch_started.elapsed() >= max_wait;

            if full_by_bytes || full_by_count || full_by_time {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
                batch_started = Instant::now();
            }

            current_bytes += record_bytes;
            current.push(record);
        }

        if !current.is_empty() {
            batches.push(current);
        }

        batches
    }

    /// Statistics snapshot for an interface, if any batches were recorded
    pub fn stats(&self, interface_name: &str) -> Option<BatchStatsSnapshot> {
        self.stats.get(interface_name).map(|stats| BatchStatsSnapshot {
            optimal_batch_size: stats.optimal_batch_size,
            processed_batches: stats.processed_batches,
            failed_batches: stats.failed_batches,
            average_records_per_batch: stats.average_records_per_batch(),
            average_processing_time: stats.average_processing_time(),
        })
    }
}

/// Serialized size estimate used for the byte bound
fn estimated_size<R: Serialize>(record: &R) -> usize {
    serde_json::to_vec(record).map(|bytes| bytes.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct TestRecord {
        payload: String,
    }

    fn record(payload: &str) -> TestRecord {
        TestRecord {
            payload: payload.to_string(),
        }
    }

    fn batcher() -> AdaptiveBatcher {
        AdaptiveBatcher::new(BatcherConfig::default())
    }

    #[test]
    fn test_default_size_until_enough_samples() {
        let batcher = batcher();

        assert_eq!(batcher.optimal_batch_size("orders", 100, None), 100);

        for _ in 0..9 {
            batcher.record_batch_performance("orders", 100, Duration::from_secs(1), true);
        }
        assert_eq!(batcher.optimal_batch_size("orders", 100, None), 100);
    }

    #[test]
    fn test_optimal_converges_toward_throughput_target() {
        let batcher = batcher();

        // 100 records per second: 10ms per record, 3s target -> candidate 300,
        // damped to the midpoint of (100, 300).
        for _ in 0..10 {
            batcher.record_batch_performance("orders", 100, Duration::from_secs(1), true);
        }

        assert_eq!(batcher.optimal_batch_size("orders", 100, None), 200);
    }

    #[test]
    fn test_candidate_clamped_to_bounds() {
        let batcher = batcher();

        // 0.1ms per record would suggest 30k records; clamp to 1000 first,
        // then damp against the previous optimal of 100.
        for _ in 0..10 {
            batcher.record_batch_performance("orders", 1_000, Duration::from_millis(100), true);
        }

        assert_eq!(batcher.optimal_batch_size("orders", 100, None), 550);
    }

    #[test]
    fn test_failures_do_not_move_the_optimal() {
        let batcher = batcher();

        for _ in 0..10 {
            batcher.record_batch_performance("orders", 100, Duration::from_secs(1), true);
        }
        let learned = batcher.optimal_batch_size("orders", 100, None);

        // A storm of slow failures must not shift the learned size
        for _ in 0..50 {
            batcher.record_batch_performance("orders", 100, Duration::from_secs(30), false);
        }

        assert_eq!(batcher.optimal_batch_size("orders", 100, None), learned);
        let stats = batcher.stats("orders").unwrap();
        assert_eq!(stats.failed_batches, 50);
        assert_eq!(stats.processed_batches, 10);
    }

    #[test]
    fn test_payload_ceiling_shrinks_result() {
        let batcher = batcher();

        for _ in 0..10 {
            batcher.record_batch_performance("orders", 100, Duration::from_secs(1), true);
        }
        assert_eq!(batcher.optimal_batch_size("orders", 100, None), 200);

        // 2KiB records: 200KiB / 2KiB = 100 < 200
        assert_eq!(batcher.optimal_batch_size("orders", 100, Some(2_048)), 100);

        // Tiny records leave the learned size alone
        assert_eq!(batcher.optimal_batch_size("orders", 100, Some(16)), 200);
    }

    #[test]
    fn test_create_batches_by_count() {
        let batcher = batcher();
        let records: Vec<TestRecord> = (0..25).map(|i| record(&format!("r{i}"))).collect();

        let batches =
            batcher.create_batches(records.clone(), "orders", Some(10), None, None);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[1].len(), 10);
        assert_eq!(batches[2].len(), 5);

        let flattened: Vec<TestRecord> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, records);
    }

    #[test]
    fn test_create_batches_by_bytes() {
        let batcher = batcher();
        // {"payload":"0123456789"} serializes to 24 bytes
        let records: Vec<TestRecord> = (0..6).map(|_| record("0123456789")).collect();

        let batches = batcher.create_batches(records, "orders", Some(100), None, Some(50));

        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert_eq!(batch.len(), 2);
        }
    }

    #[test]
    fn test_oversized_record_gets_its_own_batch() {
        let batcher = batcher();
        let records = vec![record("a"), record(&"x".repeat(500)), record("b")];

        let batches = batcher.create_batches(records, "orders", Some(100), None, Some(50));

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].payload.len(), 500);
    }

    #[test]
    fn test_empty_input_no_batches() {
        let batcher = batcher();
        let batches =
            batcher.create_batches(Vec::<TestRecord>::new(), "orders", Some(10), None, None);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_interfaces_learn_independently() {
        let batcher = batcher();

        for _ in 0..10 {
            batcher.record_batch_performance("fast", 1_000, Duration::from_millis(100), true);
            batcher.record_batch_performance("slow", 10, Duration::from_secs(10), true);
        }

        // slow: 1s per record -> candidate 3, clamped to 10, damped (100+10)/2
        assert_eq!(batcher.optimal_batch_size("slow", 100, None), 55);
        assert_eq!(batcher.optimal_batch_size("fast", 100, None), 550);
    }
}
