//! Property-based tests for batch construction

use batching::{AdaptiveBatcher, BatcherConfig};
use proptest::prelude::*;
use std::time::Duration;

fn records_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9]{0,64}", 0..200)
}

fn batcher() -> AdaptiveBatcher {
    AdaptiveBatcher::new(BatcherConfig::default())
}

proptest! {
    #[test]
    fn prop_batches_partition_input(
        records in records_strategy(),
        max_records in 1usize..50,
    ) {
        let batcher = batcher();
        let batches = batcher.create_batches(
            records.clone(),
            "orders",
            Some(max_records),
            None,
            None,
        );

        let flattened: Vec<String> = batches.into_iter().flatten().collect();
        prop_assert_eq!(flattened, records);
    }

    #[test]
    fn prop_no_batch_exceeds_count_bound(
        records in records_strategy(),
        max_records in 1usize..50,
    ) {
        let batcher = batcher();
        let batches = batcher.create_batches(records, "orders", Some(max_records), None, None);

        for batch in batches {
            prop_assert!(batch.len() <= max_records);
        }
    }

    #[test]
    fn prop_byte_bound_holds_for_multi_record_batches(
        records in records_strategy(),
        max_bytes in 16usize..512,
    ) {
        let batcher = batcher();
        let batches = batcher.create_batches(
            records,
            "orders",
            Some(1_000),
            None,
            Some(max_bytes),
        );

        for batch in batches {
            // A single oversized record is allowed through as its own batch;
            // everything else stays under the bound.
            if batch.len() > 1 {
                let total: usize = batch
                    .iter()
                    .map(|r| serde_json::to_vec(r).map(|b| b.len()).unwrap_or(0))
                    .sum();
                prop_assert!(total <= max_bytes, "batch of {} bytes over {}", total, max_bytes);
            }
        }
    }

    #[test]
    fn prop_empty_input_yields_no_batches(max_records in 1usize..50) {
        let batcher = batcher();
        let batches =
            batcher.create_batches(Vec::<String>::new(), "orders", Some(max_records), None, None);
        prop_assert!(batches.is_empty());
    }

    #[test]
    fn prop_optimal_size_stays_in_bounds(
        record_counts in prop::collection::vec(1usize..5_000, 10..40),
        millis in prop::collection::vec(1u64..60_000, 10..40),
    ) {
        let batcher = batcher();
        let n = record_counts.len().min(millis.len());
        for i in 0..n {
            batcher.record_batch_performance(
                "orders",
                record_counts[i],
                Duration::from_millis(millis[i]),
                true,
            );
        }

        let size = batcher.optimal_batch_size("orders", 100, None);
        // Midpoint damping never leaves the clamp bounds
        prop_assert!(size >= 10);
        prop_assert!(size <= 1_000);
    }
}
