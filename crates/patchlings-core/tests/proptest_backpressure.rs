//! Property-based tests for the backpressure aggregator.
//!
//! Verifies:
//! - Conservation: events seen = passed + folded within a second, and each
//!   flushed bucket's count equals the folds recorded for its (kind, name)
//! - High-value events always pass
//! - Flush order is ascending (second, kind, name)
//! - A turn-style full flush leaves no buckets behind

use std::collections::BTreeMap;

use proptest::prelude::*;

use patchlings_core::backpressure::{Admission, Aggregator};
use patchlings_core::event::EventKind;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StreamEvent {
    second: i64,
    kind: EventKind,
    name: String,
    low_value: bool,
}

fn arb_kind() -> impl Strategy<Value = EventKind> {
    prop_oneof![
        Just(EventKind::Log),
        Just(EventKind::Tool),
        Just(EventKind::Metric),
    ]
}

fn arb_stream() -> impl Strategy<Value = Vec<StreamEvent>> {
    prop::collection::vec(
        (0i64..4, arb_kind(), "[a-z]{1,6}", any::<bool>()).prop_map(
            |(second, kind, name, low_value)| StreamEvent {
                second,
                kind,
                name,
                low_value,
            },
        ),
        0..80,
    )
    .prop_map(|mut events| {
        // Seconds arrive in order; the aggregator contract assumes a
        // monotonic clock per run.
        events.sort_by_key(|event| event.second);
        events
    })
}

fn arb_threshold() -> impl Strategy<Value = u32> {
    0u32..10
}

// ────────────────────────────────────────────────────────────────────
// Invariants
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// passed + folded = seen, and bucket counts account for every fold.
    #[test]
    fn prop_conservation(stream in arb_stream(), threshold in arb_threshold()) {
        let mut aggregator = Aggregator::new(threshold);
        let mut passed = 0u64;
        let mut folded = 0u64;
        let mut fold_by_key: BTreeMap<(i64, String), u64> = BTreeMap::new();
        let mut flushed_counts: BTreeMap<(i64, String), u64> = BTreeMap::new();

        for event in &stream {
            let obs = aggregator.observe(
                "run-1",
                event.second,
                event.kind,
                &event.name,
                "2026-01-01T00:00:00Z",
                event.low_value,
            );
            for bucket in obs.flushed {
                *flushed_counts
                    .entry((bucket.second, bucket.source_name.clone()))
                    .or_insert(0) += bucket.count;
            }
            match obs.admission {
                Admission::Pass => passed += 1,
                Admission::Fold => {
                    folded += 1;
                    *fold_by_key
                        .entry((event.second, event.name.clone()))
                        .or_insert(0) += 1;
                }
            }
        }
        for bucket in aggregator.flush_run("run-1") {
            *flushed_counts
                .entry((bucket.second, bucket.source_name.clone()))
                .or_insert(0) += bucket.count;
        }

        prop_assert_eq!(passed + folded, stream.len() as u64);
        prop_assert_eq!(flushed_counts, fold_by_key);
    }

    /// High-value events pass no matter how hot the second is.
    #[test]
    fn prop_high_value_always_passes(count in 1usize..100, threshold in arb_threshold()) {
        let mut aggregator = Aggregator::new(threshold);
        for _ in 0..count {
            let obs = aggregator.observe(
                "run-1",
                0,
                EventKind::Tool,
                "tool.x",
                "2026-01-01T00:00:00Z",
                false,
            );
            prop_assert_eq!(obs.admission, Admission::Pass);
        }
    }

    /// Flush order is ascending (second, kind, name).
    #[test]
    fn prop_flush_order_deterministic(stream in arb_stream()) {
        let mut aggregator = Aggregator::new(0);
        for event in &stream {
            aggregator.observe(
                "run-1",
                event.second,
                event.kind,
                &event.name,
                "2026-01-01T00:00:00Z",
                event.low_value,
            );
        }
        let flushed = aggregator.flush_run("run-1");
        let keys: Vec<(i64, String, String)> = flushed
            .iter()
            .map(|bucket| {
                (
                    bucket.second,
                    bucket.source_kind.clone(),
                    bucket.source_name.clone(),
                )
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(keys, sorted);

        // Everything drained: a second flush finds nothing.
        prop_assert!(aggregator.flush_run("run-1").is_empty());
    }

    /// Per-second counting is independent across runs.
    #[test]
    fn prop_runs_are_isolated(count in 1usize..30) {
        let mut aggregator = Aggregator::new(0);
        for _ in 0..count {
            aggregator.observe("run-a", 0, EventKind::Log, "log.x", "t", true);
        }
        // run-b's first event is still the first of its second.
        let obs = aggregator.observe("run-b", 0, EventKind::Log, "log.x", "t", true);
        prop_assert_eq!(obs.admission, Admission::Pass);
        prop_assert_eq!(obs.events_this_second, 1);
    }
}
