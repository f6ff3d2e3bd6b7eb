//! Property-based tests for the engine facade.
//!
//! Verifies, over arbitrary valid event streams with pinned salts:
//! - Determinism: equal inputs produce byte-equal worlds and chapter lists
//! - Batch-split equivalence: any batching of the same stream converges
//! - Sequence monotonicity: `last_upstream_seq` equals the maximum accepted
//!   external upstream sequence
//! - No double-close: chapter ids are unique and turn indexes increase

use std::collections::BTreeMap;
use std::path::PathBuf;

use proptest::prelude::*;
use serde_json::json;

use patchlings_core::config::{EngineOptions, FixedSalts, StorageMode};
use patchlings_core::event::{EventKind, Severity, TelemetryEvent};
use patchlings_core::Engine;

// ────────────────────────────────────────────────────────────────────
// Stream generation
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    TurnStart,
    TurnComplete,
    TurnFail,
    Tool(u8),
    File(u8),
    Log,
    TestPass,
    TestFail,
    ErrorEvent,
    Duplicate,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => Just(Step::TurnStart),
        2 => Just(Step::TurnComplete),
        1 => Just(Step::TurnFail),
        3 => (0u8..4).prop_map(Step::Tool),
        3 => (0u8..4).prop_map(Step::File),
        4 => Just(Step::Log),
        1 => Just(Step::TestPass),
        1 => Just(Step::TestFail),
        1 => Just(Step::ErrorEvent),
        1 => Just(Step::Duplicate),
    ]
}

fn materialize(steps: &[Step]) -> Vec<TelemetryEvent> {
    let mut events: Vec<TelemetryEvent> = Vec::new();
    let mut seq: i64 = 0;

    for (index, step) in steps.iter().enumerate() {
        // Advance the clock every few events so streams span seconds.
        let second = (index / 5) as i64;
        let ts = format!("2026-01-01T00:00:{:02}.000Z", second.min(59));

        let (kind, name, attrs, severity) = match step {
            Step::TurnStart => (EventKind::Turn, "turn.started".to_string(), None, None),
            Step::TurnComplete => (EventKind::Turn, "turn.completed".to_string(), None, None),
            Step::TurnFail => (EventKind::Turn, "turn.failed".to_string(), None, None),
            Step::Tool(id) => (
                EventKind::Tool,
                "tool.invoke".to_string(),
                Some([("tool_name".to_string(), json!(format!("tool-{id}")))].into()),
                None,
            ),
            Step::File(id) => (
                EventKind::File,
                "file.write".to_string(),
                Some([("path".to_string(), json!(format!("src/file-{id}.rs")))].into()),
                None,
            ),
            Step::Log => (
                EventKind::Log,
                "log.progress".to_string(),
                None,
                Some(Severity::Debug),
            ),
            Step::TestPass => (EventKind::Test, "test.pass".to_string(), None, None),
            Step::TestFail => (EventKind::Test, "test.fail".to_string(), None, None),
            Step::ErrorEvent => (EventKind::Error, "error.crash".to_string(), None, None),
            Step::Duplicate => {
                let Some(previous) = events.last() else {
                    continue;
                };
                let mut dup: TelemetryEvent = previous.clone();
                dup.ts = ts;
                events.push(dup);
                continue;
            }
        };

        events.push(TelemetryEvent {
            v: 1,
            run_id: "run-1".to_string(),
            seq,
            ts,
            kind,
            name,
            severity,
            attrs,
            internal: false,
            upstream_seq: None,
            extra: BTreeMap::new(),
        });
        seq += 1;
    }
    events
}

fn options() -> EngineOptions {
    EngineOptions {
        workspace_root: PathBuf::from("/workspace"),
        storage: StorageMode::Memory,
        events_per_sec_threshold: 2,
        fixed_salts: Some(FixedSalts {
            workspace_salt: "workspace-salt".to_string(),
            run_salts: [("run-1".to_string(), "run-salt".to_string())].into(),
        }),
        fixed_created_at: Some("2026-01-01T00:00:00.000Z".to_string()),
        ..EngineOptions::default()
    }
}

fn run_engine<F, T>(body: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(body)
}

// ────────────────────────────────────────────────────────────────────
// Invariants
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Two engines fed the same stream agree byte-for-byte.
    #[test]
    fn prop_determinism(steps in prop::collection::vec(arb_step(), 0..60)) {
        let events = materialize(&steps);
        let (world_a, chapters_a, world_b, chapters_b) = run_engine(async {
            let mut a = Engine::create(options()).await.unwrap();
            let mut b = Engine::create(options()).await.unwrap();
            a.ingest_batch(events.clone()).await.unwrap();
            b.ingest_batch(events.clone()).await.unwrap();
            (
                serde_json::to_string(a.get_world()).unwrap(),
                serde_json::to_string(&a.get_chapters(None)).unwrap(),
                serde_json::to_string(b.get_world()).unwrap(),
                serde_json::to_string(&b.get_chapters(None)).unwrap(),
            )
        });
        prop_assert_eq!(world_a, world_b);
        prop_assert_eq!(chapters_a, chapters_b);
    }

    /// Splitting the stream into sub-batches changes nothing.
    #[test]
    fn prop_batch_split_equivalence(
        steps in prop::collection::vec(arb_step(), 0..60),
        split in 0usize..60,
    ) {
        let events = materialize(&steps);
        let split = split.min(events.len());
        let (whole_world, whole_chapters, split_world, split_chapters) = run_engine(async {
            let mut whole = Engine::create(options()).await.unwrap();
            whole.ingest_batch(events.clone()).await.unwrap();

            let mut halves = Engine::create(options()).await.unwrap();
            halves.ingest_batch(events[..split].to_vec()).await.unwrap();
            halves.ingest_batch(events[split..].to_vec()).await.unwrap();

            (
                serde_json::to_string(whole.get_world()).unwrap(),
                serde_json::to_string(&whole.get_chapters(None)).unwrap(),
                serde_json::to_string(halves.get_world()).unwrap(),
                serde_json::to_string(&halves.get_chapters(None)).unwrap(),
            )
        });
        prop_assert_eq!(whole_world, split_world);
        prop_assert_eq!(whole_chapters, split_chapters);
    }

    /// last_upstream_seq tracks the maximum accepted external sequence.
    #[test]
    fn prop_sequence_monotonicity(steps in prop::collection::vec(arb_step(), 1..60)) {
        let events = materialize(&steps);
        let (result,) = run_engine(async {
            let mut engine = Engine::create(options()).await.unwrap();
            (engine.ingest_batch(events.clone()).await.unwrap(),)
        });

        let max_accepted = result
            .accepted_events
            .iter()
            .filter(|event| !event.internal)
            .map(TelemetryEvent::upstream_seq)
            .max();

        match max_accepted {
            Some(max) => {
                prop_assert_eq!(result.world.runs["run-1"].last_upstream_seq, max);
            }
            None => {
                if let Some(run) = result.world.runs.get("run-1") {
                    prop_assert_eq!(run.last_upstream_seq, -1);
                }
            }
        }
    }

    /// Every chapter closes exactly once: unique ids and strictly
    /// increasing turn indexes per run.
    #[test]
    fn prop_no_double_close(steps in prop::collection::vec(arb_step(), 0..80)) {
        let events = materialize(&steps);
        let (result,) = run_engine(async {
            let mut engine = Engine::create(options()).await.unwrap();
            (engine.ingest_batch(events).await.unwrap(),)
        });

        let mut seen = std::collections::BTreeSet::new();
        let mut last_index = 0u64;
        for chapter in &result.closed_chapters {
            prop_assert!(seen.insert(chapter.chapter_id.clone()), "chapter closed twice");
            prop_assert!(chapter.turn_index > last_index);
            last_index = chapter.turn_index;
            prop_assert_eq!(
                chapter.chapter_id.clone(),
                format!("{}:{}", chapter.run_id, chapter.turn_index)
            );
        }
        prop_assert_eq!(
            result.world.counters.chapters,
            result.closed_chapters.len() as u64
        );

        // Global event count is conserved across per-run counts.
        let per_run: u64 = result.world.runs.values().map(|run| run.event_count).sum();
        prop_assert_eq!(result.world.counters.events, per_run);
        prop_assert_eq!(
            result.world.counters.events,
            result.accepted_events.len() as u64
        );
    }
}
