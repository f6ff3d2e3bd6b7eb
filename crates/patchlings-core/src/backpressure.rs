//! Backpressure aggregator
//!
//! Counts events per (run, second). Once a second already holds more than
//! the configured threshold, further low-value events fold into summary
//! buckets keyed by (second, kind, name); each bucket later surfaces as one
//! synthesized `metric.backpressure.summary` event. Buckets flush when the
//! window advances to a new second and, unconditionally, before any turn
//! boundary event, so chapter summaries always contain every synthesized
//! summary attributable to them.
//!
//! Flush order is ascending (second, kind, name) — `BTreeMap` iteration —
//! so replays produce byte-identical output.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::event::{EventKind, Severity, TelemetryEvent, BACKPRESSURE_SUMMARY_NAME};

/// Key for a fold bucket: (second, kind wire name, event name).
type BucketKey = (i64, String, String);

#[derive(Debug, Clone)]
struct Bucket {
    count: u64,
    last_ts: String,
}

/// One flushed bucket, ready to become a synthesized summary event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBucket {
    pub second: i64,
    pub source_kind: String,
    pub source_name: String,
    pub count: u64,
    pub last_ts: String,
}

/// Admission decision for one observed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Deliver the event to dedup and the reducer.
    Pass,
    /// Folded into a bucket; suppress the event and count the drop.
    Fold,
}

/// Result of observing one external event.
#[derive(Debug)]
pub struct Observation {
    /// Buckets flushed by a window advance, in deterministic order.
    /// Synthesize and deliver these before the observed event.
    pub flushed: Vec<FlushedBucket>,
    /// Whether the observed event passes or folds.
    pub admission: Admission,
    /// Events counted in the run's current second, including this one.
    pub events_this_second: u32,
}

#[derive(Debug, Default)]
struct RunWindow {
    second: Option<i64>,
    count: u32,
    buckets: BTreeMap<BucketKey, Bucket>,
}

impl RunWindow {
    fn drain_below(&mut self, upto_second: i64) -> Vec<FlushedBucket> {
        let keep = self.buckets.split_off(&(upto_second, String::new(), String::new()));
        let drained = std::mem::replace(&mut self.buckets, keep);
        drained
            .into_iter()
            .map(|((second, source_kind, source_name), bucket)| FlushedBucket {
                second,
                source_kind,
                source_name,
                count: bucket.count,
                last_ts: bucket.last_ts,
            })
            .collect()
    }

    fn drain_all(&mut self) -> Vec<FlushedBucket> {
        self.drain_below(i64::MAX)
    }
}

/// Per-run rate-limiting aggregator.
#[derive(Debug)]
pub struct Aggregator {
    threshold: u32,
    windows: BTreeMap<String, RunWindow>,
}

impl Aggregator {
    /// Create an aggregator with the engine's events-per-second threshold.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            windows: BTreeMap::new(),
        }
    }

    /// The configured threshold (copied into chapter summaries).
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Observe one external event.
    ///
    /// `second` is `floor(ts_millis / 1000)`. The admission check compares
    /// the count of events already observed in this second against the
    /// threshold, so folding starts only once a second is already hot.
    pub fn observe(
        &mut self,
        run_id: &str,
        second: i64,
        kind: EventKind,
        name: &str,
        ts: &str,
        low_value: bool,
    ) -> Observation {
        let window = self.windows.entry(run_id.to_string()).or_default();

        let mut flushed = Vec::new();
        if window.second != Some(second) {
            flushed = window.drain_below(second);
            window.second = Some(second);
            window.count = 0;
        }

        let already = window.count;
        window.count = window.count.saturating_add(1);

        let admission = if already <= self.threshold || !low_value {
            Admission::Pass
        } else {
            let bucket = window
                .buckets
                .entry((second, kind.as_str().to_string(), name.to_string()))
                .or_insert_with(|| Bucket {
                    count: 0,
                    last_ts: ts.to_string(),
                });
            bucket.count += 1;
            bucket.last_ts = ts.to_string();
            Admission::Fold
        };

        Observation {
            flushed,
            admission,
            events_this_second: window.count,
        }
    }

    /// Flush every bucket for a run (turn boundaries, stream EOF).
    pub fn flush_run(&mut self, run_id: &str) -> Vec<FlushedBucket> {
        self.windows
            .get_mut(run_id)
            .map(RunWindow::drain_all)
            .unwrap_or_default()
    }
}

/// Build the synthesized summary event for a flushed bucket.
///
/// The caller supplies the run's freshly-minted internal sequence number and
/// its highest ingested upstream sequence (omitted while still negative).
#[must_use]
pub fn summary_event(
    run_id: &str,
    bucket: &FlushedBucket,
    seq: i64,
    upstream_seq: i64,
    threshold: u32,
) -> TelemetryEvent {
    let mut attrs: BTreeMap<String, Value> = BTreeMap::new();
    attrs.insert("patchlings_internal".to_string(), json!(true));
    attrs.insert("second".to_string(), json!(bucket.second));
    attrs.insert("source_kind".to_string(), json!(bucket.source_kind));
    attrs.insert("source_name".to_string(), json!(bucket.source_name));
    attrs.insert("count".to_string(), json!(bucket.count));
    attrs.insert("threshold".to_string(), json!(threshold));

    TelemetryEvent {
        v: crate::event::SCHEMA_VERSION,
        run_id: run_id.to_string(),
        seq,
        ts: bucket.last_ts.clone(),
        kind: EventKind::Metric,
        name: BACKPRESSURE_SUMMARY_NAME.to_string(),
        severity: Some(Severity::Info),
        attrs: Some(attrs),
        internal: true,
        upstream_seq: (upstream_seq >= 0).then_some(upstream_seq),
        extra: BTreeMap::new(),
    }
}
