//! Chapter state machine
//!
//! A chapter is the span between a `turn.started` and its terminating event.
//! The engine holds at most one [`OpenChapter`] per run; closing converts it
//! into an immutable [`ChapterSummary`]. Keeping the two as distinct types
//! means a persisted summary can never be mutated after the fact.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::event::parse_ts_millis;

/// Terminal status of a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Completed,
    Failed,
    Interrupted,
}

/// Test outcome counts within a chapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub pass: u64,
    pub fail: u64,
}

/// Backpressure forensics copied into each summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureStats {
    pub dropped_low_value: u64,
    pub peak_events_per_sec: u32,
    pub threshold: u32,
    pub summaries_emitted: u64,
}

/// Mutable state of the chapter currently open for a run. In-memory only;
/// a crash simply loses it.
#[derive(Debug, Clone)]
pub struct OpenChapter {
    pub run_id: String,
    pub chapter_id: String,
    pub turn_index: u64,
    pub started_ts: String,
    pub started_seq: i64,
    pub latest_ts: String,
    pub latest_seq: i64,
    pub title: Option<String>,
    pub files_touched: BTreeSet<String>,
    pub tools_used: BTreeMap<String, u64>,
    pub tests: TestCounts,
    pub errors: u64,
    pub dropped_low_value: u64,
    pub summaries_emitted: u64,
    pub peak_events_per_sec: u32,
    pub event_count: u64,
}

impl OpenChapter {
    /// Open a chapter for a run.
    ///
    /// `initial_event_count` is 1 when opened by `turn.started` (the start
    /// counts itself) and 0 for implicit opens.
    #[must_use]
    pub fn open(
        run_id: &str,
        turn_index: u64,
        ts: &str,
        seq: i64,
        title: Option<String>,
        initial_event_count: u64,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            chapter_id: format!("{run_id}:{turn_index}"),
            turn_index,
            started_ts: ts.to_string(),
            started_seq: seq,
            latest_ts: ts.to_string(),
            latest_seq: seq,
            title,
            files_touched: BTreeSet::new(),
            tools_used: BTreeMap::new(),
            tests: TestCounts::default(),
            errors: 0,
            dropped_low_value: 0,
            summaries_emitted: 0,
            peak_events_per_sec: 0,
            event_count: initial_event_count,
        }
    }

    /// Record that an event extended this chapter.
    pub fn touch(&mut self, ts: &str, seq: i64) {
        self.latest_ts = ts.to_string();
        self.latest_seq = seq;
        self.event_count += 1;
    }

    /// Close into an immutable summary.
    #[must_use]
    pub fn close(
        self,
        status: ChapterStatus,
        completed_ts: &str,
        seq_end: i64,
        threshold: u32,
    ) -> ChapterSummary {
        let started_ms = parse_ts_millis(&self.started_ts).ok();
        let completed_ms = parse_ts_millis(completed_ts).ok();
        let duration_ms = match (started_ms, completed_ms) {
            (Some(start), Some(end)) => (end - start).max(0) as u64,
            _ => 0,
        };

        ChapterSummary {
            v: 1,
            run_id: self.run_id,
            chapter_id: self.chapter_id,
            turn_index: self.turn_index,
            status,
            started_ts: self.started_ts,
            completed_ts: completed_ts.to_string(),
            duration_ms,
            seq_start: self.started_seq,
            seq_end,
            files_touched: self.files_touched.into_iter().collect(),
            tools_used: self.tools_used,
            tests: self.tests,
            errors: self.errors,
            backpressure: BackpressureStats {
                dropped_low_value: self.dropped_low_value,
                peak_events_per_sec: self.peak_events_per_sec,
                threshold,
                summaries_emitted: self.summaries_emitted,
            },
            title: self.title,
        }
    }
}

/// Immutable chapter record, appended to `chapters.ndjson` at close time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub v: u32,
    pub run_id: String,
    pub chapter_id: String,
    pub turn_index: u64,
    pub status: ChapterStatus,
    pub started_ts: String,
    pub completed_ts: String,
    pub duration_ms: u64,
    pub seq_start: i64,
    pub seq_end: i64,
    /// Sorted, unique file ids touched during the chapter.
    pub files_touched: Vec<String>,
    /// Tool-name → invocation count, keys sorted.
    pub tools_used: BTreeMap<String, u64>,
    pub tests: TestCounts,
    pub errors: u64,
    pub backpressure: BackpressureStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}
