//! World state document
//!
//! A single versioned document per workspace, mutated only by the engine and
//! rewritten to `world.json` on every batch. All maps are `BTreeMap` and all
//! identifiers are short salted hashes; serialization is byte-stable across
//! replays with equal inputs and salts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// World document version.
pub const WORLD_VERSION: u32 = 1;

/// Initial offset for synthesized sequence numbers. Large enough that they
/// never collide with plausible upstream values and are obvious on
/// inspection.
pub const INTERNAL_SEQ_OFFSET: i64 = 1_000_000_000;

fn default_last_upstream_seq() -> i64 {
    -1
}

fn default_internal_seq() -> i64 {
    INTERNAL_SEQ_OFFSET
}

/// Global counters across all runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldCounters {
    pub events: u64,
    pub chapters: u64,
    pub dropped_low_value_events: u64,
    pub duplicate_events: u64,
    pub backpressure_summaries: u64,
}

/// Per-run aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub chapter_count: u64,
    pub event_count: u64,
    pub tool_invocations: u64,
    pub file_touches: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub errors: u64,
    pub dropped_low_value_events: u64,
    pub duplicate_events: u64,
    pub peak_events_per_sec: u32,
    /// Highest external sequence ingested; −1 until the first accept.
    #[serde(alias = "last_seq")]
    pub last_upstream_seq: i64,
    /// Counter for synthesized events; starts at [`INTERNAL_SEQ_OFFSET`].
    pub internal_seq: i64,
    pub recording_index: u32,
    pub recording_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            chapter_count: 0,
            event_count: 0,
            tool_invocations: 0,
            file_touches: 0,
            tests_passed: 0,
            tests_failed: 0,
            errors: 0,
            dropped_low_value_events: 0,
            duplicate_events: 0,
            peak_events_per_sec: 0,
            last_upstream_seq: default_last_upstream_seq(),
            internal_seq: default_internal_seq(),
            recording_index: 0,
            recording_bytes: 0,
            last_ts: None,
        }
    }
}

impl RunState {
    /// Mint the next synthesized sequence number for this run.
    pub fn next_internal_seq(&mut self) -> i64 {
        self.internal_seq += 1;
        self.internal_seq
    }
}

/// A directory-level aggregate: files sharing a directory hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionState {
    /// Distinct files first observed in this region.
    pub files: u64,
    /// Total file touches attributed to this region.
    pub touches: u64,
}

/// A single file aggregate, keyed by path hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// Region assigned on first observation; never reassigned.
    pub region_id: String,
    pub touches: u64,
    /// Name of the most recent event that touched this file.
    pub last_event: String,
}

/// A tool aggregate, keyed by the hash of the tool name under the workspace
/// salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchlingState {
    /// Raw tool name (categorical, not content).
    pub name: String,
    pub invocations: u64,
    pub last_ts: String,
}

/// The world document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub v: u32,
    pub workspace_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub counters: WorldCounters,
    #[serde(default)]
    pub runs: BTreeMap<String, RunState>,
    #[serde(default)]
    pub regions: BTreeMap<String, RegionState>,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
    #[serde(default)]
    pub patchlings: BTreeMap<String, PatchlingState>,
}

impl WorldState {
    /// Fresh document for a workspace.
    #[must_use]
    pub fn new(workspace_id: impl Into<String>, created_at: impl Into<String>) -> Self {
        let created_at = created_at.into();
        Self {
            v: WORLD_VERSION,
            workspace_id: workspace_id.into(),
            updated_at: created_at.clone(),
            created_at,
            counters: WorldCounters::default(),
            runs: BTreeMap::new(),
            regions: BTreeMap::new(),
            files: BTreeMap::new(),
            patchlings: BTreeMap::new(),
        }
    }

    /// Fetch or create the run state for a run id.
    pub fn ensure_run(&mut self, run_id: &str) -> &mut RunState {
        self.runs.entry(run_id.to_string()).or_default()
    }

    /// Normalize a loaded legacy document in place.
    ///
    /// Serde aliases and defaults already handle renamed and missing fields;
    /// this additionally clamps per-run internal sequences that predate the
    /// offset so invariant 3 holds for documents written by older engines.
    pub fn normalize(&mut self) {
        self.v = WORLD_VERSION;
        for run in self.runs.values_mut() {
            if run.internal_seq < INTERNAL_SEQ_OFFSET {
                run.internal_seq = INTERNAL_SEQ_OFFSET;
            }
        }
    }
}
