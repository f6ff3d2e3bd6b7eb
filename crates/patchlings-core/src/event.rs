//! Telemetry v1 event schema and wire validator
//!
//! Adapters hand the engine batches of validated [`TelemetryEvent`]s.
//! Unknown top-level fields are preserved unchanged so newer producers can
//! round-trip through older engines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Current wire schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Name of the event that opens a chapter.
pub const TURN_STARTED: &str = "turn.started";
/// Name of the event that closes a chapter as completed.
pub const TURN_COMPLETED: &str = "turn.completed";
/// Name of the event that closes a chapter as failed.
pub const TURN_FAILED: &str = "turn.failed";

/// Name carried by synthesized backpressure summaries.
pub const BACKPRESSURE_SUMMARY_NAME: &str = "metric.backpressure.summary";

/// Categorical event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Turn,
    Tool,
    File,
    Git,
    Test,
    Spawn,
    Log,
    Error,
    Metric,
}

impl EventKind {
    /// Wire name for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Turn => "turn",
            Self::Tool => "tool",
            Self::File => "file",
            Self::Git => "git",
            Self::Test => "test",
            Self::Spawn => "spawn",
            Self::Log => "log",
            Self::Error => "error",
            Self::Metric => "metric",
        }
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single telemetry record on the wire (v1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Schema version; must be [`SCHEMA_VERSION`].
    pub v: u32,
    /// Logical execution this event belongs to.
    pub run_id: String,
    /// Source-assigned monotonic sequence number.
    pub seq: i64,
    /// ISO-8601 timestamp assigned by the source.
    pub ts: String,
    /// Categorical kind.
    pub kind: EventKind,
    /// Event name (e.g. `turn.started`, `tool.shell.start`).
    pub name: String,
    /// Optional severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Flat attribute map; values are JSON primitives after redaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<BTreeMap<String, Value>>,
    /// Set on events the engine synthesized itself.
    #[serde(default, skip_serializing_if = "is_false")]
    pub internal: bool,
    /// External sequence this event correlates with (synthesized events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_seq: Option<i64>,
    /// Unknown top-level fields, preserved unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl TelemetryEvent {
    /// Sequence number used for deduplication.
    #[must_use]
    pub fn upstream_seq(&self) -> i64 {
        self.upstream_seq.unwrap_or(self.seq)
    }

    /// Parse the event timestamp to epoch milliseconds.
    pub fn ts_millis(&self) -> Result<i64> {
        parse_ts_millis(&self.ts)
    }

    /// Low-value events are eligible for backpressure folding.
    #[must_use]
    pub fn is_low_value(&self) -> bool {
        if self.kind == EventKind::Log {
            return true;
        }
        if self.severity == Some(Severity::Debug) {
            return true;
        }
        let name = self.name.to_ascii_lowercase();
        name.contains("progress") || name.contains("delta") || name.contains("heartbeat")
    }

    /// Whether this name forces a full aggregator flush before ingestion.
    #[must_use]
    pub fn is_turn_boundary(&self) -> bool {
        matches!(self.name.as_str(), TURN_STARTED | TURN_COMPLETED | TURN_FAILED)
    }
}

/// Parse an ISO-8601 timestamp into epoch milliseconds.
pub fn parse_ts_millis(ts: &str) -> Result<i64> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .map_err(|err| Error::Timestamp(format!("{ts:?}: {err}")))
}

/// Validate a raw JSON record against the telemetry v1 schema.
///
/// Structural checks only; sequence discipline and dedup happen inside the
/// engine. Unknown top-level fields survive into [`TelemetryEvent::extra`].
pub fn validate_event(value: &Value) -> Result<TelemetryEvent> {
    let event: TelemetryEvent = serde_json::from_value(value.clone())
        .map_err(|err| Error::InvalidEvent(err.to_string()))?;

    if event.v != SCHEMA_VERSION {
        return Err(Error::InvalidEvent(format!(
            "unsupported schema version {} (expected {SCHEMA_VERSION})",
            event.v
        )));
    }
    if event.run_id.is_empty() {
        return Err(Error::InvalidEvent("empty run_id".to_string()));
    }
    if event.seq < 0 {
        return Err(Error::InvalidEvent(format!("negative seq {}", event.seq)));
    }
    if event.name.is_empty() {
        return Err(Error::InvalidEvent("empty name".to_string()));
    }
    parse_ts_millis(&event.ts)?;

    Ok(event)
}
