//! patchlings-core: deterministic ingestion engine for agent telemetry
//!
//! Consumes ordered batches of validated telemetry events, applies a
//! privacy-preserving redaction policy, detects turn boundaries, and
//! maintains a durable world document summarizing each run.
//!
//! # Architecture
//!
//! ```text
//! Adapter → Validator → Redactor → Backpressure → Dedup → Reducer
//!                                       ↓                    ↓
//!                              synthesized summaries    world + chapters
//!                                                            ↓
//!                                              Persistence (.patchlings/)
//! ```
//!
//! # Modules
//!
//! - `event`: telemetry v1 schema and wire validator
//! - `salt`: workspace/run salt lifecycle and salted identity hashing
//! - `redact`: attribute redaction rules
//! - `backpressure`: per-(run, second) aggregation and summary synthesis
//! - `chapter`: open-chapter state machine and immutable summaries
//! - `world`: the world document and its legacy normalization
//! - `reducer`: event → world-state fold
//! - `storage`: fs/memory persistence and the pending-writes queue
//! - `engine`: the single-writer facade adapters and servers drive
//! - `config`: engine options
//! - `logging`: tracing-subscriber setup for collaborators
//!
//! # Determinism
//!
//! Given the same event stream and the same salts, accepted events, chapter
//! summaries, and the world document are byte-identical across replays. The
//! engine keeps no hidden clocks: every output timestamp derives from input
//! timestamps, with `created_at` as the only real-time seed (pinnable via
//! [`config::EngineOptions::fixed_created_at`]).
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod backpressure;
pub mod chapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod redact;
pub mod reducer;
pub mod salt;
pub mod storage;
pub mod world;

pub use chapter::{ChapterStatus, ChapterSummary};
pub use config::{EngineOptions, FixedSalts, StorageMode};
pub use engine::{BatchResult, Engine};
pub use error::{Error, Result};
pub use event::{validate_event, EventKind, Severity, TelemetryEvent};
pub use world::WorldState;
