//! Engine configuration
//!
//! All knobs the engine honors arrive through [`EngineOptions`]; the only
//! environment input is the global allow-content default, read once at
//! construction so event processing never consults mutable process state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable that flips the allow-content default for a deployment.
pub const ALLOW_CONTENT_ENV: &str = "PATCHLINGS_ALLOW_CONTENT";

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Durable files under the workspace-local internal directory.
    Fs,
    /// In-memory file map (tests, demo adapters).
    Memory,
}

/// Pinned salts for deterministic runs and test fixtures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixedSalts {
    /// Workspace salt used verbatim instead of the persisted/generated one.
    pub workspace_salt: String,
    /// Per-run salts used verbatim; runs not listed still mint lazily.
    #[serde(default)]
    pub run_salts: BTreeMap<String, String>,
}

/// Options accepted by [`crate::engine::Engine::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Workspace root the engine accounts against.
    pub workspace_root: PathBuf,

    /// Name of the workspace-local internal directory.
    pub internal_dir: String,

    /// Per-second event threshold before low-value folding starts.
    pub events_per_sec_threshold: u32,

    /// Append accepted events to per-run recording files.
    pub record_telemetry: bool,

    /// Storage backend.
    pub storage: StorageMode,

    /// Most-recent chapter summaries retained in memory.
    pub max_chapters_in_memory: usize,

    /// Recording file size at which the next append rotates to a new file.
    pub max_recording_bytes: u64,

    /// Pinned salts; `None` uses persisted or freshly generated salts.
    pub fixed_salts: Option<FixedSalts>,

    /// Override the allow-content default (else the environment, else false).
    pub allow_content: Option<bool>,

    /// Pinned creation timestamp for the world document and salt records.
    /// When unset, the wall clock seeds `created_at` (the only real-time
    /// field in any output).
    pub fixed_created_at: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            internal_dir: default_internal_dir(),
            events_per_sec_threshold: default_threshold(),
            record_telemetry: false,
            storage: StorageMode::Fs,
            max_chapters_in_memory: default_max_chapters(),
            max_recording_bytes: default_max_recording_bytes(),
            fixed_salts: None,
            allow_content: None,
            fixed_created_at: None,
        }
    }
}

fn default_internal_dir() -> String {
    ".patchlings".to_string()
}

fn default_threshold() -> u32 {
    120
}

fn default_max_chapters() -> usize {
    500
}

fn default_max_recording_bytes() -> u64 {
    2 * 1024 * 1024
}

impl EngineOptions {
    /// Resolve the effective allow-content flag: explicit option first, then
    /// the environment default, else false.
    #[must_use]
    pub fn resolve_allow_content(&self) -> bool {
        if let Some(flag) = self.allow_content {
            return flag;
        }
        match std::env::var(ALLOW_CONTENT_ENV) {
            Ok(value) => matches!(value.trim(), "1" | "true" | "TRUE" | "yes"),
            Err(_) => false,
        }
    }
}
