//! Event reducer
//!
//! Folds accepted events (external and synthesized) into the world document
//! and the per-run open chapter. All work here is synchronous and CPU-bound;
//! given equal inputs and salts the mutations are byte-identical across
//! replays.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::chapter::{ChapterStatus, ChapterSummary, OpenChapter};
use crate::event::{EventKind, Severity, TelemetryEvent, TURN_COMPLETED, TURN_FAILED, TURN_STARTED};
use crate::salt::{hash_value, REGION_UNKNOWN};
use crate::world::WorldState;

/// Attribute keys consulted, in order, to resolve a tool name.
const TOOL_NAME_KEYS: &[&str] = &["tool_name", "tool", "adapter_tool"];

/// Attribute keys consulted, in order, to derive a prompt-based title.
const PROMPT_TITLE_KEYS: &[&str] = &["prompt_hash", "prompt_stable_hash", "prompt_id"];

/// Attribute keys consulted, in order, for a free-form label title.
const LABEL_TITLE_KEYS: &[&str] = &["label", "turn_label"];

/// Stateless event → world-state fold, parameterized by the engine's
/// threshold (copied into summaries) and workspace salt (tool identity).
#[derive(Debug)]
pub struct Reducer {
    threshold: u32,
    workspace_salt: String,
}

impl Reducer {
    /// Create a reducer.
    #[must_use]
    pub fn new(threshold: u32, workspace_salt: impl Into<String>) -> Self {
        Self {
            threshold,
            workspace_salt: workspace_salt.into(),
        }
    }

    /// Apply one accepted event. Returns any chapters closed by it, in close
    /// order.
    pub fn reduce(
        &self,
        world: &mut WorldState,
        open_chapters: &mut BTreeMap<String, OpenChapter>,
        event: &TelemetryEvent,
    ) -> Vec<ChapterSummary> {
        world.counters.events += 1;
        world.updated_at = event.ts.clone();
        {
            let run = world.ensure_run(&event.run_id);
            run.event_count += 1;
            run.last_ts = Some(event.ts.clone());
        }

        if event.kind == EventKind::Turn {
            match event.name.as_str() {
                TURN_STARTED => return self.start_turn(world, open_chapters, event),
                TURN_COMPLETED => {
                    return self.end_turn(world, open_chapters, event, ChapterStatus::Completed);
                }
                TURN_FAILED => {
                    return self.end_turn(world, open_chapters, event, ChapterStatus::Failed);
                }
                _ => {}
            }
        }

        self.fold_event(world, open_chapters, event);
        Vec::new()
    }

    /// Handle `turn.started`: interrupt any open chapter, then open the next.
    fn start_turn(
        &self,
        world: &mut WorldState,
        open_chapters: &mut BTreeMap<String, OpenChapter>,
        event: &TelemetryEvent,
    ) -> Vec<ChapterSummary> {
        let mut closed = Vec::new();
        if let Some(open) = open_chapters.remove(&event.run_id) {
            closed.push(self.close_chapter(world, open, ChapterStatus::Interrupted, event));
        }

        let turn_index = world.ensure_run(&event.run_id).chapter_count + 1;
        let title = derive_title(event.attrs.as_ref());
        open_chapters.insert(
            event.run_id.clone(),
            OpenChapter::open(&event.run_id, turn_index, &event.ts, event.seq, title, 1),
        );
        closed
    }

    /// Handle a terminal turn event; no open chapter means no-op.
    fn end_turn(
        &self,
        world: &mut WorldState,
        open_chapters: &mut BTreeMap<String, OpenChapter>,
        event: &TelemetryEvent,
        status: ChapterStatus,
    ) -> Vec<ChapterSummary> {
        match open_chapters.remove(&event.run_id) {
            Some(open) => vec![self.close_chapter(world, open, status, event)],
            None => Vec::new(),
        }
    }

    fn close_chapter(
        &self,
        world: &mut WorldState,
        open: OpenChapter,
        status: ChapterStatus,
        event: &TelemetryEvent,
    ) -> ChapterSummary {
        let summary = open.close(status, &event.ts, event.seq, self.threshold);
        world.counters.chapters += 1;
        world.ensure_run(&summary.run_id).chapter_count += 1;
        summary
    }

    /// Fold a non-turn event into the (possibly implicitly created) open
    /// chapter, then apply kind-specific accounting.
    fn fold_event(
        &self,
        world: &mut WorldState,
        open_chapters: &mut BTreeMap<String, OpenChapter>,
        event: &TelemetryEvent,
    ) {
        let turn_index = world.ensure_run(&event.run_id).chapter_count + 1;
        let chapter = open_chapters.entry(event.run_id.clone()).or_insert_with(|| {
            OpenChapter::open(&event.run_id, turn_index, &event.ts, event.seq, None, 0)
        });
        chapter.touch(&event.ts, event.seq);

        match event.kind {
            EventKind::Tool => {
                let tool_name = resolve_tool_name(event);
                world.ensure_run(&event.run_id).tool_invocations += 1;
                *chapter.tools_used.entry(tool_name.clone()).or_insert(0) += 1;

                let patchling_id = hash_value(&tool_name, &self.workspace_salt);
                let patchling = world
                    .patchlings
                    .entry(patchling_id)
                    .or_insert_with(|| crate::world::PatchlingState {
                        name: tool_name,
                        invocations: 0,
                        last_ts: event.ts.clone(),
                    });
                patchling.invocations += 1;
                patchling.last_ts = event.ts.clone();
            }
            EventKind::File => {
                world.ensure_run(&event.run_id).file_touches += 1;
                if let Some(path_id) = resolve_path_id(event.attrs.as_ref()) {
                    let region_id = resolve_region_id(event.attrs.as_ref());
                    self.touch_file(world, &path_id, &region_id, &event.name);
                    chapter.files_touched.insert(path_id);
                }
            }
            EventKind::Test => {
                if event.name.contains("pass") {
                    world.ensure_run(&event.run_id).tests_passed += 1;
                    chapter.tests.pass += 1;
                } else if event.name.contains("fail") {
                    world.ensure_run(&event.run_id).tests_failed += 1;
                    chapter.tests.fail += 1;
                }
            }
            _ => {}
        }

        // kind=error and severity=error both count, but never twice.
        if event.kind == EventKind::Error || event.severity == Some(Severity::Error) {
            world.ensure_run(&event.run_id).errors += 1;
            chapter.errors += 1;
        }
    }

    fn touch_file(&self, world: &mut WorldState, path_id: &str, region_id: &str, event_name: &str) {
        if !world.files.contains_key(path_id) {
            world.files.insert(
                path_id.to_string(),
                crate::world::FileState {
                    region_id: region_id.to_string(),
                    touches: 0,
                    last_event: String::new(),
                },
            );
            world.regions.entry(region_id.to_string()).or_default().files += 1;
        }

        // The region assigned at first observation sticks, even when later
        // events resolve a different directory hash.
        let assigned_region = match world.files.get_mut(path_id) {
            Some(file) => {
                file.touches += 1;
                file.last_event = event_name.to_string();
                file.region_id.clone()
            }
            None => region_id.to_string(),
        };
        world.regions.entry(assigned_region).or_default().touches += 1;
    }
}

/// Resolve the tool name from attributes, falling back to the event name.
fn resolve_tool_name(event: &TelemetryEvent) -> String {
    if let Some(attrs) = event.attrs.as_ref() {
        for key in TOOL_NAME_KEYS {
            if let Some(Value::String(name)) = attrs.get(*key) {
                if !name.is_empty() {
                    return name.clone();
                }
            }
        }
    }
    event.name.clone()
}

/// Resolve the file identity from redacted attributes.
///
/// Workspace-stable hashes win so the per-workspace file map unifies a path
/// across runs; run-scoped `*path*_hash` keys are the fallback.
fn resolve_path_id(attrs: Option<&BTreeMap<String, Value>>) -> Option<String> {
    let attrs = attrs?;
    for (key, value) in attrs {
        if key.ends_with("_stable_hash") && !key.ends_with("_stable_dir_hash") {
            if let Value::String(id) = value {
                return Some(id.clone());
            }
        }
    }
    for (key, value) in attrs {
        if key.ends_with("_hash")
            && !key.ends_with("_dir_hash")
            && !key.ends_with("_stable_hash")
            && key.contains("path")
        {
            if let Value::String(id) = value {
                return Some(id.clone());
            }
        }
    }
    None
}

/// Resolve the directory identity, or `region.unknown`.
fn resolve_region_id(attrs: Option<&BTreeMap<String, Value>>) -> String {
    if let Some(attrs) = attrs {
        for (key, value) in attrs {
            if key.ends_with("_stable_dir_hash") {
                if let Value::String(id) = value {
                    return id.clone();
                }
            }
        }
        for (key, value) in attrs {
            if key.ends_with("_dir_hash") && !key.ends_with("_stable_dir_hash") && key.contains("path")
            {
                if let Value::String(id) = value {
                    return id.clone();
                }
            }
        }
    }
    REGION_UNKNOWN.to_string()
}

/// Derive a privacy-safe chapter title from redacted attributes.
fn derive_title(attrs: Option<&BTreeMap<String, Value>>) -> Option<String> {
    let attrs = attrs?;
    for key in PROMPT_TITLE_KEYS {
        if let Some(Value::String(id)) = attrs.get(*key) {
            if !id.is_empty() {
                return Some(format!("Prompt {id}"));
            }
        }
    }
    for key in LABEL_TITLE_KEYS {
        if let Some(Value::String(label)) = attrs.get(*key) {
            if !label.is_empty() {
                return Some(label.clone());
            }
        }
    }
    None
}
