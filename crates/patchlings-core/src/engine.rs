//! Engine facade
//!
//! Single-writer orchestrator for the ingestion pipeline. For each external
//! event in a batch: redact → turn-boundary flush → backpressure → dedup →
//! reduce; persistence operations are scheduled as they arise and settled
//! once at the end of the batch. Given equal inputs and salts, accepted
//! events, world state, and chapter summaries are byte-identical across
//! replays.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use tracing::{debug, warn};

use crate::backpressure::{summary_event, Admission, Aggregator, FlushedBucket};
use crate::chapter::{ChapterSummary, OpenChapter};
use crate::config::EngineOptions;
use crate::error::Result;
use crate::event::TelemetryEvent;
use crate::redact::Redactor;
use crate::reducer::Reducer;
use crate::salt::{hash_value, normalize_path, SaltManager, SaltsFile};
use crate::storage::{last_lines, recording_file_name, PendingWrites, Storage};
use crate::world::WorldState;

/// Result of one `ingest_batch` (or aggregate-flush) call.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Accepted events in delivery order, synthesized summaries included.
    pub accepted_events: Vec<TelemetryEvent>,
    /// Chapters closed during the batch, in close order.
    pub closed_chapters: Vec<ChapterSummary>,
    /// Low-value events folded into summary buckets this batch.
    pub dropped_low_value_events: u64,
    /// Duplicate events suppressed this batch.
    pub dropped_duplicate_events: u64,
    /// Snapshot of the world after the batch.
    pub world: WorldState,
}

#[derive(Debug, Default)]
struct BatchCtx {
    accepted: Vec<TelemetryEvent>,
    closed: Vec<ChapterSummary>,
    dropped_low_value: u64,
    dropped_duplicates: u64,
}

/// The telemetry ingestion engine. Exclusively owns the world document and
/// all open-chapter state; all methods must be called from a single serial
/// context.
#[derive(Debug)]
pub struct Engine {
    options: EngineOptions,
    storage: Storage,
    salts: SaltManager,
    redactor: Redactor,
    aggregator: Aggregator,
    reducer: Reducer,
    world: WorldState,
    open_chapters: BTreeMap<String, OpenChapter>,
    chapters: VecDeque<ChapterSummary>,
    pending: PendingWrites,
    patchlings_dir: PathBuf,
    story_dir: PathBuf,
    recordings_dir: PathBuf,
}

impl Engine {
    /// Create an engine: resolve salts, load (and normalize) any persisted
    /// world, and pull the most recent chapters back into memory.
    pub async fn create(options: EngineOptions) -> Result<Self> {
        let mut storage = Storage::new(options.storage);

        let patchlings_dir = options.workspace_root.join(&options.internal_dir);
        let story_dir = patchlings_dir.join("story");
        let recordings_dir = patchlings_dir.join("recordings");
        storage.create_dir_all(&patchlings_dir).await?;
        storage.create_dir_all(&story_dir).await?;
        storage.create_dir_all(&recordings_dir).await?;

        let created_at = options
            .fixed_created_at
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));

        let salts_path = patchlings_dir.join("salts.json");
        let persisted_salts = match storage.read(&salts_path).await? {
            Some(bytes) => match serde_json::from_slice::<SaltsFile>(&bytes) {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!(error = %err, "unreadable salts.json, regenerating");
                    None
                }
            },
            None => None,
        };
        let mut salts = SaltManager::new(persisted_salts, options.fixed_salts.as_ref(), &created_at);
        if salts.take_dirty() {
            let bytes = serde_json::to_vec_pretty(&salts.to_file())?;
            storage.write(&salts_path, &bytes).await?;
        }

        let workspace_path = normalize_path(&options.workspace_root.to_string_lossy());
        let workspace_id = hash_value(&workspace_path, salts.workspace_salt());

        let world_path = patchlings_dir.join("world.json");
        let mut world = match storage.read(&world_path).await? {
            Some(bytes) => match serde_json::from_slice::<WorldState>(&bytes) {
                Ok(world) => world,
                Err(err) => {
                    warn!(error = %err, "unreadable world.json, starting fresh");
                    WorldState::new(workspace_id.clone(), created_at.clone())
                }
            },
            None => WorldState::new(workspace_id.clone(), created_at.clone()),
        };
        world.normalize();
        // Rewrite immediately so the document on disk has the normalized
        // shape even if no batch ever arrives.
        storage.write(&world_path, &serde_json::to_vec_pretty(&world)?).await?;

        let chapters_path = patchlings_dir.join("chapters.ndjson");
        let mut chapters = VecDeque::new();
        if let Some(bytes) = storage.read(&chapters_path).await? {
            for line in last_lines(&bytes, options.max_chapters_in_memory) {
                match serde_json::from_str::<ChapterSummary>(&line) {
                    Ok(summary) => chapters.push_back(summary),
                    Err(err) => warn!(error = %err, "skipping unreadable chapter line"),
                }
            }
        }

        let threshold = options.events_per_sec_threshold;
        let redactor = Redactor::new(options.resolve_allow_content());
        let reducer = Reducer::new(threshold, salts.workspace_salt());

        debug!(
            workspace_id = %world.workspace_id,
            chapters_loaded = chapters.len(),
            "engine ready"
        );

        Ok(Self {
            options,
            storage,
            salts,
            redactor,
            aggregator: Aggregator::new(threshold),
            reducer,
            world,
            open_chapters: BTreeMap::new(),
            chapters,
            pending: PendingWrites::default(),
            patchlings_dir,
            story_dir,
            recordings_dir,
        })
    }

    /// Ingest a batch of validated external events.
    ///
    /// Never aborts on per-event issues: duplicates and folded events are
    /// counted and suppressed, and persistence failures are swallowed, so
    /// callers always get the accepted events and closed chapters.
    pub async fn ingest_batch(&mut self, events: Vec<TelemetryEvent>) -> Result<BatchResult> {
        let mut ctx = BatchCtx::default();
        for event in events {
            self.process_external(event, &mut ctx);
        }
        self.finish_batch(ctx).await
    }

    /// Force a terminal flush of buffered summaries for one run (adapters
    /// call this on stream EOF). Does not close an open chapter; callers
    /// wanting closure synthesize a terminal turn event.
    pub async fn flush_run_aggregates(&mut self, run_id: &str) -> Result<BatchResult> {
        let mut ctx = BatchCtx::default();
        let flushed = self.aggregator.flush_run(run_id);
        self.emit_summaries(run_id, flushed, &mut ctx);
        self.finish_batch(ctx).await
    }

    fn process_external(&mut self, mut event: TelemetryEvent, ctx: &mut BatchCtx) {
        let now = self.now();
        let run_salt = self.salts.run_salt(&event.run_id, &now);
        if let Some(attrs) = event.attrs.take() {
            event.attrs = Some(self.redactor.redact_attrs(
                &attrs,
                &run_salt,
                Some(self.salts.workspace_salt()),
            ));
        }

        // Chapter summaries must contain every synthesized summary
        // attributable to them, so boundaries force a full flush first.
        if event.is_turn_boundary() {
            let flushed = self.aggregator.flush_run(&event.run_id);
            self.emit_summaries(&event.run_id, flushed, ctx);
        }

        let millis = match event.ts_millis() {
            Ok(millis) => millis,
            Err(err) => {
                warn!(run_id = %event.run_id, seq = event.seq, error = %err, "skipping event with bad timestamp");
                return;
            }
        };
        let second = millis.div_euclid(1000);

        let observation = self.aggregator.observe(
            &event.run_id,
            second,
            event.kind,
            &event.name,
            &event.ts,
            event.is_low_value(),
        );
        self.emit_summaries(&event.run_id, observation.flushed, ctx);

        {
            let run = self.world.ensure_run(&event.run_id);
            if observation.events_this_second > run.peak_events_per_sec {
                run.peak_events_per_sec = observation.events_this_second;
            }
        }
        if let Some(chapter) = self.open_chapters.get_mut(&event.run_id) {
            if observation.events_this_second > chapter.peak_events_per_sec {
                chapter.peak_events_per_sec = observation.events_this_second;
            }
        }

        if observation.admission == Admission::Fold {
            self.world.counters.dropped_low_value_events += 1;
            self.world.ensure_run(&event.run_id).dropped_low_value_events += 1;
            if let Some(chapter) = self.open_chapters.get_mut(&event.run_id) {
                chapter.dropped_low_value += 1;
            }
            ctx.dropped_low_value += 1;
            return;
        }

        // Dedup on the upstream sequence, after backpressure acceptance.
        let upstream = event.upstream_seq();
        {
            let run = self.world.ensure_run(&event.run_id);
            if upstream <= run.last_upstream_seq {
                run.duplicate_events += 1;
                self.world.counters.duplicate_events += 1;
                ctx.dropped_duplicates += 1;
                return;
            }
            run.last_upstream_seq = upstream;
            if event.seq > run.internal_seq {
                run.internal_seq = event.seq;
            }
        }

        self.accept(event, ctx);
    }

    /// Synthesize, redact, and deliver summary events for flushed buckets.
    /// They bypass backpressure and dedup entirely.
    fn emit_summaries(&mut self, run_id: &str, flushed: Vec<FlushedBucket>, ctx: &mut BatchCtx) {
        let threshold = self.aggregator.threshold();
        for bucket in flushed {
            let (seq, upstream) = {
                let run = self.world.ensure_run(run_id);
                (run.next_internal_seq(), run.last_upstream_seq)
            };
            let mut event = summary_event(run_id, &bucket, seq, upstream, threshold);

            let now = self.now();
            let run_salt = self.salts.run_salt(run_id, &now);
            if let Some(attrs) = event.attrs.take() {
                event.attrs = Some(self.redactor.redact_attrs(
                    &attrs,
                    &run_salt,
                    Some(self.salts.workspace_salt()),
                ));
            }

            self.world.counters.backpressure_summaries += 1;
            if let Some(chapter) = self.open_chapters.get_mut(run_id) {
                chapter.summaries_emitted += 1;
            }

            self.accept(event, ctx);
        }
    }

    /// Deliver an event to the reducer and record the outcome.
    fn accept(&mut self, event: TelemetryEvent, ctx: &mut BatchCtx) {
        let closed = self
            .reducer
            .reduce(&mut self.world, &mut self.open_chapters, &event);
        for summary in closed {
            self.record_closed(summary, ctx);
        }

        if self.options.record_telemetry {
            self.schedule_recording(&event);
        }
        ctx.accepted.push(event);
    }

    fn record_closed(&mut self, summary: ChapterSummary, ctx: &mut BatchCtx) {
        match serde_json::to_vec(&summary) {
            Ok(mut line) => {
                line.push(b'\n');
                self.pending
                    .schedule_append(self.patchlings_dir.join("chapters.ndjson"), line);
            }
            Err(err) => warn!(chapter_id = %summary.chapter_id, error = %err, "chapter serialize failed"),
        }

        self.chapters.push_back(summary.clone());
        while self.chapters.len() > self.options.max_chapters_in_memory {
            self.chapters.pop_front();
        }
        ctx.closed.push(summary);
    }

    fn schedule_recording(&mut self, event: &TelemetryEvent) {
        let line = match serde_json::to_vec(event) {
            Ok(mut line) => {
                line.push(b'\n');
                line
            }
            Err(err) => {
                warn!(run_id = %event.run_id, error = %err, "recording serialize failed");
                return;
            }
        };

        let max_bytes = self.options.max_recording_bytes;
        let run = self.world.ensure_run(&event.run_id);
        if run.recording_bytes > 0 && run.recording_bytes + line.len() as u64 > max_bytes {
            run.recording_index += 1;
            run.recording_bytes = 0;
        }
        run.recording_bytes += line.len() as u64;
        let file = recording_file_name(&event.run_id, run.recording_index);
        self.pending
            .schedule_append(self.recordings_dir.join(file), line);
    }

    async fn finish_batch(&mut self, ctx: BatchCtx) -> Result<BatchResult> {
        if self.salts.take_dirty() {
            match serde_json::to_vec_pretty(&self.salts.to_file()) {
                Ok(bytes) => self
                    .pending
                    .schedule_overwrite(self.patchlings_dir.join("salts.json"), bytes),
                Err(err) => warn!(error = %err, "salts serialize failed"),
            }
        }

        match serde_json::to_vec_pretty(&self.world) {
            Ok(bytes) => self
                .pending
                .schedule_overwrite(self.patchlings_dir.join("world.json"), bytes),
            Err(err) => warn!(error = %err, "world serialize failed"),
        }

        let failures = self.pending.settle(&mut self.storage).await;
        if failures > 0 {
            debug!(failures, "batch settled with persistence failures");
        }

        Ok(BatchResult {
            accepted_events: ctx.accepted,
            closed_chapters: ctx.closed,
            dropped_low_value_events: ctx.dropped_low_value,
            dropped_duplicate_events: ctx.dropped_duplicates,
            world: self.world.clone(),
        })
    }

    fn now(&self) -> String {
        self.options
            .fixed_created_at
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// The current world document.
    #[must_use]
    pub fn get_world(&self) -> &WorldState {
        &self.world
    }

    /// The most recent chapters in close order, newest last.
    #[must_use]
    pub fn get_chapters(&self, limit: Option<usize>) -> Vec<ChapterSummary> {
        let limit = limit.unwrap_or(self.chapters.len());
        let start = self.chapters.len().saturating_sub(limit);
        self.chapters.iter().skip(start).cloned().collect()
    }

    /// The most recent chapters for one run, close order, newest last.
    #[must_use]
    pub fn get_chapters_by_run(&self, run_id: &str, limit: Option<usize>) -> Vec<ChapterSummary> {
        let matching: Vec<ChapterSummary> = self
            .chapters
            .iter()
            .filter(|chapter| chapter.run_id == run_id)
            .cloned()
            .collect();
        let limit = limit.unwrap_or(matching.len());
        let start = matching.len().saturating_sub(limit);
        matching[start..].to_vec()
    }

    /// The workspace salt.
    #[must_use]
    pub fn get_workspace_salt(&self) -> &str {
        self.salts.workspace_salt()
    }

    /// The salt for a run, minted on first request and persisted at the next
    /// batch boundary.
    pub fn get_run_salt(&mut self, run_id: &str) -> String {
        let now = self.now();
        self.salts.run_salt(run_id, &now)
    }

    /// The workspace-local internal directory.
    #[must_use]
    pub fn get_patchlings_dir(&self) -> &Path {
        &self.patchlings_dir
    }

    /// The story output directory used by renderers.
    #[must_use]
    pub fn get_story_dir(&self) -> &Path {
        &self.story_dir
    }

    /// The recordings directory.
    #[must_use]
    pub fn get_recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }
}
