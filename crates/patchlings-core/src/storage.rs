//! Persistence layer
//!
//! Two backends behind one interface: real files under the workspace-local
//! internal directory, or an in-memory file map for tests and demo adapters.
//!
//! Writers never block the reducer: batch processing schedules operations
//! into a [`PendingWrites`] queue, and the engine settles the queue once per
//! batch. Operations apply sequentially in schedule order, which preserves
//! append ordering per file; individual failures are logged and swallowed so
//! persistence trouble never poisons the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::StorageMode;
use crate::error::Result;

/// Storage backend: real filesystem or an in-memory file map.
#[derive(Debug)]
pub struct Storage {
    mode: StorageMode,
    memory: BTreeMap<PathBuf, Vec<u8>>,
}

impl Storage {
    /// Create a backend for the given mode.
    #[must_use]
    pub fn new(mode: StorageMode) -> Self {
        Self {
            mode,
            memory: BTreeMap::new(),
        }
    }

    /// The backend mode.
    #[must_use]
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Read a file fully; `None` when it does not exist.
    pub async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match self.mode {
            StorageMode::Memory => Ok(self.memory.get(path).cloned()),
            StorageMode::Fs => match tokio::fs::read(path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Overwrite a file, creating parent directories as needed.
    pub async fn write(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        match self.mode {
            StorageMode::Memory => {
                self.memory.insert(path.to_path_buf(), bytes.to_vec());
                Ok(())
            }
            StorageMode::Fs => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, bytes).await?;
                Ok(())
            }
        }
    }

    /// Append bytes to a file, creating it (and parents) as needed.
    pub async fn append(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        match self.mode {
            StorageMode::Memory => {
                self.memory
                    .entry(path.to_path_buf())
                    .or_default()
                    .extend_from_slice(bytes);
                Ok(())
            }
            StorageMode::Fs => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(bytes).await?;
                file.flush().await?;
                Ok(())
            }
        }
    }

    /// Ensure a directory exists (no-op for the memory backend).
    pub async fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        if self.mode == StorageMode::Fs {
            tokio::fs::create_dir_all(path).await?;
        }
        Ok(())
    }
}

/// One scheduled persistence operation.
#[derive(Debug)]
enum WriteOp {
    Overwrite { path: PathBuf, bytes: Vec<u8> },
    Append { path: PathBuf, bytes: Vec<u8> },
}

/// Fire-and-forget write queue, settled once per batch.
#[derive(Debug, Default)]
pub struct PendingWrites {
    ops: Vec<WriteOp>,
}

impl PendingWrites {
    /// Schedule a full-file rewrite.
    pub fn schedule_overwrite(&mut self, path: PathBuf, bytes: Vec<u8>) {
        self.ops.push(WriteOp::Overwrite { path, bytes });
    }

    /// Schedule an append.
    pub fn schedule_append(&mut self, path: PathBuf, bytes: Vec<u8>) {
        self.ops.push(WriteOp::Append { path, bytes });
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply all queued operations in order. Failures are logged and
    /// counted, never propagated. Failed appends stay queued so the next
    /// batch retries them in order; failed overwrites are dropped because
    /// every batch schedules a fresh rewrite of those files anyway.
    pub async fn settle(&mut self, storage: &mut Storage) -> usize {
        let mut failures = 0usize;
        let mut retained = Vec::new();
        let mut stalled: std::collections::BTreeSet<PathBuf> = std::collections::BTreeSet::new();

        for op in self.ops.drain(..) {
            // Once an append to a file fails, later appends to the same file
            // are held back too, so the line order on disk never changes.
            if let WriteOp::Append { path, .. } = &op {
                if stalled.contains(path) {
                    retained.push(op);
                    continue;
                }
            }

            let outcome = match &op {
                WriteOp::Overwrite { path, bytes } => storage.write(path, bytes).await,
                WriteOp::Append { path, bytes } => storage.append(path, bytes).await,
            };
            if let Err(err) = outcome {
                let path = match &op {
                    WriteOp::Overwrite { path, .. } | WriteOp::Append { path, .. } => path,
                };
                warn!(path = %path.display(), error = %err, "persistence write failed");
                failures += 1;
                if let WriteOp::Append { path, .. } = &op {
                    stalled.insert(path.clone());
                    retained.push(op);
                }
            }
        }
        self.ops = retained;
        failures
    }
}

/// Make a run id safe for use in a file name.
#[must_use]
pub fn sanitize_run_id(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Recording file name for a run at a rotation index.
#[must_use]
pub fn recording_file_name(run_id: &str, index: u32) -> String {
    let safe = sanitize_run_id(run_id);
    if index == 0 {
        format!("{safe}.jsonl")
    } else {
        format!("{safe}-{index}.jsonl")
    }
}

/// The last `n` non-empty lines of a text file's contents.
#[must_use]
pub fn last_lines(data: &[u8], n: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(data);
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|line| (*line).to_string()).collect()
}
