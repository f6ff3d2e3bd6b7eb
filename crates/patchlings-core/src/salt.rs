//! Salt management and salted identity hashing
//!
//! Identifiers in the world document are truncated salted SHA-256 digests:
//! stable across restarts (workspace salt persists), isolated across runs
//! (each run gets its own salt). Operators may pin salts to reproduce
//! identifiers across machines; test fixtures rely on this.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
const HASH_LEN: usize = 12;

/// Region id used when a file event carries no directory hash.
pub const REGION_UNKNOWN: &str = "region.unknown";

/// Hash a value under a salt: first 12 hex chars of `sha256(salt || "|" || value)`.
#[must_use]
pub fn hash_value(value: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"|");
    hasher.update(value.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Normalize a path for hashing: forward slashes, no redundant segments.
///
/// `./a/b`, `a//b`, and `a/./b` all normalize to `a/b`; `..` resolves
/// lexically. An empty result becomes `.`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let absolute = forward.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in forward.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// The directory portion of a normalized path: final segment removed, `.`
/// when nothing remains.
#[must_use]
pub fn parent_dir(normalized: &str) -> String {
    match normalized.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Hash a path under a salt after normalization.
#[must_use]
pub fn hash_path(path: &str, salt: &str) -> String {
    hash_value(&normalize_path(path), salt)
}

/// Hash the directory of a path under a salt.
#[must_use]
pub fn hash_dir(path: &str, salt: &str) -> String {
    hash_value(&parent_dir(&normalize_path(path)), salt)
}

/// A minted run salt plus its mint timestamp, as persisted in `salts.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSaltRecord {
    pub salt: String,
    pub created_at: String,
}

/// On-disk shape of `salts.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaltsFile {
    pub workspace_salt: String,
    #[serde(default)]
    pub runs: BTreeMap<String, RunSaltRecord>,
}

/// Owns the workspace salt and the run-id → run-salt mapping.
///
/// Construction order: pinned salts verbatim, else the persisted file, else a
/// fresh random workspace salt. Run salts mint lazily on first request; the
/// engine persists at batch boundaries when [`SaltManager::take_dirty`]
/// reports unflushed mints.
#[derive(Debug)]
pub struct SaltManager {
    workspace_salt: String,
    runs: BTreeMap<String, RunSaltRecord>,
    dirty: bool,
}

impl SaltManager {
    /// Build from an optional persisted file and optional pinned salts.
    pub fn new(
        persisted: Option<SaltsFile>,
        fixed: Option<&crate::config::FixedSalts>,
        created_at: &str,
    ) -> Self {
        if let Some(fixed) = fixed {
            let runs = fixed
                .run_salts
                .iter()
                .map(|(run_id, salt)| {
                    (
                        run_id.clone(),
                        RunSaltRecord {
                            salt: salt.clone(),
                            created_at: created_at.to_string(),
                        },
                    )
                })
                .collect();
            return Self {
                workspace_salt: fixed.workspace_salt.clone(),
                runs,
                dirty: false,
            };
        }

        if let Some(file) = persisted {
            if !file.workspace_salt.is_empty() {
                return Self {
                    workspace_salt: file.workspace_salt,
                    runs: file.runs,
                    dirty: false,
                };
            }
        }

        Self {
            workspace_salt: generate_salt(),
            runs: BTreeMap::new(),
            dirty: true,
        }
    }

    /// The long-lived workspace salt.
    #[must_use]
    pub fn workspace_salt(&self) -> &str {
        &self.workspace_salt
    }

    /// The salt for a run, minting one on first request.
    pub fn run_salt(&mut self, run_id: &str, created_at: &str) -> String {
        if let Some(record) = self.runs.get(run_id) {
            return record.salt.clone();
        }
        let record = RunSaltRecord {
            salt: generate_salt(),
            created_at: created_at.to_string(),
        };
        let salt = record.salt.clone();
        self.runs.insert(run_id.to_string(), record);
        self.dirty = true;
        salt
    }

    /// Whether unflushed mints exist; clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn to_file(&self) -> SaltsFile {
        SaltsFile {
            workspace_salt: self.workspace_salt.clone(),
            runs: self.runs.clone(),
        }
    }
}

/// 16 random bytes, hex-encoded.
fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixedSalts;

    #[test]
    fn hash_is_salted_and_truncated() {
        let a = hash_value("src/a.ts", "salt-1");
        let b = hash_value("src/a.ts", "salt-2");
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert_eq!(a, hash_value("src/a.ts", "salt-1"));
    }

    #[test]
    fn path_normalization_collapses_redundancy() {
        assert_eq!(normalize_path("./a/b"), "a/b");
        assert_eq!(normalize_path("a//b"), "a/b");
        assert_eq!(normalize_path("a/./b"), "a/b");
        assert_eq!(normalize_path("a/c/../b"), "a/b");
        assert_eq!(normalize_path("a\\b"), "a/b");
        assert_eq!(normalize_path("."), ".");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/a/b"), "/a/b");
    }

    #[test]
    fn dir_hash_uses_parent_segment() {
        assert_eq!(parent_dir("a/b"), "a");
        assert_eq!(parent_dir("a"), ".");
        assert_eq!(parent_dir("/a"), "/");
        assert_eq!(hash_dir("src/a.ts", "s"), hash_value("src", "s"));
        assert_eq!(hash_dir("a.ts", "s"), hash_value(".", "s"));
    }

    #[test]
    fn equivalent_paths_hash_equal() {
        assert_eq!(hash_path("./a/b", "s"), hash_path("a/b", "s"));
    }

    #[test]
    fn fixed_salts_used_verbatim() {
        let fixed = FixedSalts {
            workspace_salt: "workspace-salt".to_string(),
            run_salts: [("run-1".to_string(), "run-salt".to_string())].into(),
        };
        let mut manager = SaltManager::new(None, Some(&fixed), "t0");
        assert_eq!(manager.workspace_salt(), "workspace-salt");
        assert_eq!(manager.run_salt("run-1", "t0"), "run-salt");
        assert!(!manager.take_dirty());
    }

    #[test]
    fn persisted_salts_survive_reload() {
        let mut manager = SaltManager::new(None, None, "t0");
        let run_salt = manager.run_salt("run-1", "t0");
        assert!(manager.take_dirty());

        let reloaded = SaltManager::new(Some(manager.to_file()), None, "t1");
        assert_eq!(reloaded.workspace_salt(), manager.workspace_salt());
        assert_eq!(reloaded.runs.get("run-1").unwrap().salt, run_salt);
    }

    #[test]
    fn mint_is_lazy_and_sticky() {
        let mut manager = SaltManager::new(None, None, "t0");
        let first = manager.run_salt("run-9", "t0");
        let second = manager.run_salt("run-9", "t1");
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }
}
