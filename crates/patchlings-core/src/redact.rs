//! Attribute redactor
//!
//! Pure transform over event attributes, parameterized by the run salt and
//! (optionally) the workspace salt. The redactor never returns raw secret
//! values; path-like attributes leave only salted hashes behind.
//!
//! Rules apply per key, in order:
//!
//! 1. keys matching the secret set are dropped unconditionally
//! 2. already-hashed keys (`*_hash`) pass through
//! 3. content keys are dropped unless allow-content is enabled
//! 4. path-like keys are replaced by `{key}_hash`/`{key}_dir_hash` (run salt)
//!    and `{key}_stable_hash`/`{key}_stable_dir_hash` (workspace salt)
//! 5. remaining primitive scalars pass through; nested values are dropped

use std::collections::BTreeMap;

use serde_json::Value;

use crate::salt::{hash_dir, hash_path};

/// Key-name fragments that are always rejected, regardless of allow-content.
const SECRET_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "secret",
    "authorization",
    "cookie",
    "header",
    "password",
    "api_key",
    "api-key",
    "apikey",
    "session",
];

/// Keys whose values are free-form content, dropped unless allow-content.
const CONTENT_KEYS: &[&str] = &[
    "prompt", "content", "body", "payload", "stdin", "stdout", "stderr", "command", "args",
    "arg", "diff", "patch",
];

/// Keys whose string values are filesystem paths.
const PATH_KEYS: &[&str] = &[
    "path",
    "file",
    "file_name",
    "cwd",
    "workspace",
    "repo",
    "target",
    "source",
];

/// Whether a key name belongs to the always-redact set.
#[must_use]
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

fn is_primitive(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Attribute redactor.
#[derive(Debug, Clone, Copy)]
pub struct Redactor {
    allow_content: bool,
}

impl Redactor {
    /// Create a redactor; `allow_content` is fixed for the engine's lifetime.
    #[must_use]
    pub fn new(allow_content: bool) -> Self {
        Self { allow_content }
    }

    /// Whether content keys and raw paths survive redaction.
    #[must_use]
    pub fn allow_content(&self) -> bool {
        self.allow_content
    }

    /// Redact an attribute map into its safe form.
    #[must_use]
    pub fn redact_attrs(
        &self,
        attrs: &BTreeMap<String, Value>,
        run_salt: &str,
        workspace_salt: Option<&str>,
    ) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();

        for (key, value) in attrs {
            let lower = key.to_ascii_lowercase();

            if is_secret_key(key) {
                continue;
            }

            if lower.contains("_hash") {
                if is_primitive(value) {
                    out.insert(key.clone(), value.clone());
                }
                continue;
            }

            if CONTENT_KEYS.contains(&lower.as_str()) && !self.allow_content {
                continue;
            }

            if PATH_KEYS.contains(&lower.as_str()) {
                if let Value::String(path) = value {
                    out.insert(format!("{key}_hash"), Value::String(hash_path(path, run_salt)));
                    out.insert(
                        format!("{key}_dir_hash"),
                        Value::String(hash_dir(path, run_salt)),
                    );
                    if let Some(stable_salt) = workspace_salt {
                        out.insert(
                            format!("{key}_stable_hash"),
                            Value::String(hash_path(path, stable_salt)),
                        );
                        out.insert(
                            format!("{key}_stable_dir_hash"),
                            Value::String(hash_dir(path, stable_salt)),
                        );
                    }
                    if self.allow_content {
                        out.insert(key.clone(), value.clone());
                    }
                    continue;
                }
            }

            if is_primitive(value) {
                out.insert(key.clone(), value.clone());
            }
        }

        out
    }
}
