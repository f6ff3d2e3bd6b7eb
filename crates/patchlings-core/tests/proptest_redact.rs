//! Property-based tests for the redactor.
//!
//! Verifies the redaction invariants:
//! - Idempotence: redacting twice with the same salts equals redacting once
//! - Never-leak: secret-matching input keys never appear in the output
//! - Content gating: content keys survive only under allow-content
//! - Path stability: `*_stable_hash` agrees across run salts, `*_hash` does not
//! - Equivalent path spellings hash identically

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use patchlings_core::redact::{is_secret_key, Redactor};
use patchlings_core::salt::hash_path;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_plain_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,12}"
}

fn arb_secret_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("token".to_string()),
        Just("api_key".to_string()),
        Just("Authorization".to_string()),
        Just("session_id".to_string()),
        Just("x-header-trace".to_string()),
        Just("COOKIE".to_string()),
        Just("db_password".to_string()),
    ]
}

fn arb_path_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("path".to_string()),
        Just("file".to_string()),
        Just("cwd".to_string()),
        Just("repo".to_string()),
    ]
}

fn arb_primitive() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,24}".prop_map(Value::from),
        Just(Value::Null),
    ]
}

fn arb_nested() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(json!({"inner": 1})),
        Just(json!([1, 2, 3])),
    ]
}

fn arb_attrs() -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map(
        prop_oneof![arb_plain_key(), arb_secret_key(), arb_path_key()],
        prop_oneof![arb_primitive(), arb_nested()],
        0..12,
    )
}

fn arb_rel_path() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}", 1..4).prop_map(|segments| segments.join("/"))
}

// ────────────────────────────────────────────────────────────────────
// Invariants
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Redaction is idempotent for both allow-content settings.
    #[test]
    fn prop_redaction_idempotent(attrs in arb_attrs(), allow in any::<bool>()) {
        let redactor = Redactor::new(allow);
        let once = redactor.redact_attrs(&attrs, "run-salt", Some("workspace-salt"));
        let twice = redactor.redact_attrs(&once, "run-salt", Some("workspace-salt"));
        prop_assert_eq!(once, twice);
    }

    /// No output key equals a secret-matching input key, case-insensitively,
    /// regardless of allow-content.
    #[test]
    fn prop_never_leak_secret_keys(attrs in arb_attrs(), allow in any::<bool>()) {
        let redactor = Redactor::new(allow);
        let out = redactor.redact_attrs(&attrs, "run-salt", Some("workspace-salt"));
        for key in attrs.keys().filter(|key| is_secret_key(key)) {
            let lower = key.to_ascii_lowercase();
            prop_assert!(
                !out.keys().any(|produced| produced.to_ascii_lowercase() == lower),
                "secret key {key:?} leaked"
            );
        }
    }

    /// Nested values never survive redaction.
    #[test]
    fn prop_no_nested_values_survive(attrs in arb_attrs(), allow in any::<bool>()) {
        let redactor = Redactor::new(allow);
        let out = redactor.redact_attrs(&attrs, "run-salt", Some("workspace-salt"));
        for value in out.values() {
            prop_assert!(!matches!(value, Value::Object(_) | Value::Array(_)));
        }
    }

    /// Content keys are dropped without allow-content.
    #[test]
    fn prop_content_gated(value in "[ -~]{0,32}") {
        let attrs: BTreeMap<String, Value> =
            [("stdout".to_string(), Value::from(value))].into();
        let closed = Redactor::new(false).redact_attrs(&attrs, "rs", None);
        prop_assert!(closed.is_empty());
    }

    /// Stable hashes agree across run salts; run hashes differ.
    #[test]
    fn prop_stable_hash_survives_run_salt_change(path in arb_rel_path()) {
        let attrs: BTreeMap<String, Value> =
            [("path".to_string(), Value::from(path))].into();
        let redactor = Redactor::new(false);
        let run_a = redactor.redact_attrs(&attrs, "salt-a", Some("workspace-salt"));
        let run_b = redactor.redact_attrs(&attrs, "salt-b", Some("workspace-salt"));
        prop_assert_eq!(run_a.get("path_stable_hash"), run_b.get("path_stable_hash"));
        prop_assert_eq!(run_a.get("path_stable_dir_hash"), run_b.get("path_stable_dir_hash"));
        prop_assert_ne!(run_a.get("path_hash"), run_b.get("path_hash"));
    }

    /// `./a/b` and `a/b` are the same path to the hasher.
    #[test]
    fn prop_equivalent_path_spellings(path in arb_rel_path(), salt in "[a-z]{4,12}") {
        let dotted = format!("./{path}");
        prop_assert_eq!(hash_path(&dotted, &salt), hash_path(&path, &salt));
        let doubled = path.replace('/', "//");
        prop_assert_eq!(hash_path(&doubled, &salt), hash_path(&path, &salt));
    }
}
