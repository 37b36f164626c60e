//! Secret redaction for persisted records.
//!
//! Anything that looks like a credential is replaced with [`PLACEHOLDER`]
//! before it reaches disk. Callers learn whether anything was replaced so
//! the record can carry a `redacted` flag.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Fixed replacement for secret-looking substrings.
pub const PLACEHOLDER: &str = "[REDACTED]";

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let rules: &[(&str, &'static str)] = &[
        (
            r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.+?-----END [A-Z ]*PRIVATE KEY-----",
            PLACEHOLDER,
        ),
        (r"(?i)bearer\s+[A-Za-z0-9._~+/=\-]{16,}", PLACEHOLDER),
        (r"sk-[A-Za-z0-9_\-]{12,}", PLACEHOLDER),
        (r"ghp_[A-Za-z0-9]{20,}", PLACEHOLDER),
        (r"AKIA[0-9A-Z]{16}", PLACEHOLDER),
        (
            r"(?i)\b(api[_-]?key|apikey|password|passwd|pwd|token|secret)(\s*[=:]\s*)[^\s,;]{6,}",
            "$1$2[REDACTED]",
        ),
        (r"\b[A-Za-z0-9_\-]{40,}\b", PLACEHOLDER),
    ];
    rules
        .iter()
        .filter_map(|&(pattern, replacement)| match Regex::new(pattern) {
            Ok(pattern) => Some(Rule {
                pattern,
                replacement,
            }),
            Err(e) => {
                tracing::error!(pattern = %pattern, error = %e, "Invalid redaction pattern");
                None
            }
        })
        .collect()
});

/// Redact a single string. Returns the cleaned text and whether it changed.
pub fn redact_text(input: &str) -> (String, bool) {
    let mut out = input.to_string();
    let mut changed = false;
    for rule in RULES.iter() {
        let replaced = rule.pattern.replace_all(&out, rule.replacement);
        if replaced != out {
            changed = true;
            out = replaced.into_owned();
        }
    }
    (out, changed)
}

/// Redact every string inside a JSON value in place.
///
/// Object keys are left alone; only values are inspected.
pub fn redact_value(value: &mut Value) -> bool {
    match value {
        Value::String(s) => {
            let (clean, changed) = redact_text(s);
            if changed {
                *s = clean;
            }
            changed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, item| redact_value(item) || acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, item| redact_value(item) || acc),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}
