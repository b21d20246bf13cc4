//! Masking of secrets and personal data before anything reaches the audit log.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// Replacement for values under a sensitive key.
pub const REDACTED: &str = "[REDACTED]";

static SENSITIVE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(password|passwd|passphrase|secret|token|credential|api[_-]?key|private[_-]?key|access[_-]?key|(^|[_.-])key$)",
    )
    .expect("static regex")
});

static RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)\b(password|passwd|secret|token|api[_-]?key)\s*[=:]\s*[^\s,;&]+")
                .expect("static regex"),
            "$1=[REDACTED]",
        ),
        (
            Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").expect("static regex"),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r"\b(?:sk|pk|rk)-[A-Za-z0-9_-]{4,}").expect("static regex"),
            "[API_KEY]",
        ),
        (
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex"),
            "[EMAIL]",
        ),
        (
            Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").expect("static regex"),
            "[CARD]",
        ),
    ]
});

/// Whether a field name suggests the value is a secret.
///
/// Matches password, secret, token, credential and key-like names
/// (`api_key`, `private-key`, `key`, `db.key`), case-insensitively.
/// Names that merely contain "key" inside a word (`keyboard`, `monkey`)
/// do not match.
pub fn is_sensitive_name(name: &str) -> bool {
    SENSITIVE_NAME.is_match(name)
}

/// Mask secrets and personal data embedded in free text.
pub fn redact_text(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for (pattern, replacement) in RULES.iter() {
        if pattern.is_match(&out) {
            out = Cow::Owned(pattern.replace_all(&out, *replacement).into_owned());
        }
    }
    out
}
