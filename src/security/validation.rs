//! Input validation: size limit, pattern blocklist and per-kind checks.
//!
//! Validation never fails with an `Err`. Every problem found is reported as
//! a [`ValidationError`] inside the [`ValidationResult`], together with a
//! sanitized copy of the input that has blocked substrings and control
//! characters removed. The caller's input is never modified.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

use super::policy::{PolicyError, ValidationPolicy};

const MAX_PATH_LENGTH: usize = 4096;
const MAX_CONFIG_DEPTH: usize = 32;
const MAX_SANITIZE_PASSES: usize = 8;

/// Absolute locations that no caller-supplied path may point into.
const SYSTEM_ROOTS: &[&str] = &["/etc", "/proc", "/sys", "/dev", "/boot"];

/// Keys that enable prototype pollution in consumers that merge configs.
const FORBIDDEN_CONFIG_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Which type-specific validator to run after the generic checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    None,
    Path,
    Config,
    Template,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputKind::None => "none",
            InputKind::Path => "path",
            InputKind::Config => "config",
            InputKind::Template => "template",
        })
    }
}

/// Options for one validation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    pub kind: InputKind,
    /// Free-text label carried into audit entries.
    pub context: String,
}

impl ValidationOptions {
    pub fn new(kind: InputKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    TooLarge,
    BlockedPattern,
    InvalidPath,
    InvalidConfig,
    InvalidTemplate,
}

/// One validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    /// Input with blocked substrings and control characters removed.
    pub sanitized: String,
}

impl ValidationResult {
    /// Result for validation that was skipped (policy disabled).
    pub fn pass(input: &str) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            sanitized: input.to_string(),
        }
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }
}

/// Compiled form of a [`ValidationPolicy`].
#[derive(Debug, Clone)]
pub struct Validator {
    max_size: usize,
    blocked: Vec<Regex>,
}

impl Validator {
    pub fn new(policy: &ValidationPolicy) -> Result<Self, PolicyError> {
        let blocked = policy
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| PolicyError::BadPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_size: policy.max_size,
            blocked,
        })
    }

    pub fn validate(&self, input: &str, options: &ValidationOptions) -> ValidationResult {
        let mut errors = Vec::new();

        if input.len() > self.max_size {
            errors.push(ValidationError::new(
                ValidationErrorKind::TooLarge,
                format!(
                    "input is {} bytes, limit is {}",
                    input.len(),
                    self.max_size
                ),
            ));
        }

        for pattern in &self.blocked {
            if pattern.is_match(input) {
                errors.push(ValidationError::new(
                    ValidationErrorKind::BlockedPattern,
                    format!("input matches blocked pattern `{}`", pattern.as_str()),
                ));
            }
        }

        match options.kind {
            InputKind::None => {}
            InputKind::Path => validate_path(input, &mut errors),
            InputKind::Config => validate_config(input, &mut errors),
            InputKind::Template => validate_template(input, &mut errors),
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            sanitized: self.sanitize(input),
        }
    }

    /// Remove every blocked match until none remain, then control characters.
    pub fn sanitize(&self, input: &str) -> String {
        let mut out = input.to_string();
        for _ in 0..MAX_SANITIZE_PASSES {
            let mut changed = false;
            for pattern in &self.blocked {
                if pattern.is_match(&out) {
                    out = pattern.replace_all(&out, "").into_owned();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        out.retain(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'));
        out
    }
}

fn validate_path(input: &str, errors: &mut Vec<ValidationError>) {
    let mut fail = |message: String| {
        errors.push(ValidationError::new(ValidationErrorKind::InvalidPath, message));
    };

    if input.trim().is_empty() {
        fail("path is empty".to_string());
        return;
    }
    if input.len() > MAX_PATH_LENGTH {
        fail(format!("path exceeds {} bytes", MAX_PATH_LENGTH));
    }
    if input.contains('\0') {
        fail("path contains a null byte".to_string());
    }
    if input.starts_with('~') {
        fail("home-relative paths are not allowed".to_string());
    }

    let normalized = input.replace('\\', "/");
    let path = Path::new(&normalized);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        fail("path traversal (`..`) is not allowed".to_string());
    }
    if path.is_absolute() {
        for root in SYSTEM_ROOTS {
            if path.starts_with(root) {
                fail(format!("path points into system directory {}", root));
            }
        }
    }
}

fn validate_config(input: &str, errors: &mut Vec<ValidationError>) {
    let mut fail = |message: String| {
        errors.push(ValidationError::new(
            ValidationErrorKind::InvalidConfig,
            message,
        ));
    };

    let Some(value) = parse_config(input) else {
        fail("not a YAML, JSON or TOML mapping".to_string());
        return;
    };

    let mut problems = Vec::new();
    walk_config(&value, 1, "", &mut problems);
    for problem in problems {
        fail(problem);
    }
}

/// Parse a structured document whose top level is a mapping.
pub(crate) fn parse_config(input: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(input)
        && value.is_mapping()
    {
        return serde_json::to_value(value).ok();
    }
    let table = toml::from_str::<toml::Table>(input).ok()?;
    serde_json::to_value(table).ok()
}

fn walk_config(value: &serde_json::Value, depth: usize, path: &str, problems: &mut Vec<String>) {
    if depth > MAX_CONFIG_DEPTH {
        problems.push(format!("nesting deeper than {} levels", MAX_CONFIG_DEPTH));
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                if FORBIDDEN_CONFIG_KEYS.contains(&key.as_str()) {
                    problems.push(format!("forbidden key `{}`", child_path));
                }
                walk_config(child, depth + 1, &child_path, problems);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk_config(child, depth + 1, &format!("{}[{}]", path, i), problems);
            }
        }
        _ => {}
    }
}

fn validate_template(input: &str, errors: &mut Vec<ValidationError>) {
    let mut fail = |message: String| {
        errors.push(ValidationError::new(
            ValidationErrorKind::InvalidTemplate,
            message,
        ));
    };

    if input.contains("{%") || input.contains("%}") {
        fail("template control blocks are not allowed".to_string());
    }

    let mut rest = input;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            fail("unterminated `{{` placeholder".to_string());
            return;
        };
        let name = after[..close].trim();
        let valid_name = !name.is_empty()
            && name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid_name {
            fail(format!(
                "placeholder `{{{{{}}}}}` must be a plain variable name",
                name
            ));
        }
        rest = &after[close + 2..];
    }
    if rest.contains("}}") {
        fail("unmatched `}}`".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{SecurityMode, SecurityPolicy};

    fn validator() -> Validator {
        Validator::new(&SecurityPolicy::mode_defaults(SecurityMode::Standard).validation).unwrap()
    }

    fn path(input: &str) -> ValidationResult {
        validator().validate(input, &ValidationOptions::new(InputKind::Path, "test"))
    }

    #[test]
    fn traversal_path_rejected() {
        let result = path("../../etc/passwd");
        assert!(!result.valid);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.kind == ValidationErrorKind::InvalidPath)
        );
    }

    #[test]
    fn relative_config_path_accepted() {
        let result = path("config/settings.yaml");
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.sanitized, "config/settings.yaml");
    }

    #[test]
    fn system_and_home_paths_rejected() {
        assert!(!path("/etc/shadow").valid);
        assert!(!path("/proc/self/environ").valid);
        assert!(!path("~/.ssh/id_rsa").valid);
        assert!(!path("").valid);
        assert!(path("/srv/app/config.yaml").valid);
        // "/etcetera" is not inside /etc
        assert!(path("/etcetera/file").valid);
    }

    #[test]
    fn oversized_input_rejected() {
        let mut policy = SecurityPolicy::mode_defaults(SecurityMode::Standard).validation;
        policy.max_size = 8;
        let v = Validator::new(&policy).unwrap();
        let result = v.validate("123456789", &ValidationOptions::default());
        assert!(!result.valid);
        assert_eq!(result.errors[0].kind, ValidationErrorKind::TooLarge);
    }

    #[test]
    fn blocklist_catches_scripts_and_sql() {
        let v = validator();
        let opts = ValidationOptions::default();
        assert!(!v.validate("<script>alert(1)</script>", &opts).valid);
        assert!(!v.validate("1 UNION SELECT password FROM users", &opts).valid);
        assert!(!v.validate("name'; DROP TABLE users; --", &opts).valid);
        assert!(!v.validate("${jndi:ldap://x}", &opts).valid);
        assert!(v.validate("an ordinary sentence", &opts).valid);
    }

    #[test]
    fn sanitized_copy_strips_blocked_content() {
        let v = validator();
        let input = "hello <script>x</script>\u{7} world";
        let result = v.validate(input, &ValidationOptions::default());
        assert!(!result.valid);
        assert!(!result.sanitized.contains("<script"));
        assert!(!result.sanitized.contains('\u{7}'));
        assert!(result.sanitized.starts_with("hello "));
        // caller's input untouched
        assert!(input.contains("<script>"));
    }

    #[test]
    fn sanitize_repeats_until_stable() {
        let v = validator();
        // Removing the inner "../" exposes another one.
        let out = v.sanitize("..././file");
        assert!(!out.contains("../"));
    }

    #[test]
    fn config_kind_checks_structure() {
        let v = validator();
        let opts = ValidationOptions::new(InputKind::Config, "cfg");
        assert!(v.validate("server:\n  port: 8080\n", &opts).valid);
        assert!(v.validate("[server]\nport = 8080\n", &opts).valid);
        assert!(v.validate(r#"{"server": {"port": 8080}}"#, &opts).valid);
        assert!(!v.validate("just a string", &opts).valid);

        let polluted = v.validate(r#"{"a": {"__proto__": {"admin": true}}}"#, &opts);
        assert!(!polluted.valid);
        assert!(polluted.errors[0].message.contains("a.__proto__"));
    }

    #[test]
    fn config_depth_limited() {
        let v = validator();
        let deep = format!("{}1{}", "[".repeat(40), "]".repeat(40));
        let doc = format!(r#"{{"a": {}}}"#, deep);
        let result = v.validate(&doc, &ValidationOptions::new(InputKind::Config, "cfg"));
        assert!(!result.valid);
    }

    #[test]
    fn template_kind_allows_plain_placeholders_only() {
        let v = validator();
        let opts = ValidationOptions::new(InputKind::Template, "tpl");
        assert!(v.validate("Hello {{ user.name }}!", &opts).valid);
        assert!(!v.validate("{{ 7*7 }}", &opts).valid);
        assert!(!v.validate("{% for x in y %}", &opts).valid);
        assert!(!v.validate("Hello {{ name", &opts).valid);
        assert!(!v.validate("Hello name }}", &opts).valid);
    }

    #[test]
    fn bad_pattern_rejected_at_construction() {
        let mut policy = SecurityPolicy::mode_defaults(SecurityMode::Standard).validation;
        policy.blocked_patterns.push("(unclosed".to_string());
        assert!(matches!(
            Validator::new(&policy),
            Err(PolicyError::BadPattern { .. })
        ));
    }
}
