//! Sealed documents: structured config with sensitive fields encrypted at
//! rest and a keyed integrity tag over the whole.
//!
//! On disk a sealed document is the original mapping with every sensitive
//! string replaced by `ENC[<path>]`, plus three reserved top-level keys:
//!
//! ```yaml
//! database:
//!   host: db.internal
//!   password: ENC[database.password]
//! encrypted:
//!   database.password: { ciphertext: ..., iv: ..., tag: ..., salt: ..., algorithm: aes-256-gcm }
//! _version: 2026-01-01T00:00:00.000000000Z
//! _integrity: hmac-sha256:9f2c...
//! ```
//!
//! Each field is encrypted with its own path as the context, so a
//! ciphertext moved to another field does not decrypt.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::security::{
    EncryptedValue, ProtectedValue, SecureAccessError, SecurityService, is_sensitive_name,
};

const ENCRYPTED_KEY: &str = "encrypted";
const VERSION_KEY: &str = "_version";
const INTEGRITY_KEY: &str = "_integrity";
const RESERVED_KEYS: &[&str] = &[ENCRYPTED_KEY, VERSION_KEY, INTEGRITY_KEY];

/// Placeholder stored in place of an encrypted field.
pub fn placeholder(path: &str) -> String {
    format!("ENC[{}]", path)
}

fn placeholder_path(text: &str) -> Option<&str> {
    text.strip_prefix("ENC[")?.strip_suffix(']')
}

/// On-disk syntax of a config document, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// `.json` and `.toml` by extension; anything else is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => ConfigFormat::Json,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }

    pub fn parse(self, text: &str) -> Result<Value> {
        let value = match self {
            ConfigFormat::Json => serde_json::from_str(text).context("Invalid JSON document")?,
            ConfigFormat::Yaml => {
                let yaml: serde_yaml::Value =
                    serde_yaml::from_str(text).context("Invalid YAML document")?;
                serde_json::to_value(yaml).context("Unsupported YAML value")?
            }
            ConfigFormat::Toml => {
                let table: toml::Table = toml::from_str(text).context("Invalid TOML document")?;
                serde_json::to_value(table).context("Unsupported TOML value")?
            }
        };
        if !value.is_object() {
            anyhow::bail!("Document root must be a mapping");
        }
        Ok(value)
    }

    pub fn render(self, value: &Value) -> Result<String> {
        Ok(match self {
            ConfigFormat::Json => serde_json::to_string_pretty(value)? + "\n",
            ConfigFormat::Yaml => serde_yaml::to_string(value)?,
            ConfigFormat::Toml => toml::to_string_pretty(value)?,
        })
    }
}

/// A config mapping with sensitive fields sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedDocument {
    #[serde(flatten)]
    document: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    encrypted: BTreeMap<String, EncryptedValue>,
    #[serde(rename = "_version")]
    version: DateTime<Utc>,
    #[serde(rename = "_integrity")]
    integrity: String,
}

impl SealedDocument {
    /// Encrypt every sensitive string field of `document` and tag the result.
    ///
    /// Fields stay inline when the active policy has encryption disabled.
    pub fn seal(security: &SecurityService, document: Value) -> Result<Self, SecureAccessError> {
        let Value::Object(mut document) = document else {
            return Err(SecureAccessError::Malformed(
                "document root must be a mapping".to_string(),
            ));
        };
        if let Some(key) = RESERVED_KEYS.iter().find(|k| document.contains_key(**k)) {
            return Err(SecureAccessError::Malformed(format!(
                "reserved key `{}` in plain document",
                key
            )));
        }

        let mut encrypted = BTreeMap::new();
        for (key, value) in document.iter_mut() {
            seal_value(security, value, key, key, &mut encrypted)?;
        }

        let mut sealed = Self {
            document,
            encrypted,
            version: Utc::now(),
            integrity: String::new(),
        };
        sealed.integrity = security.integrity_tag(&sealed.canonical()?);
        Ok(sealed)
    }

    /// Split a parsed on-disk document into its parts.
    pub fn from_value(value: Value) -> Result<Self, SecureAccessError> {
        serde_json::from_value(value).map_err(|e| SecureAccessError::Malformed(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value, SecureAccessError> {
        serde_json::to_value(self).map_err(|e| SecureAccessError::Malformed(e.to_string()))
    }

    /// Whether a parsed document carries the sealed layout.
    pub fn is_sealed(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|map| map.contains_key(INTEGRITY_KEY))
    }

    /// Mapping with placeholders in place of sealed fields.
    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn version(&self) -> DateTime<Utc> {
        self.version
    }

    pub fn integrity(&self) -> &str {
        &self.integrity
    }

    /// Paths of the sealed fields.
    pub fn encrypted_fields(&self) -> Vec<String> {
        self.encrypted.keys().cloned().collect()
    }

    /// Check the integrity tag against the current contents.
    pub fn verify(&self, security: &SecurityService) -> bool {
        self.canonical()
            .is_ok_and(|payload| security.verify_integrity_tag(&payload, &self.integrity))
    }

    /// Plaintext of one field by dotted path (`database.password`,
    /// `servers[0].token`). `None` when the path holds no string.
    pub fn reveal(
        &self,
        security: &SecurityService,
        field: &str,
    ) -> Result<Option<String>, SecureAccessError> {
        if let Some(value) = self.encrypted.get(field) {
            let protected = ProtectedValue::Encrypted(value.clone());
            return Ok(Some(security.decrypt(&protected, field)?));
        }

        let mut found = None;
        for (key, value) in &self.document {
            visit_leaves(value, key, &mut |path, leaf| {
                if path == field
                    && let Value::String(text) = leaf
                {
                    found = Some(text.clone());
                }
            });
        }
        Ok(found)
    }

    /// Verify integrity and decrypt every sealed field.
    pub fn open(&self, security: &SecurityService) -> Result<Value, SecureAccessError> {
        if !self.verify(security) {
            return Err(SecureAccessError::IntegrityViolation(
                "sealed document".to_string(),
            ));
        }
        let mut document = self.document.clone();
        for (key, value) in document.iter_mut() {
            self.open_value(security, value, key)?;
        }
        Ok(Value::Object(document))
    }

    fn open_value(
        &self,
        security: &SecurityService,
        value: &mut Value,
        path: &str,
    ) -> Result<(), SecureAccessError> {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    self.open_value(security, child, &join_key(path, key))?;
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter_mut().enumerate() {
                    self.open_value(security, child, &join_index(path, i))?;
                }
            }
            Value::String(text) => {
                if let Some(sealed_path) = placeholder_path(text) {
                    if sealed_path != path {
                        return Err(SecureAccessError::Malformed(format!(
                            "placeholder for `{}` found at `{}`",
                            sealed_path, path
                        )));
                    }
                    let encrypted = self.encrypted.get(path).ok_or_else(|| {
                        SecureAccessError::Malformed(format!("no ciphertext for `{}`", path))
                    })?;
                    let protected = ProtectedValue::Encrypted(encrypted.clone());
                    *value = Value::String(security.decrypt(&protected, path)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Serialized form covered by the integrity tag. `serde_json::Map` is
    /// ordered by key, so the output does not depend on input order.
    fn canonical(&self) -> Result<String, SecureAccessError> {
        let body = serde_json::json!({
            "document": self.document,
            "encrypted": self.encrypted,
            "version": self.version.to_rfc3339_opts(SecondsFormat::Nanos, true),
        });
        serde_json::to_string(&body).map_err(|e| SecureAccessError::Malformed(e.to_string()))
    }
}

fn seal_value(
    security: &SecurityService,
    value: &mut Value,
    name: &str,
    path: &str,
    encrypted: &mut BTreeMap<String, EncryptedValue>,
) -> Result<(), SecureAccessError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                seal_value(security, child, key, &join_key(path, key), encrypted)?;
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                seal_value(security, child, name, &join_index(path, i), encrypted)?;
            }
        }
        Value::String(text) if is_sensitive_name(name) => {
            if let ProtectedValue::Encrypted(sealed) = security.encrypt(text, path)? {
                encrypted.insert(path.to_string(), sealed);
                *value = Value::String(placeholder(path));
            }
        }
        _ => {}
    }
    Ok(())
}

fn visit_leaves(value: &Value, path: &str, f: &mut dyn FnMut(&str, &Value)) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                visit_leaves(child, &join_key(path, key), f);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                visit_leaves(child, &join_index(path, i), f);
            }
        }
        leaf => f(path, leaf),
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn join_index(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{MasterKey, SecurityMode};
    use serde_json::json;

    fn service(mode: SecurityMode, dir: &Path, key: bool) -> SecurityService {
        let key = key.then(|| MasterKey::new(vec![7u8; 32]).unwrap());
        SecurityService::builder(mode)
            .master_key(key)
            .base_dir(dir)
            .without_maintenance()
            .build()
            .unwrap()
    }

    fn sample() -> Value {
        json!({
            "database": { "host": "db.internal", "port": 5432, "password": "hunter2" },
            "api_key": "sk-12345",
            "servers": [ { "name": "a", "token": "t-a" } ],
            "monkey": "not a secret"
        })
    }

    #[test]
    fn seals_sensitive_fields_only() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path(), true);
        let sealed = SealedDocument::seal(&svc, sample()).unwrap();

        assert_eq!(
            sealed.encrypted_fields(),
            vec!["api_key", "database.password", "servers[0].token"]
        );
        let doc = sealed.document();
        assert_eq!(doc["database"]["password"], "ENC[database.password]");
        assert_eq!(doc["database"]["host"], "db.internal");
        assert_eq!(doc["servers"][0]["token"], "ENC[servers[0].token]");
        assert_eq!(doc["monkey"], "not a secret");
        assert!(sealed.integrity().starts_with("hmac-sha256:"));
        assert!(sealed.verify(&svc));
    }

    #[test]
    fn open_restores_plaintext() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path(), true);
        let sealed = SealedDocument::seal(&svc, sample()).unwrap();
        assert_eq!(sealed.open(&svc).unwrap(), sample());
        assert_eq!(
            sealed.reveal(&svc, "database.password").unwrap().as_deref(),
            Some("hunter2")
        );
        assert_eq!(
            sealed.reveal(&svc, "database.host").unwrap().as_deref(),
            Some("db.internal")
        );
        assert_eq!(sealed.reveal(&svc, "database.port").unwrap(), None);
        assert_eq!(sealed.reveal(&svc, "missing").unwrap(), None);
    }

    #[test]
    fn roundtrips_through_every_format() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path(), true);
        let sealed = SealedDocument::seal(&svc, sample()).unwrap();

        for format in [ConfigFormat::Yaml, ConfigFormat::Json, ConfigFormat::Toml] {
            let text = format.render(&sealed.to_value().unwrap()).unwrap();
            assert!(!text.contains("hunter2"), "{:?} leaked plaintext", format);
            let parsed = format.parse(&text).unwrap();
            assert!(SealedDocument::is_sealed(&parsed));
            let back = SealedDocument::from_value(parsed).unwrap();
            assert!(back.verify(&svc), "{:?} broke integrity", format);
            assert_eq!(back.open(&svc).unwrap(), sample());
        }
    }

    #[test]
    fn tampering_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path(), true);
        let sealed = SealedDocument::seal(&svc, sample()).unwrap();

        let mut value = sealed.to_value().unwrap();
        value["database"]["host"] = json!("evil.example");
        let tampered = SealedDocument::from_value(value).unwrap();
        assert!(!tampered.verify(&svc));
        assert!(matches!(
            tampered.open(&svc),
            Err(SecureAccessError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn moved_ciphertext_does_not_decrypt() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path(), true);
        let sealed = SealedDocument::seal(&svc, sample()).unwrap();

        let mut value = sealed.to_value().unwrap();
        let moved = value["encrypted"]["database.password"].clone();
        value["encrypted"]["api_key"] = moved;
        let swapped = SealedDocument::from_value(value).unwrap();
        assert!(matches!(
            swapped.reveal(&svc, "api_key"),
            Err(SecureAccessError::Decryption(_))
        ));
    }

    #[test]
    fn disabled_encryption_keeps_fields_inline() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Basic, tmp.path(), false);
        let sealed = SealedDocument::seal(&svc, sample()).unwrap();
        assert!(sealed.encrypted_fields().is_empty());
        assert_eq!(sealed.document()["api_key"], "sk-12345");
        assert!(sealed.integrity().starts_with("sha256:"));
        assert!(sealed.verify(&svc));
    }

    #[test]
    fn rejects_reserved_keys_and_non_mappings() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path(), true);
        assert!(matches!(
            SealedDocument::seal(&svc, json!({ "_integrity": "x" })),
            Err(SecureAccessError::Malformed(_))
        ));
        assert!(matches!(
            SealedDocument::seal(&svc, json!(["a"])),
            Err(SecureAccessError::Malformed(_))
        ));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.TOML")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a")), ConfigFormat::Yaml);
        assert!(ConfigFormat::Json.parse("[1, 2]").is_err());
    }
}
