use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;
use crate::security::{
    MASTER_KEY_ENV, MasterKey, PolicyOverrides, SecurityMode, SecurityService, load_master_key,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// basic | standard | secure | enterprise
    #[serde(default)]
    pub mode: SecurityMode,

    /// Environment variable holding the master key
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,

    /// Master key file (default: data_dir/master.key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key_file: Option<String>,

    /// Per-sub-policy overrides: [security.validation], [security.encryption],
    /// [security.rate_limit], [security.audit]
    #[serde(flatten)]
    pub overrides: PolicyOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_master_key_env() -> String {
    MASTER_KEY_ENV.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::default(),
            master_key_env: default_master_key_env(),
            master_key_file: None,
            overrides: PolicyOverrides::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Paths::resolve()?)
    }

    /// Load `config.toml` from `paths`, writing the commented template on
    /// first run.
    pub fn load_from(paths: Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.paths = paths;

        config.expand_env_vars();

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    fn expand_env_vars(&mut self) {
        if let Some(ref mut file) = self.security.master_key_file {
            *file = expand_env(file);
        }
        if let Some(ref mut log_path) = self.security.overrides.audit.log_path {
            *log_path = PathBuf::from(expand_env(&log_path.to_string_lossy()));
        }
    }

    /// Master key file in effect.
    pub fn master_key_path(&self) -> PathBuf {
        match self.security.master_key_file {
            Some(ref file) => PathBuf::from(shellexpand::tilde(file).into_owned()),
            None => self.paths.master_key_file(),
        }
    }

    /// Master key from the configured env var or key file.
    pub fn master_key(&self) -> Result<Option<MasterKey>> {
        load_master_key(&self.security.master_key_env, Some(&self.master_key_path()))
    }

    /// Build the security service this config describes. A relative audit
    /// `log_path` is resolved against the state directory.
    pub fn security_service(&self) -> Result<SecurityService> {
        SecurityService::builder(self.security.mode)
            .overrides(self.security.overrides.clone())
            .master_key(self.master_key()?)
            .base_dir(&self.paths.state_dir)
            .build()
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();
        let o = &self.security.overrides;

        fn show<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(|v| v.to_string()).unwrap_or_default()
        }

        match parts.as_slice() {
            ["security", "mode"] => Ok(self.security.mode.to_string()),
            ["security", "master_key_env"] => Ok(self.security.master_key_env.clone()),
            ["security", "master_key_file"] => Ok(self.master_key_path().display().to_string()),
            ["security", "validation", "enabled"] => Ok(show(&o.validation.enabled)),
            ["security", "validation", "max_size"] => Ok(show(&o.validation.max_size)),
            ["security", "encryption", "enabled"] => Ok(show(&o.encryption.enabled)),
            ["security", "encryption", "algorithm"] => Ok(show(&o.encryption.algorithm)),
            ["security", "encryption", "pbkdf2_iterations"] => {
                Ok(show(&o.encryption.pbkdf2_iterations))
            }
            ["security", "rate_limit", "enabled"] => Ok(show(&o.rate_limit.enabled)),
            ["security", "rate_limit", "max_requests"] => Ok(show(&o.rate_limit.max_requests)),
            ["security", "rate_limit", "window_ms"] => Ok(show(&o.rate_limit.window_ms)),
            ["security", "audit", "enabled"] => Ok(show(&o.audit.enabled)),
            ["security", "audit", "min_severity"] => Ok(show(&o.audit.min_severity)),
            ["security", "audit", "log_path"] => Ok(o
                .audit
                .log_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let o = &mut self.security.overrides;

        fn parse<T: std::str::FromStr>(value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value {:?}: {}", value, e))
        }

        match parts.as_slice() {
            ["security", "mode"] => self.security.mode = parse(value)?,
            ["security", "master_key_env"] => self.security.master_key_env = value.to_string(),
            ["security", "master_key_file"] => {
                self.security.master_key_file = Some(value.to_string())
            }
            ["security", "validation", "enabled"] => o.validation.enabled = Some(parse(value)?),
            ["security", "validation", "max_size"] => o.validation.max_size = Some(parse(value)?),
            ["security", "encryption", "enabled"] => o.encryption.enabled = Some(parse(value)?),
            ["security", "encryption", "algorithm"] => {
                o.encryption.algorithm = Some(parse(value)?)
            }
            ["security", "encryption", "pbkdf2_iterations"] => {
                o.encryption.pbkdf2_iterations = Some(parse(value)?)
            }
            ["security", "rate_limit", "enabled"] => o.rate_limit.enabled = Some(parse(value)?),
            ["security", "rate_limit", "max_requests"] => {
                o.rate_limit.max_requests = Some(parse(value)?)
            }
            ["security", "rate_limit", "window_ms"] => o.rate_limit.window_ms = Some(parse(value)?),
            ["security", "audit", "enabled"] => o.audit.enabled = Some(parse(value)?),
            ["security", "audit", "min_severity"] => o.audit.min_severity = Some(parse(value)?),
            ["security", "audit", "log_path"] => o.audit.log_path = Some(PathBuf::from(value)),
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Warden Configuration
# Auto-created on first run. Edit as needed.

[security]
# Operating mode: basic | standard | secure | enterprise
#   basic       validation only
#   standard    validation, encryption, rate limiting and audit
#   secure      tighter limits, 210k PBKDF2 rounds, longer blocks
#   enterprise  strictest limits, 310k rounds, debug-level audit with stack traces
mode = "standard"

# Master key source: this env var first, then the key file.
# Create a key file with `warden key init --acknowledge`.
master_key_env = "WARDEN_MASTER_KEY"
# master_key_file = "~/.local/share/warden/master.key"

# Explicit overrides win over the mode defaults, field by field.
# Loosening a mode default is allowed but logged as a warning.

# [security.validation]
# max_size = 1048576
# extra_blocked_patterns = ["(?i)\\bexec\\s*\\("]

# [security.encryption]
# algorithm = "chacha20-poly1305"      # aes-256-gcm | chacha20-poly1305
# key_derivation = "argon2id"          # pbkdf2-sha256 | scrypt | argon2id
# pbkdf2_iterations = 310000           # minimum 100000

# [security.rate_limit]
# max_requests = 100
# window_ms = 60000
# block_duration_ms = 60000

# [security.audit]
# min_severity = "info"                # debug | info | warning | error | critical
# log_path = "audit"                   # relative to the state directory
# retention_segments = 10

[logging]
level = "info"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_template() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::under(tmp.path());
        let config = Config::load_from(paths.clone()).unwrap();
        assert_eq!(config.security.mode, SecurityMode::Standard);
        assert_eq!(
            fs::read_to_string(paths.config_file()).unwrap(),
            DEFAULT_CONFIG_TEMPLATE
        );

        // The template itself parses to the same defaults.
        let reloaded = Config::load_from(paths).unwrap();
        assert_eq!(reloaded.security.mode, SecurityMode::Standard);
        assert_eq!(reloaded.security.master_key_env, MASTER_KEY_ENV);
        assert_eq!(reloaded.security.overrides, PolicyOverrides::default());
    }

    #[test]
    fn override_tables_are_read() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::under(tmp.path());
        paths.ensure_dirs().unwrap();
        fs::write(
            paths.config_file(),
            r#"
[security]
mode = "secure"

[security.rate_limit]
max_requests = 5

[security.encryption]
algorithm = "chacha20-poly1305"
"#,
        )
        .unwrap();

        let config = Config::load_from(paths).unwrap();
        assert_eq!(config.security.mode, SecurityMode::Secure);
        assert_eq!(config.security.overrides.rate_limit.max_requests, Some(5));
        assert_eq!(
            config.get_value("security.encryption.algorithm").unwrap(),
            "chacha20-poly1305"
        );
    }

    #[test]
    fn set_then_save_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::under(tmp.path());
        let mut config = Config::load_from(paths.clone()).unwrap();

        config.set_value("security.mode", "enterprise").unwrap();
        config.set_value("security.audit.min_severity", "warning").unwrap();
        config.set_value("security.rate_limit.max_requests", "7").unwrap();
        assert!(config.set_value("security.mode", "paranoid").is_err());
        assert!(config.set_value("security.rate_limit.max_requests", "many").is_err());
        assert!(config.set_value("nope", "1").is_err());
        config.save().unwrap();

        let reloaded = Config::load_from(paths).unwrap();
        assert_eq!(reloaded.get_value("security.mode").unwrap(), "enterprise");
        assert_eq!(
            reloaded.get_value("security.audit.min_severity").unwrap(),
            "warning"
        );
        assert_eq!(
            reloaded.get_value("security.rate_limit.max_requests").unwrap(),
            "7"
        );
        assert_eq!(reloaded.get_value("security.audit.enabled").unwrap(), "");
    }

    #[test]
    fn master_key_path_defaults_to_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::load_from(Paths::under(tmp.path())).unwrap();
        assert_eq!(config.master_key_path(), tmp.path().join("data/master.key"));

        config.security.master_key_file = Some("/keys/warden.key".to_string());
        assert_eq!(config.master_key_path(), PathBuf::from("/keys/warden.key"));
    }

    #[test]
    fn service_from_config_uses_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::load_from(Paths::under(tmp.path())).unwrap();
        config.security.master_key_env = "WARDEN_TEST_CONFIG_UNSET_KEY".to_string();

        let svc = config.security_service().unwrap();
        assert!(!svc.has_master_key());
        assert_eq!(svc.audit_logger().dir(), config.paths.audit_dir().as_path());
    }

    #[test]
    fn expand_env_leaves_unknown_vars() {
        assert_eq!(expand_env("${WARDEN_TEST_SURELY_UNSET}"), "${WARDEN_TEST_SURELY_UNSET}");
        assert_eq!(expand_env("plain"), "plain");
    }
}
