//! watchpost.toml configuration parser.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::types::CheckKind;

pub const DEFAULT_NAME: &str = "Statuspage";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_MAX_CONCURRENT_WRITES: usize = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchpostConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path of the history log file.
    #[serde(default)]
    pub db: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Shell used to run check commands.
    pub shell: Option<String>,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub compact: CompactConfig,
    #[serde(default)]
    pub on_failure: Vec<NotificationConfig>,
    #[serde(default)]
    pub on_recovered: Vec<NotificationConfig>,
    #[serde(default)]
    pub on_success: Vec<NotificationConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    /// Retention bound per series.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Depth of the writer queue.
    #[serde(default = "default_max_concurrent_writes")]
    pub max_concurrent_writes: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_concurrent_writes: DEFAULT_MAX_CONCURRENT_WRITES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompactConfig {
    /// Compact after this many writes (0 disables the trigger).
    #[serde(default)]
    pub max_writes: u64,
    /// Compact when this much time has passed since the last compaction.
    pub interval: Option<String>,
}

impl CompactConfig {
    pub fn interval(&self) -> ConfigResult<Option<Duration>> {
        self.interval.as_deref().map(non_zero_duration).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default)]
    pub on_failure: Vec<NotificationConfig>,
    #[serde(default)]
    pub on_recovered: Vec<NotificationConfig>,
    #[serde(default)]
    pub on_success: Vec<NotificationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    #[serde(default)]
    pub name: String,
    pub cmd: Option<CheckCommand>,
    #[serde(rename = "type", default)]
    pub kind: CheckKind,
    pub unit: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_interval: Option<String>,
}

/// A check command, either a single string or a list of statements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckCommand {
    One(String),
    Many(Vec<String>),
}

impl CheckCommand {
    /// Lists are joined with `;` into one shell script.
    pub fn to_script(&self) -> String {
        match self {
            CheckCommand::One(cmd) => cmd.clone(),
            CheckCommand::Many(parts) => parts.join(";"),
        }
    }
}

/// A check with every default applied and every duration parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckDefinition {
    pub name: String,
    pub command: String,
    pub kind: CheckKind,
    pub metric_unit: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: String,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template; `{status}`, `{group}` and `{name}` are substituted.
    #[serde(default)]
    pub body: String,
    pub timeout: Option<String>,
}

impl WebhookConfig {
    /// Upper-cased method, `GET` when unset.
    pub fn method(&self) -> String {
        self.method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .map(|m| m.trim().to_uppercase())
            .unwrap_or_else(|| "GET".to_string())
    }

    pub fn timeout(&self) -> ConfigResult<Duration> {
        match self.timeout.as_deref() {
            Some(s) => non_zero_duration(s),
            None => Ok(DEFAULT_WEBHOOK_TIMEOUT),
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        let rest = self
            .url
            .strip_prefix("http://")
            .or_else(|| self.url.strip_prefix("https://"))
            .ok_or_else(|| {
                ConfigError::InvalidWebhook(format!(
                    "url '{}' must use the http or https scheme",
                    self.url
                ))
            })?;
        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(ConfigError::InvalidWebhook(format!(
                "hostname is required for url '{}'",
                self.url
            )));
        }
        self.timeout()?;
        Ok(())
    }
}

impl NotificationConfig {
    fn validate(&self) -> ConfigResult<()> {
        match &self.webhook {
            Some(webhook) => webhook.validate(),
            None => Err(ConfigError::InvalidWebhook(
                "notification entry has no notifier configured".to_string(),
            )),
        }
    }
}

impl CheckConfig {
    /// Apply defaults and validate a single check.
    pub fn resolve(&self, service: &str, index: usize) -> ConfigResult<CheckDefinition> {
        let invalid = |reason: String| ConfigError::InvalidCheck {
            service: service.to_string(),
            index,
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("missing name".to_string()));
        }
        let command = self
            .cmd
            .as_ref()
            .map(CheckCommand::to_script)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| invalid("missing cmd".to_string()))?;

        let metric_unit = self.unit.clone().filter(|u| !u.is_empty());
        if self.kind == CheckKind::Metric && metric_unit.is_none() {
            return Err(invalid("type is metric but unit is missing".to_string()));
        }

        let duration_or = |value: &Option<String>, default: Duration| match value.as_deref() {
            Some(s) => non_zero_duration(s).map_err(|e| invalid(e.to_string())),
            None => Ok(default),
        };

        Ok(CheckDefinition {
            name: self.name.clone(),
            command,
            kind: self.kind,
            metric_unit,
            interval: duration_or(&self.interval, DEFAULT_INTERVAL)?,
            timeout: duration_or(&self.timeout, DEFAULT_TIMEOUT)?,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_interval: duration_or(&self.retry_interval, DEFAULT_RETRY_INTERVAL)?,
        })
    }
}

impl ServiceConfig {
    /// Resolve every check in this service.
    pub fn definitions(&self, service: &str) -> ConfigResult<Vec<CheckDefinition>> {
        if self.checks.is_empty() {
            return Err(ConfigError::EmptyService(service.to_string()));
        }
        let mut seen = HashSet::new();
        let mut defs = Vec::with_capacity(self.checks.len());
        for (index, check) in self.checks.iter().enumerate() {
            let def = check.resolve(service, index)?;
            if !seen.insert(def.name.clone()) {
                return Err(ConfigError::InvalidCheck {
                    service: service.to_string(),
                    index,
                    reason: format!("duplicate check name '{}'", def.name),
                });
            }
            defs.push(def);
        }
        Ok(defs)
    }
}

impl WatchpostConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: WatchpostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.db.trim().is_empty() {
            return Err(ConfigError::MissingDb);
        }
        self.log_directive()?;
        self.compact.interval()?;
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        for (service, cfg) in &self.services {
            cfg.definitions(service)?;
            for n in cfg.on_failure.iter().chain(&cfg.on_recovered).chain(&cfg.on_success) {
                n.validate()?;
            }
        }
        for n in self.on_failure.iter().chain(&self.on_recovered).chain(&self.on_success) {
            n.validate()?;
        }
        Ok(())
    }

    /// Tracing filter directive for the configured log level.
    pub fn log_directive(&self) -> ConfigResult<&'static str> {
        match self.log_level.trim().to_lowercase().as_str() {
            "none" | "off" => Ok("off"),
            "error" => Ok("error"),
            "warn" => Ok("warn"),
            "info" => Ok("info"),
            "debug" => Ok("debug"),
            "trace" => Ok("trace"),
            _ => Err(ConfigError::InvalidLogLevel(self.log_level.clone())),
        }
    }

    /// Configured shell, then `$SHELL`, then `/bin/sh`.
    pub fn shell(&self) -> String {
        self.shell
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    /// Every `(group, check)` pair in config order.
    pub fn check_definitions(&self) -> ConfigResult<Vec<(String, CheckDefinition)>> {
        let mut all = Vec::new();
        for (service, cfg) in &self.services {
            for def in cfg.definitions(service)? {
                all.push((service.clone(), def));
            }
        }
        Ok(all)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn non_zero_duration(s: &str) -> ConfigResult<Duration> {
    parse_duration(s)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| ConfigError::InvalidDuration(s.to_string()))
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_max_concurrent_writes() -> usize {
    DEFAULT_MAX_CONCURRENT_WRITES
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
name = "Acme status"
db = "./history.jsonl"
log_level = "debug"

[compact]
max_writes = 500
interval = "1h"

[[on_failure]]
webhook = { url = "https://hooks.example.com/alert", method = "post", body = "{group}/{name} is {status}" }

[services.api]
checks = [
  { name = "Website is up", cmd = "curl -fsS http://localhost", interval = "30s" },
  { name = "Queue depth", type = "metric", unit = "jobs", cmd = ["echo 1", "echo 2"], max_retries = 0 },
]

[[services.api.on_recovered]]
webhook = { url = "http://localhost:9000/ok" }
"#;

    #[test]
    fn test_parse_full() {
        let config = WatchpostConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.name, "Acme status");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.log_directive().unwrap(), "debug");
        assert_eq!(config.compact.max_writes, 500);
        assert_eq!(config.compact.interval().unwrap(), Some(Duration::from_secs(3600)));

        let webhook = config.on_failure[0].webhook.as_ref().unwrap();
        assert_eq!(webhook.method(), "POST");
        assert_eq!(webhook.timeout().unwrap(), DEFAULT_WEBHOOK_TIMEOUT);

        let defs = config.check_definitions().unwrap();
        assert_eq!(defs.len(), 2);
        let (group, up) = &defs[0];
        assert_eq!(group, "api");
        assert_eq!(up.kind, CheckKind::Boolean);
        assert_eq!(up.interval, Duration::from_secs(30));
        assert_eq!(up.timeout, DEFAULT_TIMEOUT);
        assert_eq!(up.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(up.retry_interval, DEFAULT_RETRY_INTERVAL);

        let (_, depth) = &defs[1];
        assert_eq!(depth.kind, CheckKind::Metric);
        assert_eq!(depth.command, "echo 1;echo 2");
        assert_eq!(depth.metric_unit.as_deref(), Some("jobs"));
        assert_eq!(depth.max_retries, 0);
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
db = "h.jsonl"
[services.web]
checks = [{ name = "up", cmd = "true" }]
"#;
        let config = WatchpostConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.name, DEFAULT_NAME);
        assert_eq!(config.history.max_entries, DEFAULT_MAX_ENTRIES);
        assert_eq!(config.compact.interval().unwrap(), None);
    }

    #[test]
    fn missing_db_is_rejected() {
        let err = WatchpostConfig::from_toml_str(
            "[services.web]\nchecks = [{ name = \"up\", cmd = \"true\" }]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingDb));
    }

    #[test]
    fn no_services_is_rejected() {
        let err = WatchpostConfig::from_toml_str("db = \"h.jsonl\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoServices));
    }

    #[test]
    fn empty_service_is_rejected() {
        let err = WatchpostConfig::from_toml_str("db = \"h\"\n[services.web]\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyService(s) if s == "web"));
    }

    #[test]
    fn metric_without_unit_is_rejected() {
        let toml_str = r#"
db = "h"
[services.web]
checks = [{ name = "load", type = "metric", cmd = "cat /proc/loadavg" }]
"#;
        let err = WatchpostConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCheck { index: 0, .. }));
    }

    #[test]
    fn missing_cmd_and_name_are_rejected() {
        let no_cmd = "db = \"h\"\n[services.web]\nchecks = [{ name = \"up\" }]\n";
        assert!(WatchpostConfig::from_toml_str(no_cmd).is_err());
        let no_name = "db = \"h\"\n[services.web]\nchecks = [{ cmd = \"true\" }]\n";
        assert!(WatchpostConfig::from_toml_str(no_name).is_err());
    }

    #[test]
    fn duplicate_check_names_are_rejected() {
        let toml_str = r#"
db = "h"
[services.web]
checks = [{ name = "up", cmd = "true" }, { name = "up", cmd = "false" }]
"#;
        let err = WatchpostConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCheck { index: 1, .. }));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let toml_str = r#"
db = "h"
[services.web]
checks = [{ name = "up", cmd = "true", interval = "often" }]
"#;
        assert!(WatchpostConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml_str = r#"
db = "h"
colour = "blue"
[services.web]
checks = [{ name = "up", cmd = "true" }]
"#;
        assert!(matches!(
            WatchpostConfig::from_toml_str(toml_str).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn webhook_requires_scheme_and_host() {
        let toml_str = r#"
db = "h"
[[on_failure]]
webhook = { url = "https:///path" }
[services.web]
checks = [{ name = "up", cmd = "true" }]
"#;
        assert!(matches!(
            WatchpostConfig::from_toml_str(toml_str).unwrap_err(),
            ConfigError::InvalidWebhook(_)
        ));

        let toml_str = toml_str.replace("https:///path", "ftp://example.com");
        assert!(WatchpostConfig::from_toml_str(&toml_str).is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let toml_str = r#"
db = "h"
log_level = "loud"
[services.web]
checks = [{ name = "up", cmd = "true" }]
"#;
        assert!(matches!(
            WatchpostConfig::from_toml_str(toml_str).unwrap_err(),
            ConfigError::InvalidLogLevel(_)
        ));
    }

    #[test]
    fn configured_shell_wins() {
        let mut config = WatchpostConfig::from_toml_str(FULL).unwrap();
        config.shell = Some("/bin/bash".to_string());
        assert_eq!(config.shell(), "/bin/bash");
    }

    #[test]
    fn from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchpost.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = WatchpostConfig::from_file(&path).unwrap();
        assert_eq!(config.services.len(), 1);

        assert!(matches!(
            WatchpostConfig::from_file(&dir.path().join("missing.toml")).unwrap_err(),
            ConfigError::Io(_)
        ));
    }

    #[test]
    fn test_round_trip_to_toml() {
        let config = WatchpostConfig::from_toml_str(FULL).unwrap();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("Acme status"));
        assert!(WatchpostConfig::from_toml_str(&toml_str).is_ok());
    }
}
