//! Configuration types.
//!
//! Configuration is read from a JSON file named by `CHECKIN_CONFIG`, or, when
//! that variable is unset, assembled from `CHECKIN_*` environment variables.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-channel delivery settings. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel name.
    pub name: String,
    /// Implementation to build from the factory catalog (defaults to `name`).
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay", with = "secs")]
    pub retry_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_timeout", with = "secs")]
    pub timeout: Duration,
    /// Implementation-specific settings (hosts, tokens, allowlists).
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_implementation(mut self, implementation: impl Into<String>) -> Self {
        self.implementation = Some(implementation.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Name of the implementation this channel is built from.
    pub fn implementation(&self) -> &str {
        self.implementation.as_deref().unwrap_or(&self.name)
    }

    /// Read a string setting.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(serde_json::Value::as_str)
    }

    /// Read a string setting that must be present and non-empty.
    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.setting_str(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: format!("{}.settings.{key}", self.name),
                hint: format!("Set `{key}` in the {} channel settings", self.name),
            })
    }

    /// Read an integer setting, falling back to `default` when absent.
    pub fn setting_u64(&self, key: &str, default: u64) -> u64 {
        self.settings
            .get(key)
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(default)
    }

    /// Read a list setting. Accepts a JSON array or a comma-separated string.
    pub fn setting_list(&self, key: &str) -> Vec<String> {
        match self.settings.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(serde_json::Value::String(s)) => split_list(s),
            _ => Vec::new(),
        }
    }

    /// Delay before the next attempt after `retry_count` prior failures.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.retry_delay.as_secs_f64() * factor;
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(MAX_BACKOFF_SECS))
        } else {
            Duration::from_secs_f64(MAX_BACKOFF_SECS)
        }
    }

    /// Check that numeric settings are within range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "name".into(),
                message: "channel name must not be empty".into(),
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{}.backoff_multiplier", self.name),
                message: format!("must be >= 1.0, got {}", self.backoff_multiplier),
            });
        }
        if self.timeout.is_zero() || self.timeout > MAX_CHANNEL_TIMEOUT {
            return Err(ConfigError::InvalidValue {
                key: format!("{}.timeout", self.name),
                message: format!(
                    "must be between 0 and {}s, got {}s",
                    MAX_CHANNEL_TIMEOUT.as_secs(),
                    self.timeout.as_secs_f64()
                ),
            });
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            implementation: None,
            enabled: true,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            timeout: default_timeout(),
            settings: HashMap::new(),
        }
    }
}

/// Upper bound on a single backoff interval (one day).
const MAX_BACKOFF_SECS: f64 = 86_400.0;

/// Upper bound on a per-operation channel timeout (one day).
pub const MAX_CHANNEL_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Channel monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between health sweeps.
    #[serde(with = "secs")]
    pub check_interval: Duration,
    /// Minimum time between restart attempts for one channel.
    #[serde(with = "secs")]
    pub restart_cooldown: Duration,
    /// Failures required before a restart is attempted.
    pub max_consecutive_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            restart_cooldown: Duration::from_secs(300), // 5 minutes
            max_consecutive_failures: 3,
        }
    }
}

/// Retry manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Interval between retry queue passes.
    #[serde(with = "secs")]
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// Orchestrator runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker threads on the bridge runtime.
    pub worker_threads: usize,
    /// Bound on a single channel's initialize/shutdown.
    #[serde(with = "secs")]
    pub lifecycle_timeout: Duration,
    /// How long stop() waits for a background loop to exit.
    #[serde(with = "secs")]
    pub join_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            lifecycle_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub channels: Vec<ChannelConfig>,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Load from `CHECKIN_CONFIG` if set, otherwise from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("CHECKIN_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Self::from_env(),
        }
    }

    /// Parse a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse JSON configuration text.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from environment variables.
    ///
    /// `CHECKIN_CHANNELS` lists channel names (comma-separated). Each channel
    /// reads `CHECKIN_<NAME>_IMPL`, `_ENABLED`, `_MAX_RETRIES`,
    /// `_RETRY_DELAY_SECS`, `_BACKOFF`, `_TIMEOUT_SECS`; any other
    /// `CHECKIN_<NAME>_<KEY>` variable becomes a lowercase `<key>` setting.
    pub fn from_env() -> Result<Self, ConfigError> {
        let names = split_list(&std::env::var("CHECKIN_CHANNELS").unwrap_or_default());
        let vars: Vec<(String, String)> = std::env::vars().collect();

        let mut channels = Vec::with_capacity(names.len());
        for name in names {
            channels.push(channel_from_vars(&name, &vars)?);
        }

        let mut config = Self {
            channels,
            ..Self::default()
        };
        if let Some(secs) = env_u64("CHECKIN_MONITOR_INTERVAL_SECS")? {
            config.monitor.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CHECKIN_RESTART_COOLDOWN_SECS")? {
            config.monitor.restart_cooldown = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("CHECKIN_MAX_CONSECUTIVE_FAILURES")? {
            config.monitor.max_consecutive_failures = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(secs) = env_u64("CHECKIN_RETRY_INTERVAL_SECS")? {
            config.retry.interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate names and out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !seen.insert(channel.name.as_str()) {
                return Err(ConfigError::DuplicateChannel(channel.name.clone()));
            }
        }
        if self.monitor.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidValue {
                key: "monitor.max_consecutive_failures".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Names of enabled channels, in configuration order.
    pub fn enabled_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Channel name → implementation name.
    pub fn implementations(&self) -> HashMap<String, String> {
        self.channels
            .iter()
            .map(|c| (c.name.clone(), c.implementation().to_string()))
            .collect()
    }
}

fn channel_from_vars(name: &str, vars: &[(String, String)]) -> Result<ChannelConfig, ConfigError> {
    let prefix = format!("CHECKIN_{}_", name.to_uppercase());
    let mut config = ChannelConfig::new(name);

    for (key, value) in vars {
        let Some(field) = key.strip_prefix(&prefix) else {
            continue;
        };
        match field {
            "IMPL" => config.implementation = Some(value.trim().to_string()),
            "ENABLED" => config.enabled = parse_bool(key, value)?,
            "MAX_RETRIES" => config.max_retries = parse_num(key, value)?,
            "RETRY_DELAY_SECS" => config.retry_delay = Duration::from_secs(parse_num(key, value)?),
            "BACKOFF" => config.backoff_multiplier = parse_num(key, value)?,
            "TIMEOUT_SECS" => config.timeout = Duration::from_secs(parse_num(key, value)?),
            other => {
                config.settings.insert(
                    other.to_lowercase(),
                    serde_json::Value::String(value.clone()),
                );
            }
        }
    }

    Ok(config)
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => parse_num(key, &value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

/// Split a comma-separated list, trimming and dropping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Serialize a `Duration` as whole or fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn channel_config_defaults() {
        let config = ChannelConfig::new("email");
        assert!(config.enabled);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.implementation(), "email");
    }

    #[test]
    fn backoff_grows_with_retry_count() {
        let config = ChannelConfig::new("email").with_retry_delay(Duration::from_secs(10));
        assert_eq!(config.backoff_delay(0), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(20));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(80));
    }

    #[test]
    fn backoff_is_capped() {
        let config = ChannelConfig::new("email").with_retry_delay(Duration::from_secs(60));
        assert_eq!(config.backoff_delay(200), Duration::from_secs(86_400));
    }

    #[test]
    fn parse_json_with_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "channels": [
                    {"name": "alpha", "max_retries": 2},
                    {"name": "chat", "implementation": "telegram", "retry_delay": 1.5,
                     "settings": {"bot_token": "abc"}}
                ],
                "monitor": {"restart_cooldown": 60}
            }"#,
        )
        .unwrap();

        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].max_retries, 2);
        assert_eq!(config.channels[1].implementation(), "telegram");
        assert_eq!(config.channels[1].retry_delay, Duration::from_millis(1500));
        assert_eq!(config.channels[1].setting_str("bot_token"), Some("abc"));
        assert_eq!(config.monitor.restart_cooldown, Duration::from_secs(60));
        assert_eq!(config.monitor.max_consecutive_failures, 3);
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = AppConfig::from_json(r#"{"channels": [{"name": "a"}, {"name": "a"}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateChannel(name) if name == "a"));
    }

    #[test]
    fn invalid_backoff_rejected() {
        let err = AppConfig::from_json(r#"{"channels": [{"name": "a", "backoff_multiplier": 0.5}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn negative_duration_rejected() {
        let err = AppConfig::from_json(r#"{"channels": [{"name": "a", "timeout": -1}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn oversized_duration_rejected() {
        let err = AppConfig::from_json(r#"{"channels": [{"name": "a", "timeout": 1e300}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));

        let err = AppConfig::from_json(r#"{"monitor": {"check_interval": 1e300}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn timeout_above_one_day_rejected() {
        let err = AppConfig::from_json(r#"{"channels": [{"name": "a", "timeout": 86401}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "a.timeout"));

        let vars = vec![(
            "CHECKIN_CHAT_TIMEOUT_SECS".to_string(),
            u64::MAX.to_string(),
        )];
        let config = channel_from_vars("chat", &vars).unwrap();
        assert!(config.validate().is_err());

        let config = ChannelConfig::new("chat").with_timeout(MAX_CHANNEL_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_channels_and_implementations() {
        let config = AppConfig {
            channels: vec![
                ChannelConfig::new("mail").with_implementation("email"),
                ChannelConfig::new("off").with_enabled(false),
            ],
            ..AppConfig::default()
        };
        assert_eq!(config.enabled_channels(), vec!["mail".to_string()]);
        assert_eq!(config.implementations()["mail"], "email");
        assert_eq!(config.implementations()["off"], "off");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"channels": [{{"name": "discord", "timeout": 10}}]}}"#).unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.channels[0].timeout, Duration::from_secs(10));
    }

    #[test]
    fn channel_from_env_style_vars() {
        let vars = vec![
            ("CHECKIN_CHAT_IMPL".to_string(), "telegram".to_string()),
            ("CHECKIN_CHAT_MAX_RETRIES".to_string(), "5".to_string()),
            ("CHECKIN_CHAT_ENABLED".to_string(), "no".to_string()),
            ("CHECKIN_CHAT_BOT_TOKEN".to_string(), "secret".to_string()),
            ("CHECKIN_OTHER_MAX_RETRIES".to_string(), "9".to_string()),
        ];
        let config = channel_from_vars("chat", &vars).unwrap();
        assert_eq!(config.implementation(), "telegram");
        assert_eq!(config.max_retries, 5);
        assert!(!config.enabled);
        assert_eq!(config.setting_str("bot_token"), Some("secret"));
    }

    #[test]
    fn channel_from_env_rejects_bad_number() {
        let vars = vec![("CHECKIN_CHAT_MAX_RETRIES".to_string(), "many".to_string())];
        assert!(channel_from_vars("chat", &vars).is_err());
    }

    #[test]
    fn setting_list_accepts_array_or_string() {
        let config = ChannelConfig::new("email")
            .with_setting("a", serde_json::json!(["x@y.com", " @z.org "]))
            .with_setting("b", serde_json::json!("one, two,,"));
        assert_eq!(config.setting_list("a"), vec!["x@y.com", "@z.org"]);
        assert_eq!(config.setting_list("b"), vec!["one", "two"]);
        assert!(config.setting_list("missing").is_empty());
    }

    #[test]
    fn require_str_reports_missing_key() {
        let config = ChannelConfig::new("email").with_setting("smtp_host", serde_json::json!(" "));
        let err = config.require_str("smtp_host").unwrap_err();
        assert!(err.to_string().contains("email.settings.smtp_host"));
    }
}
