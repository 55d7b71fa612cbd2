use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use flowmeter::CounterKind;

/// Errors produced by configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value in `{var}`: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Service configuration: YAML file first, then `QPS_`-prefixed
/// environment variables (section and key joined by `_`, e.g.
/// `QPS_SERVER_PORT`, `QPS_COUNTER_WINDOW_SIZE`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub counter: CounterSettings,
    pub limiter: LimiterConfig,
    pub metrics: MetricsConfig,
    pub shutdown: ShutdownConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    pub server_type: ServerType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            server_type: ServerType::Standard,
        }
    }
}

/// Which HTTP engine the configuration asks for. Both are served by the
/// same axum stack; the field is kept for config compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Standard,
    Fasthttp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterSettings {
    #[serde(rename = "type")]
    pub counter_type: CounterType,
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,
    pub slot_num: usize,
    #[serde(with = "humantime_serde")]
    pub precision: Duration,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            counter_type: CounterType::Sharded,
            window_size: Duration::from_secs(1),
            slot_num: 10,
            precision: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterType {
    Lockfree,
    Sharded,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub enabled: bool,
    pub rate: u64,
    pub burst: u64,
    pub adaptive: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 1000,
            burst: 2000,
            adaptive: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            endpoint: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Log file path; empty means stdout only. Rotation is daily, keeping
    /// `max_backups` files.
    pub file_path: String,
    /// Size threshold in megabytes. Accepted for config compatibility;
    /// size-based rotation belongs to the deployment.
    pub max_size: u64,
    pub max_backups: usize,
    /// Age threshold in days. Accepted for config compatibility; age-based
    /// pruning belongs to the deployment.
    pub max_age: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            file_path: String::new(),
            max_size: 100,
            max_backups: 7,
            max_age: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Console,
}

impl AppConfig {
    /// Loads, applies environment overrides, and validates.
    ///
    /// With no path the built-in defaults are the base; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_yaml::from_str(&raw)?
            }
            None => AppConfig::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_value("QPS_SERVER_PORT")? {
            self.server.port = v;
        }
        if let Some(v) = env_duration("QPS_SERVER_READ_TIMEOUT")? {
            self.server.read_timeout = v;
        }
        if let Some(v) = env_duration("QPS_SERVER_WRITE_TIMEOUT")? {
            self.server.write_timeout = v;
        }
        if let Some(v) = env_value("QPS_SERVER_SERVER_TYPE")? {
            self.server.server_type = v;
        }
        if let Some(v) = env_value("QPS_COUNTER_TYPE")? {
            self.counter.counter_type = v;
        }
        if let Some(v) = env_duration("QPS_COUNTER_WINDOW_SIZE")? {
            self.counter.window_size = v;
        }
        if let Some(v) = env_value("QPS_COUNTER_SLOT_NUM")? {
            self.counter.slot_num = v;
        }
        if let Some(v) = env_duration("QPS_COUNTER_PRECISION")? {
            self.counter.precision = v;
        }
        if let Some(v) = env_value("QPS_LIMITER_ENABLED")? {
            self.limiter.enabled = v;
        }
        if let Some(v) = env_value("QPS_LIMITER_RATE")? {
            self.limiter.rate = v;
        }
        if let Some(v) = env_value("QPS_LIMITER_BURST")? {
            self.limiter.burst = v;
        }
        if let Some(v) = env_value("QPS_LIMITER_ADAPTIVE")? {
            self.limiter.adaptive = v;
        }
        if let Some(v) = env_value("QPS_METRICS_ENABLED")? {
            self.metrics.enabled = v;
        }
        if let Some(v) = env_duration("QPS_METRICS_INTERVAL")? {
            self.metrics.interval = v;
        }
        if let Some(v) = env_value("QPS_METRICS_ENDPOINT")? {
            self.metrics.endpoint = v;
        }
        if let Some(v) = env_duration("QPS_SHUTDOWN_TIMEOUT")? {
            self.shutdown.timeout = v;
        }
        if let Some(v) = env_duration("QPS_SHUTDOWN_MAX_WAIT")? {
            self.shutdown.max_wait = v;
        }
        if let Some(v) = env_value("QPS_LOGGER_LEVEL")? {
            self.logger.level = v;
        }
        if let Some(v) = env_value("QPS_LOGGER_FORMAT")? {
            self.logger.format = v;
        }
        if let Some(v) = env_value("QPS_LOGGER_FILE_PATH")? {
            self.logger.file_path = v;
        }
        if let Some(v) = env_value("QPS_LOGGER_MAX_SIZE")? {
            self.logger.max_size = v;
        }
        if let Some(v) = env_value("QPS_LOGGER_MAX_BACKUPS")? {
            self.logger.max_backups = v;
        }
        if let Some(v) = env_value("QPS_LOGGER_MAX_AGE")? {
            self.logger.max_age = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid("server.port", "must be between 1 and 65535"));
        }
        self.counter_config()
            .validate()
            .map_err(|err| match err {
                flowmeter::ConfigError::Invalid { field, reason } => ConfigError::Invalid {
                    field: format!("counter.{field}"),
                    reason: reason.to_string(),
                },
            })?;
        if self.limiter.enabled {
            if self.limiter.rate == 0 {
                return Err(invalid("limiter.rate", "must be greater than zero"));
            }
            if self.limiter.burst == 0 {
                return Err(invalid("limiter.burst", "must be greater than zero"));
            }
        }
        if self.metrics.enabled {
            if self.metrics.interval.is_zero() {
                return Err(invalid("metrics.interval", "must be greater than zero"));
            }
            if !self.metrics.endpoint.starts_with('/') {
                return Err(invalid("metrics.endpoint", "must start with `/`"));
            }
        }
        if self.shutdown.timeout.is_zero() {
            return Err(invalid("shutdown.timeout", "must be greater than zero"));
        }
        if !self.shutdown.max_wait.is_zero() && self.shutdown.max_wait < self.shutdown.timeout {
            return Err(invalid(
                "shutdown.max_wait",
                "must be at least shutdown.timeout",
            ));
        }
        Ok(())
    }

    /// The core counter configuration derived from this config.
    pub fn counter_config(&self) -> flowmeter::CounterConfig {
        flowmeter::CounterConfig {
            window: self.counter.window_size,
            slots: self.counter.slot_num,
            precision: self.counter.precision,
        }
    }

    pub fn counter_kind(&self) -> CounterKind {
        match self.counter.counter_type {
            CounterType::Lockfree => CounterKind::LockFree,
            CounterType::Sharded => CounterKind::Sharded,
        }
    }
}

/// Reads an environment override, deserializing the raw value as a YAML
/// scalar so numbers, booleans, and enum names all parse uniformly.
fn env_value<T: DeserializeOwned>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => serde_yaml::from_str(&raw)
            .map(Some)
            .map_err(|err| ConfigError::Env {
                var: var.to_string(),
                reason: err.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_duration(var: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => humantime::Duration::from_str(&raw)
            .map(|d| Some(d.into()))
            .map_err(|err| ConfigError::Env {
                var: var.to_string(),
                reason: err.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_full_yaml_document_parses() {
        let raw = r#"
server:
  port: 9090
  read_timeout: 5s
  write_timeout: 15s
  server_type: fasthttp
counter:
  type: lockfree
  window_size: 2s
  slot_num: 40
  precision: 50ms
limiter:
  enabled: true
  rate: 500
  burst: 1000
  adaptive: true
metrics:
  enabled: false
  interval: 10s
  endpoint: /metrics
shutdown:
  timeout: 3s
  max_wait: 6s
logger:
  level: warn
  format: console
  file_path: /tmp/flowmeter.log
  max_size: 50
  max_backups: 3
  max_age: 14
"#;
        let config: AppConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.server_type, ServerType::Fasthttp);
        assert_eq!(config.counter.counter_type, CounterType::Lockfree);
        assert_eq!(config.counter.window_size, Duration::from_secs(2));
        assert_eq!(config.counter.precision, Duration::from_millis(50));
        assert_eq!(config.limiter.rate, 500);
        assert!(config.limiter.adaptive);
        assert!(!config.metrics.enabled);
        assert_eq!(config.shutdown.max_wait, Duration::from_secs(6));
        assert_eq!(config.logger.level, LogLevel::Warn);
        assert_eq!(config.logger.format, LogFormat::Console);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: AppConfig = serde_yaml::from_str("server:\n  port: 3000\n").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.counter.slot_num, 10);
        assert!(config.limiter.enabled);
    }

    #[test]
    fn test_env_overrides_apply() {
        std::env::set_var("QPS_SERVER_PORT", "4242");
        std::env::set_var("QPS_COUNTER_TYPE", "lockfree");
        std::env::set_var("QPS_COUNTER_WINDOW_SIZE", "2s");
        std::env::set_var("QPS_COUNTER_SLOT_NUM", "40");
        std::env::set_var("QPS_LIMITER_ENABLED", "false");

        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.server.port, 4242);
        assert_eq!(config.counter.counter_type, CounterType::Lockfree);
        assert_eq!(config.counter.window_size, Duration::from_secs(2));
        assert_eq!(config.counter.slot_num, 40);
        assert!(!config.limiter.enabled);

        for var in [
            "QPS_SERVER_PORT",
            "QPS_COUNTER_TYPE",
            "QPS_COUNTER_WINDOW_SIZE",
            "QPS_COUNTER_SLOT_NUM",
            "QPS_LIMITER_ENABLED",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_validation_reports_the_offending_field() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "server.port"
        ));

        let mut config = AppConfig::default();
        config.counter.slot_num = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "counter.slot_num"
        ));

        let mut config = AppConfig::default();
        config.limiter.rate = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "limiter.rate"
        ));

        // A disabled limiter does not need a rate.
        let mut config = AppConfig::default();
        config.limiter.enabled = false;
        config.limiter.rate = 0;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.shutdown.max_wait = Duration::from_secs(1);
        config.shutdown.timeout = Duration::from_secs(5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "shutdown.max_wait"
        ));
    }

    #[test]
    fn test_uncovered_window_is_rejected() {
        let mut config = AppConfig::default();
        config.counter.slot_num = 4;
        config.counter.precision = Duration::from_millis(100);
        config.counter.window_size = Duration::from_secs(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "counter.slot_num"
        ));
    }
}
