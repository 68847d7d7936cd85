//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Transport configuration
    pub transport: TransportSettings,
    /// Process manager configuration
    pub process: ProcessConfig,
    /// Session manager configuration
    pub session: SessionConfig,
    /// Daemon configuration
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MCP_RUNTIME_ prefix)
        figment = figment.merge(Env::prefixed("MCP_RUNTIME_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the runtime misbehave
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.transport.request_timeout.is_zero() {
            return Err(Error::Config(
                "transport.request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.process.reap_interval.is_zero() {
            return Err(Error::Config(
                "process.reap_interval must be greater than zero".to_string(),
            ));
        }
        if self.session.health_check.enabled && self.session.health_check.interval.is_zero() {
            return Err(Error::Config(
                "session.health_check.interval must be greater than zero".to_string(),
            ));
        }
        if self.session.reconnect.max_attempts == 0 {
            return Err(Error::Config(
                "session.reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Output format (text, json)
    pub format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Per-request deadline
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Deadline for establishing a connection (TCP connect, SSE endpoint event)
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Log HTTP requests and responses including bodies
    pub debug: bool,
    /// Permit absolute paths as stdio commands
    pub allow_absolute_commands: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            debug: false,
            allow_absolute_commands: false,
        }
    }
}

/// Process manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Time between SIGTERM and SIGKILL
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Time to wait after SIGKILL before giving up on the process
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,
    /// Background reaper tick
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(1),
            reap_interval: Duration::from_millis(100),
        }
    }
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reconnection policy
    pub reconnect: ReconnectConfig,
    /// Health check configuration
    pub health_check: HealthCheckConfig,
    /// Deadline for the initialize handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Classified errors kept in history
    pub error_history_size: usize,
    /// Protocol events kept in the trace ring buffer
    pub event_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            health_check: HealthCheckConfig::default(),
            handshake_timeout: Duration::from_secs(30),
            error_history_size: 100,
            event_buffer_size: 1000,
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Enable automatic retries
    pub enabled: bool,
    /// Total connect attempts, first one included
    pub max_attempts: u32,
    /// Base delay overriding the per-category default
    #[serde(with = "humantime_serde::option")]
    pub base_delay: Option<Duration>,
    /// Upper bound for a single backoff delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: None,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable health checks
    pub enabled: bool,
    /// Health check interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Health check timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket path; `${VAR}` and `~` are expanded
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "~/.mcp-runtime/daemon.sock".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Socket path with `~` and `${VAR}` / `${VAR:-default}` expanded
    #[must_use]
    pub fn resolved_socket_path(&self) -> PathBuf {
        let expanded = expand_env(&self.socket_path);
        if let Some(rest) = expanded.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
        PathBuf::from(expanded)
    }
}

/// Expand `${VAR}` and `${VAR:-default}` patterns
#[must_use]
pub fn expand_env(value: &str) -> String {
    // Pattern is a literal and always compiles
    let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
        return value.to_string();
    };
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "100ms" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }

    /// Same format for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.process.grace_period, Duration::from_secs(2));
        assert_eq!(config.process.kill_timeout, Duration::from_secs(1));
        assert_eq!(config.process.reap_interval, Duration::from_millis(100));
        assert_eq!(config.session.reconnect.max_attempts, 3);
        assert!(config.session.reconnect.base_delay.is_none());
        assert!(!config.transport.allow_absolute_commands);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn humantime_parses_all_suffixes() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn yaml_sections_deserialize() {
        let yaml = r#"
transport:
  request_timeout: 500ms
  debug: true
session:
  reconnect:
    max_attempts: 5
    base_delay: 250ms
  health_check:
    enabled: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transport.request_timeout, Duration::from_millis(500));
        assert!(config.transport.debug);
        assert_eq!(config.session.reconnect.max_attempts, 5);
        assert_eq!(
            config.session.reconnect.base_delay,
            Some(Duration::from_millis(250))
        );
        assert!(!config.session.health_check.enabled);
        // untouched sections keep their defaults
        assert_eq!(config.process.grace_period, Duration::from_secs(2));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "process:\n  reap_interval: 50ms").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.process.reap_interval, Duration::from_millis(50));
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/runtime.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.session.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_env_uses_default() {
        let out = expand_env("${MCP_RT_TEST_SURELY_UNSET:-/tmp/x.sock}");
        assert_eq!(out, "/tmp/x.sock");
    }
}
