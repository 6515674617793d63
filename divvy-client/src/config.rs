//! Client configuration
//!
//! [`ClientConfig`] holds every setting of a client. It is normally built with
//! [`ClientBuilder`](crate::ClientBuilder), but it can also be loaded from a
//! configuration file and `DIVVY_*` environment variables:
//!
//! ```bash
//! export DIVVY_HOST=divvy.internal
//! export DIVVY_PORT=8321
//! export DIVVY_REQUEST_TIMEOUT_MS=250
//! export DIVVY_NOT_READY_POLICY=fail-fast
//! ```
//!
//! Durations are given in milliseconds (`*_ms` keys).
//!
//! # Configuration Priority
//!
//! 1. Environment variables (highest priority)
//! 2. Configuration file
//! 3. Default values (lowest priority)

use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

use crate::error::{ClientError, Result};

pub const DEFAULT_PORT: u16 = 8321;
pub const ENV_PREFIX: &str = "DIVVY";

/// Longest timeout or backoff delay a client works with. Longer per-request
/// timeouts, such as `Duration::MAX`, are shortened to this.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What `check_rate_limit` does while no connection is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotReadyPolicy {
    /// Hold the request until a connection is ready or its timeout expires
    #[default]
    Queue,
    /// Fail the request at once with `NotConnected`
    FailFast,
}

impl std::str::FromStr for NotReadyPolicy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(NotReadyPolicy::Queue),
            "fail-fast" | "failfast" => Ok(NotReadyPolicy::FailFast),
            _ => Err(ClientError::InvalidConfig(format!(
                "Invalid not-ready policy: {s}. Valid options are: queue, fail-fast"
            ))),
        }
    }
}

/// Settings of a divvy client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Time allowed for establishing a TCP connection
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// Default time allowed for a reply to each request
    #[serde(rename = "request_timeout_ms", deserialize_with = "millis")]
    pub request_timeout: Duration,
    /// Text encoding of the protocol; only UTF-8 is supported
    pub encoding: String,
    /// Replace the connection after this many requests
    pub reconnect_after: Option<u64>,
    /// Log every frame sent and received
    pub debug: bool,
    pub not_ready_policy: NotReadyPolicy,
    /// Delay before the first reconnect attempt
    #[serde(rename = "reconnect_backoff_min_ms", deserialize_with = "millis")]
    pub reconnect_backoff_min: Duration,
    /// Upper bound on the delay between reconnect attempts
    #[serde(rename = "reconnect_backoff_max_ms", deserialize_with = "millis")]
    pub reconnect_backoff_max: Duration,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            encoding: "utf-8".to_string(),
            reconnect_after: None,
            debug: false,
            not_ready_policy: NotReadyPolicy::Queue,
            reconnect_backoff_min: Duration::from_millis(100),
            reconnect_backoff_max: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive: false,
        }
    }
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl ClientConfig {
    /// Load settings from `DIVVY_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load settings from an optional configuration file (any format the
    /// `config` crate understands) and `DIVVY_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .prefix_separator("_"),
        );

        let config: ClientConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// `host:port` in a form accepted by address resolution
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Check the settings for values a client cannot work with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ClientError::InvalidConfig(msg.to_string()));

        if self.host.is_empty() {
            return invalid("host must not be empty");
        }
        if self.port == 0 {
            return invalid("port must not be 0");
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect timeout must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            return invalid("request timeout must be greater than zero");
        }
        if self.connect_timeout > MAX_TIMEOUT || self.request_timeout > MAX_TIMEOUT {
            return invalid("timeouts must not exceed one year");
        }
        if !matches!(self.encoding.to_lowercase().as_str(), "utf-8" | "utf8") {
            return Err(ClientError::InvalidConfig(format!(
                "Unsupported encoding: {}. Only utf-8 is supported",
                self.encoding
            )));
        }
        if self.reconnect_after == Some(0) {
            return invalid("reconnect_after must be at least 1");
        }
        if self.reconnect_backoff_min.is_zero() {
            return invalid("minimum reconnect backoff must be greater than zero");
        }
        if self.reconnect_backoff_min > self.reconnect_backoff_max {
            return invalid("minimum reconnect backoff exceeds the maximum");
        }
        if self.reconnect_backoff_max > MAX_TIMEOUT {
            return invalid("maximum reconnect backoff must not exceed one year");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 8321);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.encoding, "utf-8");
        assert_eq!(config.reconnect_after, None);
        assert_eq!(config.not_ready_policy, NotReadyPolicy::Queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_not_ready_policy_from_str() {
        assert_eq!(NotReadyPolicy::from_str("queue").unwrap(), NotReadyPolicy::Queue);
        assert_eq!(
            NotReadyPolicy::from_str("FAIL-FAST").unwrap(),
            NotReadyPolicy::FailFast
        );
        assert!(NotReadyPolicy::from_str("retry").is_err());
    }

    #[test]
    fn test_config_validation() {
        let cases = [
            ClientConfig {
                port: 0,
                ..Default::default()
            },
            ClientConfig {
                host: String::new(),
                ..Default::default()
            },
            ClientConfig {
                request_timeout: Duration::ZERO,
                ..Default::default()
            },
            ClientConfig {
                encoding: "latin-1".to_string(),
                ..Default::default()
            },
            ClientConfig {
                reconnect_after: Some(0),
                ..Default::default()
            },
            ClientConfig {
                reconnect_backoff_min: Duration::from_secs(10),
                reconnect_backoff_max: Duration::from_secs(1),
                ..Default::default()
            },
            ClientConfig {
                request_timeout: Duration::MAX,
                ..Default::default()
            },
            ClientConfig {
                connect_timeout: MAX_TIMEOUT + Duration::from_secs(1),
                ..Default::default()
            },
            ClientConfig {
                reconnect_backoff_max: Duration::MAX,
                ..Default::default()
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(ClientError::InvalidConfig(_))),
                "{config:?} should be rejected"
            );
        }

        let config = ClientConfig {
            encoding: "UTF8".to_string(),
            reconnect_after: Some(100),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_addr_formats_ipv6() {
        let config = ClientConfig {
            host: "::1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.addr(), "[::1]:8321");
        assert_eq!(ClientConfig::default().addr(), "localhost:8321");
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("divvy-client-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "host = \"divvy.internal\"\n\
             port = 9000\n\
             request_timeout_ms = 250\n\
             reconnect_after = 500\n\
             not_ready_policy = \"fail-fast\"\n",
        )
        .unwrap();

        let config = ClientConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.host, "divvy.internal");
        assert_eq!(config.port, 9000);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.reconnect_after, Some(500));
        assert_eq!(config.not_ready_policy, NotReadyPolicy::FailFast);
    }
}
