//! Configuration types for the AMQP integration harness.
//!
//! Configuration is loaded from YAML files and validated before use. Every
//! section has defaults, so an empty document targets a local broker with
//! the guest identity.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::broker::{DeclareOptions, ExchangeKind};
use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the harness.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Broker connection configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Routing resource declaration parameters.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Bounded receive configuration.
    #[serde(default)]
    pub receive: ReceiveConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Broker host name.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker AMQP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Virtual host.
    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Username. Supports environment variable expansion: "${AMQP_USER}"
    #[serde(default = "default_guest")]
    pub username: String,

    /// Password. Supports environment variable expansion: "${AMQP_PASSWORD}"
    #[serde(default = "default_guest")]
    pub password: String,

    /// Full AMQP URI. Takes precedence over the individual fields when set.
    #[serde(default)]
    pub uri: Option<String>,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// Declaration parameters for the routing resources the harness provisions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Name prefix of the inbound route.
    #[serde(default = "default_inbound_prefix")]
    pub inbound_prefix: String,

    /// Name prefix of the outbound route.
    #[serde(default = "default_outbound_prefix")]
    pub outbound_prefix: String,

    /// Exchange type. Fanout gives one-to-one delivery regardless of routing key.
    #[serde(default)]
    pub exchange_kind: ExchangeKind,

    /// Survive broker restart.
    #[serde(default = "default_durable")]
    pub durable: bool,

    /// Remove when the last consumer or binding goes away.
    #[serde(default)]
    pub auto_delete: bool,
}

/// Bounded receive configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiveConfig {
    /// Default wait for [`IntegrationHarness::receive`](crate::harness::IntegrationHarness::receive).
    #[serde(default = "default_receive_timeout_ms")]
    pub timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default value functions

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

// That's who you are if you don't use an explicit name.
fn default_guest() -> String {
    "guest".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_inbound_prefix() -> String {
    "inbound".to_string()
}

fn default_outbound_prefix() -> String {
    "outbound".to_string()
}

fn default_durable() -> bool {
    true
}

fn default_receive_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            username: default_guest(),
            password: default_guest(),
            uri: None,
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            inbound_prefix: default_inbound_prefix(),
            outbound_prefix: default_outbound_prefix(),
            exchange_kind: ExchangeKind::default(),
            durable: default_durable(),
            auto_delete: false,
        }
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_receive_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl BrokerConfig {
    /// Get the username with environment variables expanded.
    #[must_use]
    pub fn username(&self) -> String {
        expand_env_vars(&self.username)
    }

    /// Get the password with environment variables expanded.
    #[must_use]
    pub fn password(&self) -> String {
        expand_env_vars(&self.password)
    }

    /// The AMQP URI to connect to.
    ///
    /// Returns the expanded `uri` override if set, otherwise builds one from
    /// the individual fields.
    #[must_use]
    pub fn uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return expand_env_vars(uri);
        }
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username()),
            urlencoding::encode(&self.password()),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }

    /// The broker location without credentials, for logging.
    #[must_use]
    pub fn display_target(&self) -> String {
        match &self.uri {
            Some(uri) => match Url::parse(&expand_env_vars(uri)) {
                Ok(mut url) => {
                    // Only fails for URLs without a host, which carry no userinfo.
                    let _ = url.set_username("");
                    let _ = url.set_password(None);
                    url.to_string()
                }
                Err(_) => "<unparseable broker uri>".to_string(),
            },
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// Connection timeout as a [`Duration`].
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl RoutingConfig {
    /// Declaration flags for exchanges and queues.
    #[must_use]
    pub fn declare_options(&self) -> DeclareOptions {
        DeclareOptions {
            durable: self.durable,
            auto_delete: self.auto_delete,
        }
    }
}

impl ReceiveConfig {
    /// Default receive timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// Configuration loading and validation

impl HarnessConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.broker.uri.is_none() {
            if self.broker.host.trim().is_empty() {
                return Err(ConfigError::EmptyHost);
            }
            if self.broker.port == 0 {
                return Err(ConfigError::InvalidPort);
            }
            if self.broker.username().is_empty() {
                return Err(ConfigError::EmptyCredential {
                    field: "broker.username",
                });
            }
            if self.broker.password().is_empty() {
                return Err(ConfigError::EmptyCredential {
                    field: "broker.password",
                });
            }
        }
        if self.broker.connection_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "broker.connection_timeout_ms",
            });
        }
        if self.receive.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "receive.timeout_ms",
            });
        }
        self.routing.validate()
    }
}

impl RoutingConfig {
    /// Validate the routing prefixes.
    ///
    /// # Errors
    ///
    /// Returns an error if a prefix is empty, contains whitespace, or both
    /// prefixes are equal.
    pub fn validate(&self) -> ConfigResult<()> {
        for prefix in [&self.inbound_prefix, &self.outbound_prefix] {
            if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
                return Err(ConfigError::InvalidPrefix(prefix.clone()));
            }
        }
        if self.inbound_prefix == self.outbound_prefix {
            return Err(ConfigError::DuplicatePrefix(self.inbound_prefix.clone()));
        }
        Ok(())
    }
}
