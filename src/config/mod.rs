//! Configuration Module
//!
//! Provides TOML-based configuration for mqtt2osc with support for:
//! - Broker connection settings (TLS, credentials, keep-alive)
//! - Local OSC endpoint (listen and publish ports)
//! - Forward and reverse topic mappings
//! - In-file environment variable substitution (`${VAR}`, `${VAR:-default}`)
//!
//! Topic mapping keys are exact strings that may contain '/', '+' and '#',
//! so the file is deserialized with `toml` directly and never flattened
//! into dotted keys.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use fnv::FnvHasher;
use regex::Regex;
use serde::{Deserialize, Deserializer};

pub use broker::{BrokerConfig, ReconnectConfig};

mod broker;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error (includes missing required fields)
    Parse(toml::de::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// One direction of the mapping table. `None` marks an observe-only key.
pub type RouteTable = BTreeMap<String, Option<String>>;

/// TOML has no null, so an empty string stands for "no paired endpoint".
fn deserialize_routes<'de, D>(deserializer: D) -> Result<RouteTable, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let value = value.trim();
            let value = (!value.is_empty()).then(|| value.to_string());
            (key, value)
        })
        .collect())
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Relay runtime settings
    #[serde(default)]
    pub relay: RelayConfig,
    /// MQTT broker connection
    pub broker: BrokerConfig,
    /// Local OSC endpoint
    pub local: LocalConfig,
    /// Broker topic -> OSC address
    #[serde(deserialize_with = "deserialize_routes")]
    pub forward_topics: RouteTable,
    /// OSC address -> broker topic
    #[serde(deserialize_with = "deserialize_routes")]
    pub reverse_topics: RouteTable,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Relay runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Sender id stamped into outgoing ping payloads
    /// (derived from the hostname if not set)
    pub node_id: Option<u64>,

    /// Upper bound on one network tick (e.g., "500ms")
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Default grace period when joining the relay units on shutdown
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            tick_interval: default_tick_interval(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl RelayConfig {
    /// Get the node ID, deriving it from the hostname if not set
    pub fn resolve_node_id(&self) -> u64 {
        self.node_id.unwrap_or_else(|| {
            hostname::get()
                .map(|h| node_id_from_name(&h.to_string_lossy()))
                .unwrap_or_else(|_| u64::from(std::process::id()))
        })
    }
}

/// FNV-1a of a host name, stable across restarts of the same machine
pub fn node_id_from_name(name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Local OSC endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Address the listener binds to
    pub bind_address: IpAddr,
    /// Port OSC messages are sent to
    pub publish_port: u16,
    /// Port the listener receives on
    pub listen_port: u16,
    /// Host OSC messages are sent to (defaults to `bind_address`)
    #[serde(default)]
    pub publish_address: Option<IpAddr>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            publish_port: 9000,
            listen_port: 9001,
            publish_address: None,
        }
    }
}

impl LocalConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    pub fn publish_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.publish_address.unwrap_or(self.bind_address),
            self.publish_port,
        )
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are substituted before
    /// parsing, so secrets such as the broker password can stay out of
    /// the file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&substitute_env_vars(&content))
    }

    /// Parse configuration from a string (no env var substitution)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.address.is_empty() {
            return Err(ConfigError::Validation(
                "broker.address must not be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Validation(
                "broker.port must not be 0".to_string(),
            ));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(ConfigError::Validation(
                "broker.password requires broker.username".to_string(),
            ));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id must not be empty".to_string(),
            ));
        }
        if self.broker.subscribe_qos > 2 {
            return Err(ConfigError::Validation(
                "broker.subscribe_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if let Some(ref reconnect) = self.broker.reconnect {
            if reconnect.initial_interval == 0 || reconnect.initial_interval > reconnect.max_interval
            {
                return Err(ConfigError::Validation(
                    "broker.reconnect requires 0 < initial_interval <= max_interval".to_string(),
                ));
            }
        }

        if self.local.publish_port == 0 || self.local.listen_port == 0 {
            return Err(ConfigError::Validation(
                "local.publish_port and local.listen_port must not be 0".to_string(),
            ));
        }

        if self.relay.tick_interval.is_zero() {
            return Err(ConfigError::Validation(
                "relay.tick_interval must be greater than 0".to_string(),
            ));
        }

        for (topic, address) in &self.forward_topics {
            if topic.is_empty() {
                return Err(ConfigError::Validation(
                    "forward_topics contains an empty topic".to_string(),
                ));
            }
            if let Some(address) = address {
                if !address.starts_with('/') {
                    return Err(ConfigError::Validation(format!(
                        "forward_topics['{}']: OSC address '{}' must start with '/'",
                        topic, address
                    )));
                }
            }
        }

        for (address, topic) in &self.reverse_topics {
            if !address.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "reverse_topics: OSC address '{}' must start with '/'",
                    address
                )));
            }
            if let Some(topic) = topic {
                if topic.contains(['+', '#']) {
                    return Err(ConfigError::Validation(format!(
                        "reverse_topics['{}']: cannot publish to wildcard topic '{}'",
                        address, topic
                    )));
                }
            }
        }

        Ok(())
    }
}
