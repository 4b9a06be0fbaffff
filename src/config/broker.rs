//! Broker Configuration
//!
//! Connection settings for the MQTT side of the relay.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::QoS;

/// Connection settings for the MQTT broker
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker host name or IP address
    pub address: String,

    /// Broker port
    pub port: u16,

    /// Keep-alive interval in seconds
    pub keepalive_seconds: u16,

    /// Wrap the connection in TLS
    pub tls: bool,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Client ID to use when connecting
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Connection timeout in seconds (TCP, TLS and CONNACK)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// QoS requested for every forward-mapped subscription
    #[serde(default)]
    pub subscribe_qos: u8,

    /// Path to CA certificate bundle (PEM). Defaults to the webpki roots.
    #[serde(default)]
    pub ca_cert: Option<String>,

    /// Server name for SNI and certificate validation (defaults to `address`)
    #[serde(default)]
    pub server_name: Option<String>,

    /// Opt-in reconnection. Without it an unexpected disconnect stops the relay.
    #[serde(default)]
    pub reconnect: Option<ReconnectConfig>,
}

fn default_client_id() -> String {
    format!("mqtt2osc-{}", std::process::id())
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 1883,
            keepalive_seconds: 30,
            tls: false,
            username: None,
            password: None,
            client_id: default_client_id(),
            connect_timeout: default_connect_timeout(),
            subscribe_qos: 0,
            ca_cert: None,
            server_name: None,
            reconnect: None,
        }
    }
}

impl BrokerConfig {
    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the keep-alive interval as Duration, `None` when disabled (0)
    pub fn keepalive_duration(&self) -> Option<Duration> {
        (self.keepalive_seconds > 0).then(|| Duration::from_secs(self.keepalive_seconds as u64))
    }

    /// Subscription QoS, capped at exactly-once
    pub fn subscribe_qos(&self) -> QoS {
        QoS::from_u8(self.subscribe_qos).unwrap_or(QoS::ExactlyOnce)
    }

    /// Name presented for SNI and matched against the server certificate
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.address)
    }

    /// `host:port` used for the TCP connection
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Reconnection policy (exponential backoff)
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// First retry delay in seconds
    #[serde(default = "default_reconnect_interval")]
    pub initial_interval: u64,

    /// Maximum retry delay in seconds
    #[serde(default = "default_max_reconnect_interval")]
    pub max_interval: u64,
}

fn default_reconnect_interval() -> u64 {
    1
}

fn default_max_reconnect_interval() -> u64 {
    60
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_reconnect_interval(),
            max_interval: default_max_reconnect_interval(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_interval_duration(&self) -> Duration {
        Duration::from_secs(self.initial_interval)
    }

    pub fn max_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_zero_disables() {
        let config = BrokerConfig {
            keepalive_seconds: 0,
            ..Default::default()
        };
        assert_eq!(config.keepalive_duration(), None);

        let config = BrokerConfig {
            keepalive_seconds: 30,
            ..Default::default()
        };
        assert_eq!(config.keepalive_duration(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_server_name_defaults_to_address() {
        let config = BrokerConfig {
            address: "broker.example.com".to_string(),
            port: 8883,
            ..Default::default()
        };
        assert_eq!(config.tls_server_name(), "broker.example.com");
        assert_eq!(config.socket_address(), "broker.example.com:8883");

        let config = BrokerConfig {
            server_name: Some("mqtt.example.net".to_string()),
            ..config
        };
        assert_eq!(config.tls_server_name(), "mqtt.example.net");
    }

    #[test]
    fn test_subscribe_qos_capped() {
        let config = BrokerConfig {
            subscribe_qos: 7,
            ..Default::default()
        };
        assert_eq!(config.subscribe_qos(), QoS::ExactlyOnce);
        assert_eq!(BrokerConfig::default().subscribe_qos(), QoS::AtMostOnce);
    }
}
