//! Relay error taxonomy
//!
//! Module errors convert into [`RelayError`] at the bridge boundary.

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::mqtt::BrokerError;
use crate::osc::ListenerError;
use crate::payload::PayloadError;

/// Crate-level error
#[derive(Debug)]
pub enum RelayError {
    /// Configuration could not be loaded or is invalid
    Config(ConfigError),
    /// Broker refused the credentials
    Auth(String),
    /// Broker connection failed or dropped
    Network(String),
    /// Local listen address could not be bound
    Bind(io::Error),
    /// Ping payload could not be decoded
    Decode(PayloadError),
    /// Publish attempted without a broker session
    NotConnected,
    /// Lifecycle operation not valid in the current state
    InvalidState(&'static str),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Config(e) => write!(f, "Config error: {}", e),
            RelayError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            RelayError::Network(msg) => write!(f, "Network error: {}", msg),
            RelayError::Bind(e) => write!(f, "Bind error: {}", e),
            RelayError::Decode(e) => write!(f, "Decode error: {}", e),
            RelayError::NotConnected => write!(f, "Not connected to broker"),
            RelayError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        RelayError::Config(e)
    }
}

impl From<PayloadError> for RelayError {
    fn from(e: PayloadError) -> Self {
        RelayError::Decode(e)
    }
}

impl From<BrokerError> for RelayError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Auth(msg) => RelayError::Auth(msg),
            BrokerError::NotConnected => RelayError::NotConnected,
            BrokerError::Network(msg) | BrokerError::ConnectionLost(msg) => {
                RelayError::Network(msg)
            }
            other => RelayError::Network(other.to_string()),
        }
    }
}

impl From<ListenerError> for RelayError {
    fn from(e: ListenerError) -> Self {
        match e {
            ListenerError::Bind(_, e) => RelayError::Bind(e),
            other => RelayError::Network(other.to_string()),
        }
    }
}
