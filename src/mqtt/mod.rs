//! MQTT broker connection
//!
//! A single MQTT v3.1.1 client session over TCP or TLS. The connection is
//! driven by repeated calls to [`BrokerConnection::tick`], which reads
//! inbound packets, dispatches publishes and keeps the session alive.
//! Publishing can happen concurrently from another task.

mod connection;
mod tls;


pub use connection::BrokerConnection;
pub use tls::TlsError;

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{DecodeError, EncodeError, QoS};

/// Broker session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected (initial, after a clean close or an unexpected drop)
    Disconnected,
    /// TCP/TLS/CONNECT handshake in progress
    Connecting,
    /// CONNACK accepted
    Connected,
    /// Handshake refused or failed, terminal
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A PUBLISH received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Error type for broker operations
#[derive(Debug)]
pub enum BrokerError {
    /// CONNACK refused the credentials (return code 4 or 5)
    Auth(String),
    /// TCP, TLS or CONNECT handshake failed
    Network(String),
    /// Established session dropped without `disconnect` being called
    ConnectionLost(String),
    /// Operation requires a connected session
    NotConnected,
    /// Socket I/O failed
    Io(io::Error),
    /// Packet could not be encoded or decoded
    Protocol(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            BrokerError::Network(msg) => write!(f, "Network error: {}", msg),
            BrokerError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BrokerError::NotConnected => write!(f, "Not connected"),
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<EncodeError> for BrokerError {
    fn from(e: EncodeError) -> Self {
        BrokerError::Protocol(e.to_string())
    }
}

impl From<DecodeError> for BrokerError {
    fn from(e: DecodeError) -> Self {
        BrokerError::Protocol(e.to_string())
    }
}

/// Receives publishes dispatched by [`BrokerConnection::tick`]
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_broker_message(&self, message: BrokerMessage);
}
