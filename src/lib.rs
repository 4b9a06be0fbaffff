//! mqtt2osc - Bidirectional relay between an MQTT broker and OSC over UDP
//!
//! Broker messages on mapped topics pulse OSC addresses on the local side;
//! OSC flags on mapped addresses publish timestamped pings to the broker.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod osc;
pub mod payload;
pub mod protocol;

pub use bridge::{Bridge, DefaultHandler, RelayContext, RelayHandler, RelayState, TopicRouter};
pub use config::Config;
pub use error::RelayError;
pub use mqtt::{BrokerConnection, BrokerMessage, ConnectionState};
pub use osc::{LocalListener, OscMessage, OscType};
pub use payload::PingPayload;
pub use protocol::QoS;
