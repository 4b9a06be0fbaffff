//! OSC (Open Sound Control) support
//!
//! The local side of the relay speaks OSC 1.0 over UDP. This module holds
//! the message model, the wire codec and the datagram listener.
//!
//! Every datagram that reaches the listener is delivered to one handler no
//! matter what its address is. Filtering is the router's job, not the
//! listener's.

mod codec;
mod listener;

pub use codec::{decode_packet, encode_packet};
pub use listener::{ListenerError, LocalListener, LocalMessageHandler};

use std::fmt;

/// A single OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum OscType {
    Int(i32),
    Float(f32),
    String(String),
    Blob(Vec<u8>),
    Long(i64),
    Double(f64),
    /// OSC 64-bit NTP time tag
    Time(u64),
    Bool(bool),
    Nil,
    Inf,
}

impl OscType {
    /// Type tag character for this argument
    pub fn tag(&self) -> char {
        match self {
            OscType::Int(_) => 'i',
            OscType::Float(_) => 'f',
            OscType::String(_) => 's',
            OscType::Blob(_) => 'b',
            OscType::Long(_) => 'h',
            OscType::Double(_) => 'd',
            OscType::Time(_) => 't',
            OscType::Bool(true) => 'T',
            OscType::Bool(false) => 'F',
            OscType::Nil => 'N',
            OscType::Inf => 'I',
        }
    }
}

impl From<bool> for OscType {
    fn from(v: bool) -> Self {
        OscType::Bool(v)
    }
}

/// An OSC message: address pattern plus arguments
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscType>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<OscType>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }
}

/// An OSC bundle
#[derive(Debug, Clone, PartialEq)]
pub struct OscBundle {
    pub timetag: u64,
    pub content: Vec<OscPacket>,
}

/// A decoded datagram: a message or a (possibly nested) bundle
#[derive(Debug, Clone, PartialEq)]
pub enum OscPacket {
    Message(OscMessage),
    Bundle(OscBundle),
}

impl OscPacket {
    /// Flatten the packet into its messages, depth first
    pub fn into_messages(self) -> Vec<OscMessage> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(self, out: &mut Vec<OscMessage>) {
        match self {
            OscPacket::Message(msg) => out.push(msg),
            OscPacket::Bundle(bundle) => {
                for packet in bundle.content {
                    packet.collect_into(out);
                }
            }
        }
    }
}

/// OSC codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscError {
    /// Datagram ended before the structure it announced
    InsufficientData,
    /// Address does not start with '/'
    InvalidAddress(String),
    /// Type tag string missing or not starting with ','
    MissingTypeTags,
    /// Type tag this codec does not understand
    UnsupportedType(char),
    /// String is not valid UTF-8
    InvalidUtf8,
    /// Bundle header or element size is malformed
    MalformedBundle(&'static str),
    /// Argument does not fit the wire representation
    TooLarge,
}

impl fmt::Display for OscError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OscError::InsufficientData => write!(f, "insufficient data in datagram"),
            OscError::InvalidAddress(a) => write!(f, "invalid OSC address: {:?}", a),
            OscError::MissingTypeTags => write!(f, "missing type tag string"),
            OscError::UnsupportedType(c) => write!(f, "unsupported type tag: {:?}", c),
            OscError::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            OscError::MalformedBundle(msg) => write!(f, "malformed bundle: {}", msg),
            OscError::TooLarge => write!(f, "argument too large"),
        }
    }
}

impl std::error::Error for OscError {}
