//! # Error Types
//!
//! Error handling for the MQTT codec, the channel layer and the proxy.
//!
//! ## Error Categories
//! - **Frame Errors**: bytes that cannot be parsed as an MQTT frame. Fatal to the
//!   one connection they arrived on, never to a whole session.
//! - **Connection Errors**: I/O failures, closed channels, timeouts
//! - **Configuration Errors**: invalid or unreadable proxy configuration
//!
//! Protocol mismatches between a joining client and its session are not errors
//! in this sense: they are answered with a CONNACK return code on the wire.
//!
//! ## Example Usage
//! ```rust
//! use mqtt_cluster_proxy::core::codec::parse;
//! use mqtt_cluster_proxy::error::ProtocolError;
//!
//! match parse(&[0x30]) {
//!     Err(ProtocolError::MalformedFrame(reason)) => println!("dropping connection: {reason}"),
//!     other => println!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Frame errors
    pub const ERR_TRUNCATED_FRAME: &str = "Frame truncated";
    pub const ERR_RESERVED_TYPE: &str = "Reserved message type";
    pub const ERR_INVALID_QOS: &str = "Invalid QoS value";
    pub const ERR_REMAINING_LENGTH: &str = "Remaining length exceeds four bytes";
    pub const ERR_TRAILING_BYTES: &str = "Trailing bytes after message body";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";

    /// Connection errors
    pub const ERR_HANDSHAKE_TIMEOUT: &str = "No CONNECT received before handshake timeout";
    pub const ERR_NOT_CONNECT: &str = "First message on a connection must be CONNECT";

    /// Session errors
    pub const ERR_IDS_EXHAUSTED: &str = "No free broker message identifier";
}

// ProtocolError is the primary error type for all codec, channel and proxy operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Remaining length too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::MalformedFrame`] carrying a static reason
    pub(crate) fn malformed(reason: &str) -> Self {
        ProtocolError::MalformedFrame(reason.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
