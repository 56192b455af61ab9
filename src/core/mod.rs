//! # Core Protocol Components
//!
//! The MQTT wire codec: typed messages, frame parsing/encoding and the
//! primitives both are built from.
//!
//! ## Components
//! - **Message**: sum type over the fourteen MQTT control packets
//! - **Codec**: whole-frame `parse`/`encode` plus a tokio-util codec for byte streams
//! - **Wire**: remaining-length encoding, length-prefixed strings
//!
//! ## Wire Format
//! ```text
//! [Type|Flags(1)] [Remaining Length(1-4)] [Variable Header + Payload(N)]
//! ```
//!
//! ## Limits
//! - Remaining length: 0..=268,435,455 (four 7-bit digits)
//! - Strings and will payloads: 65,535 bytes (16-bit length prefix)

pub mod codec;
pub mod message;
pub mod wire;

pub use codec::{encode, parse, MqttCodec};
pub use message::{
    Body, ConnAck, Connect, ConnectReturnCode, GrantedQos, Message, MessageType, Publish, QoS,
    SubAck, Subscribe, Subscription, Unsubscribe, Will,
};
