//! # MQTT Messages
//!
//! Typed form of every MQTT 3.1 / 3.1.1 control packet.
//!
//! A [`Message`] carries the fixed-header flags shared by all packet kinds
//! (`duplicate`, `qos`, `retain`) plus a [`Body`] holding the type-specific
//! fields. The wire type ordinal is derived from the body variant, so a message
//! can never disagree with its own type.
//!
//! Once parsed, only the message identifier (see [`Message::set_message_id`])
//! and publish payload are expected to change; the proxy rewrites identifiers
//! in place when moving messages between the client and broker id domains.

use bytes::Bytes;

use crate::error::{constants, ProtocolError, Result};

/// Largest value the remaining-length field can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Protocol name used by MQTT 3.1 clients
pub const PROTOCOL_NAME_V31: &str = "MQIsdp";

/// Protocol name used by MQTT 3.1.1 clients
pub const PROTOCOL_NAME_V311: &str = "MQTT";

/// The sixteen fixed-header type ordinals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl MessageType {
    /// Map a fixed-header ordinal to a type. Ordinals 0 and 15 are reserved.
    pub fn from_ordinal(ordinal: u8) -> Result<Self> {
        Ok(match ordinal {
            1 => MessageType::Connect,
            2 => MessageType::ConnAck,
            3 => MessageType::Publish,
            4 => MessageType::PubAck,
            5 => MessageType::PubRec,
            6 => MessageType::PubRel,
            7 => MessageType::PubComp,
            8 => MessageType::Subscribe,
            9 => MessageType::SubAck,
            10 => MessageType::Unsubscribe,
            11 => MessageType::UnsubAck,
            12 => MessageType::PingReq,
            13 => MessageType::PingResp,
            14 => MessageType::Disconnect,
            other => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "{} {other}",
                    constants::ERR_RESERVED_TYPE
                )))
            }
        })
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Connect => "CONNECT",
            MessageType::ConnAck => "CONNACK",
            MessageType::Publish => "PUBLISH",
            MessageType::PubAck => "PUBACK",
            MessageType::PubRec => "PUBREC",
            MessageType::PubRel => "PUBREL",
            MessageType::PubComp => "PUBCOMP",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::SubAck => "SUBACK",
            MessageType::Unsubscribe => "UNSUBSCRIBE",
            MessageType::UnsubAck => "UNSUBACK",
            MessageType::PingReq => "PINGREQ",
            MessageType::PingResp => "PINGRESP",
            MessageType::Disconnect => "DISCONNECT",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedFrame(format!(
                "{} {value}",
                constants::ERR_INVALID_QOS
            ))),
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }
}

/// CONNACK return codes.
///
/// Values outside the range MQTT 3.1 defines are kept verbatim in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Other(u8),
}

impl ConnectReturnCode {
    /// Generic rejection the proxy uses for mismatches without a dedicated code
    pub const OTHER: ConnectReturnCode = ConnectReturnCode::Other(0xFF);

    pub fn value(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadCredentials => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Other(value) => value,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

impl From<u8> for ConnectReturnCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadCredentials,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Other(other),
        }
    }
}

/// Last-will message registered by a CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT variable header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    /// Keep-alive interval in seconds, 0 disables it
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Connect {
    /// An MQTT 3.1.1 CONNECT with no will and no credentials
    pub fn new<S: Into<String>>(client_id: S, clean_session: bool, keep_alive: u16) -> Self {
        Self {
            protocol_name: PROTOCOL_NAME_V311.to_string(),
            protocol_version: 4,
            clean_session,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials<S: Into<String>>(mut self, username: S, password: Option<S>) -> Self {
        self.username = Some(username.into());
        self.password = password.map(Into::into);
        self
    }

    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// The connect-flags byte of the variable header
    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= 0x80;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if let Some(will) = &self.will {
            if will.retain {
                flags |= 0x20;
            }
            flags |= will.qos.value() << 3;
            flags |= 0x04;
        }
        if self.clean_session {
            flags |= 0x02;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// MQTT 3.1.1 session-present bit; always false for 3.1 brokers
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    /// Only carried on the wire when QoS > 0; zero otherwise
    pub message_id: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub message_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// One entry of a SUBACK's granted QoS list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantedQos {
    Granted(QoS),
    /// 0x80, subscription refused by the broker (3.1.1)
    Failure,
}

impl GrantedQos {
    pub fn value(self) -> u8 {
        match self {
            GrantedQos::Granted(qos) => qos.value(),
            GrantedQos::Failure => 0x80,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(GrantedQos::Failure),
            other => QoS::from_u8(other).map(GrantedQos::Granted),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub message_id: u16,
    pub granted_qos: Vec<GrantedQos>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub topics: Vec<String>,
}

/// Type-specific part of a message, one variant per MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

/// A complete MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub duplicate: bool,
    pub qos: QoS,
    pub retain: bool,
    pub body: Body,
}

impl Message {
    /// Wrap a body with all fixed-header flags cleared
    pub fn new(body: Body) -> Self {
        Self {
            duplicate: false,
            qos: QoS::AtMostOnce,
            retain: false,
            body,
        }
    }

    pub fn connect(connect: Connect) -> Self {
        Self::new(Body::Connect(connect))
    }

    pub fn connack(return_code: ConnectReturnCode) -> Self {
        Self::new(Body::ConnAck(ConnAck {
            session_present: false,
            return_code,
        }))
    }

    pub fn publish<T: Into<String>, P: Into<Bytes>>(
        topic: T,
        payload: P,
        qos: QoS,
        message_id: u16,
    ) -> Self {
        Self {
            duplicate: false,
            qos,
            retain: false,
            body: Body::Publish(Publish {
                topic: topic.into(),
                message_id: if qos == QoS::AtMostOnce { 0 } else { message_id },
                payload: payload.into(),
            }),
        }
    }

    pub fn puback(message_id: u16) -> Self {
        Self::new(Body::PubAck(message_id))
    }

    /// SUBSCRIBE always travels with QoS 1 in its fixed header
    pub fn subscribe(message_id: u16, subscriptions: Vec<Subscription>) -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            ..Self::new(Body::Subscribe(Subscribe {
                message_id,
                subscriptions,
            }))
        }
    }

    pub fn suback(message_id: u16, granted_qos: Vec<GrantedQos>) -> Self {
        Self::new(Body::SubAck(SubAck {
            message_id,
            granted_qos,
        }))
    }

    /// UNSUBSCRIBE always travels with QoS 1 in its fixed header
    pub fn unsubscribe(message_id: u16, topics: Vec<String>) -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            ..Self::new(Body::Unsubscribe(Unsubscribe { message_id, topics }))
        }
    }

    pub fn unsuback(message_id: u16) -> Self {
        Self::new(Body::UnsubAck(message_id))
    }

    pub fn pingreq() -> Self {
        Self::new(Body::PingReq)
    }

    pub fn pingresp() -> Self {
        Self::new(Body::PingResp)
    }

    pub fn disconnect() -> Self {
        Self::new(Body::Disconnect)
    }

    pub fn message_type(&self) -> MessageType {
        match &self.body {
            Body::Connect(_) => MessageType::Connect,
            Body::ConnAck(_) => MessageType::ConnAck,
            Body::Publish(_) => MessageType::Publish,
            Body::PubAck(_) => MessageType::PubAck,
            Body::PubRec(_) => MessageType::PubRec,
            Body::PubRel(_) => MessageType::PubRel,
            Body::PubComp(_) => MessageType::PubComp,
            Body::Subscribe(_) => MessageType::Subscribe,
            Body::SubAck(_) => MessageType::SubAck,
            Body::Unsubscribe(_) => MessageType::Unsubscribe,
            Body::UnsubAck(_) => MessageType::UnsubAck,
            Body::PingReq => MessageType::PingReq,
            Body::PingResp => MessageType::PingResp,
            Body::Disconnect => MessageType::Disconnect,
        }
    }

    /// The 16-bit message identifier, for the kinds that carry one
    pub fn message_id(&self) -> Option<u16> {
        match &self.body {
            Body::Publish(publish) if self.qos != QoS::AtMostOnce => Some(publish.message_id),
            Body::PubAck(id)
            | Body::PubRec(id)
            | Body::PubRel(id)
            | Body::PubComp(id)
            | Body::UnsubAck(id) => Some(*id),
            Body::Subscribe(subscribe) => Some(subscribe.message_id),
            Body::SubAck(suback) => Some(suback.message_id),
            Body::Unsubscribe(unsubscribe) => Some(unsubscribe.message_id),
            _ => None,
        }
    }

    /// Overwrite the message identifier in place. No-op for kinds without one.
    pub fn set_message_id(&mut self, message_id: u16) {
        let qos = self.qos;
        match &mut self.body {
            Body::Publish(publish) if qos != QoS::AtMostOnce => publish.message_id = message_id,
            Body::PubAck(id)
            | Body::PubRec(id)
            | Body::PubRel(id)
            | Body::PubComp(id)
            | Body::UnsubAck(id) => *id = message_id,
            Body::Subscribe(subscribe) => subscribe.message_id = message_id,
            Body::SubAck(suback) => suback.message_id = message_id,
            Body::Unsubscribe(unsubscribe) => unsubscribe.message_id = message_id,
            _ => {}
        }
    }

    /// True for requests the peer must acknowledge: PUBLISH with QoS > 0,
    /// SUBSCRIBE and UNSUBSCRIBE.
    pub fn is_ackable(&self) -> bool {
        match &self.body {
            Body::Publish(_) => self.qos != QoS::AtMostOnce,
            Body::Subscribe(_) | Body::Unsubscribe(_) => true,
            _ => false,
        }
    }

    /// True for messages that complete an acknowledged exchange
    pub fn is_ack(&self) -> bool {
        matches!(
            self.body,
            Body::PubAck(_) | Body::SubAck(_) | Body::UnsubAck(_) | Body::PubComp(_)
        )
    }

    /// Size in bytes of the variable header plus payload
    pub fn remaining_length(&self) -> usize {
        fn string_len(value: &str) -> usize {
            2 + value.len()
        }

        match &self.body {
            Body::Connect(connect) => {
                let mut len = string_len(&connect.protocol_name) + 1 + 1 + 2;
                len += string_len(&connect.client_id);
                if let Some(will) = &connect.will {
                    len += string_len(&will.topic) + 2 + will.payload.len();
                }
                if let Some(username) = &connect.username {
                    len += string_len(username);
                }
                if let Some(password) = &connect.password {
                    len += string_len(password);
                }
                len
            }
            Body::ConnAck(_) => 2,
            Body::Publish(publish) => {
                let id_len = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
                string_len(&publish.topic) + id_len + publish.payload.len()
            }
            Body::PubAck(_)
            | Body::PubRec(_)
            | Body::PubRel(_)
            | Body::PubComp(_)
            | Body::UnsubAck(_) => 2,
            Body::Subscribe(subscribe) => {
                2 + subscribe
                    .subscriptions
                    .iter()
                    .map(|s| string_len(&s.topic) + 1)
                    .sum::<usize>()
            }
            Body::SubAck(suback) => 2 + suback.granted_qos.len(),
            Body::Unsubscribe(unsubscribe) => {
                2 + unsubscribe
                    .topics
                    .iter()
                    .map(|t| string_len(t))
                    .sum::<usize>()
            }
            Body::PingReq | Body::PingResp | Body::Disconnect => 0,
        }
    }

    /// A CONNACK that tells the client to go away
    pub fn is_rejecting_connack(&self) -> bool {
        matches!(&self.body, Body::ConnAck(ack) if !ack.return_code.is_accepted())
    }
}
