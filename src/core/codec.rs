//! # MQTT Codec
//!
//! Bit-exact translation between bytes and [`Message`]s.
//!
//! ## Wire Format
//! ```text
//! [type:4 | dup:1 | qos:2 | retain:1] [remaining length: 1-4 bytes] [body: remaining length bytes]
//! ```
//!
//! [`parse`] and [`encode`] work on whole frames. [`MqttCodec`] adapts them to
//! tokio-util's `Decoder`/`Encoder` for framing over byte streams: it waits for
//! a complete frame, refuses frames larger than its configured limit before
//! buffering them, and splits exactly one frame off the read buffer per call.
//!
//! Any malformed input is reported as [`ProtocolError::MalformedFrame`]; callers
//! drop the connection, no resynchronisation is attempted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::message::{
    Body, ConnAck, Connect, ConnectReturnCode, GrantedQos, Message, MessageType, Publish, QoS,
    SubAck, Subscribe, Subscription, Unsubscribe, Will, MAX_REMAINING_LENGTH,
};
use crate::core::wire::{
    decode_remaining_length, encode_remaining_length, put_binary, put_string,
    remaining_length_size, WireReader,
};
use crate::error::{constants, ProtocolError, Result};

/// Parse one complete frame. Bytes after the frame are ignored.
pub fn parse(buf: &[u8]) -> Result<Message> {
    let header = *buf
        .first()
        .ok_or_else(|| ProtocolError::malformed(constants::ERR_TRUNCATED_FRAME))?;
    let (remaining_length, len_bytes) = decode_remaining_length(&buf[1..])?
        .ok_or_else(|| ProtocolError::malformed(constants::ERR_TRUNCATED_FRAME))?;

    let start = 1 + len_bytes;
    let body = buf.get(start..start + remaining_length).ok_or_else(|| {
        ProtocolError::MalformedFrame(format!(
            "Frame truncated: remaining length {remaining_length}, have {}",
            buf.len() - start
        ))
    })?;

    parse_body(header, body)
}

/// Parse a frame given its fixed-header byte and exactly `remainingLength` body bytes.
pub fn parse_body(header: u8, body: &[u8]) -> Result<Message> {
    let message_type = MessageType::from_ordinal(header >> 4)?;
    let duplicate = header & 0x08 != 0;
    let qos = QoS::from_u8((header >> 1) & 0x03)?;
    let retain = header & 0x01 != 0;

    let mut reader = WireReader::new(body);
    let body = match message_type {
        MessageType::Connect => Body::Connect(parse_connect(&mut reader)?),
        MessageType::ConnAck => {
            let flags = reader.read_u8()?;
            let code = reader.read_u8()?;
            Body::ConnAck(ConnAck {
                session_present: flags & 0x01 != 0,
                return_code: ConnectReturnCode::from(code),
            })
        }
        MessageType::Publish => {
            let topic = reader.read_string()?;
            let message_id = if qos == QoS::AtMostOnce {
                0
            } else {
                reader.read_u16()?
            };
            let payload = Bytes::copy_from_slice(reader.read_rest());
            Body::Publish(Publish {
                topic,
                message_id,
                payload,
            })
        }
        MessageType::PubAck => Body::PubAck(reader.read_u16()?),
        MessageType::PubRec => Body::PubRec(reader.read_u16()?),
        MessageType::PubRel => Body::PubRel(reader.read_u16()?),
        MessageType::PubComp => Body::PubComp(reader.read_u16()?),
        MessageType::Subscribe => {
            let message_id = reader.read_u16()?;
            let mut subscriptions = Vec::new();
            while reader.remaining() > 0 {
                let topic = reader.read_string()?;
                let qos = QoS::from_u8(reader.read_u8()?)?;
                subscriptions.push(Subscription { topic, qos });
            }
            Body::Subscribe(Subscribe {
                message_id,
                subscriptions,
            })
        }
        MessageType::SubAck => {
            let message_id = reader.read_u16()?;
            let granted_qos = reader
                .read_rest()
                .iter()
                .map(|&b| GrantedQos::from_u8(b))
                .collect::<Result<Vec<_>>>()?;
            Body::SubAck(SubAck {
                message_id,
                granted_qos,
            })
        }
        MessageType::Unsubscribe => {
            let message_id = reader.read_u16()?;
            let mut topics = Vec::new();
            while reader.remaining() > 0 {
                topics.push(reader.read_string()?);
            }
            Body::Unsubscribe(Unsubscribe { message_id, topics })
        }
        MessageType::UnsubAck => Body::UnsubAck(reader.read_u16()?),
        MessageType::PingReq => Body::PingReq,
        MessageType::PingResp => Body::PingResp,
        MessageType::Disconnect => Body::Disconnect,
    };
    reader.finish()?;

    Ok(Message {
        duplicate,
        qos,
        retain,
        body,
    })
}

fn parse_connect(reader: &mut WireReader<'_>) -> Result<Connect> {
    let protocol_name = reader.read_string()?;
    let protocol_version = reader.read_u8()?;
    let flags = reader.read_u8()?;
    let keep_alive = reader.read_u16()?;
    let client_id = reader.read_string()?;

    let will = if flags & 0x04 != 0 {
        let topic = reader.read_string()?;
        let payload = reader.read_binary()?;
        Some(Will {
            topic,
            payload,
            qos: QoS::from_u8((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(reader.read_string()?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(reader.read_string()?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_version,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

/// Serialize a message into a new buffer.
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    encode_into(message, &mut dst)?;
    Ok(dst.freeze())
}

/// Append the wire form of `message` to `dst`.
///
/// Nothing is written when the message cannot be encoded.
pub fn encode_into(message: &Message, dst: &mut BytesMut) -> Result<()> {
    let remaining_length = message.remaining_length();
    let len_size = remaining_length_size(remaining_length)?;
    dst.reserve(1 + len_size + remaining_length);

    let start = dst.len();
    let result = write_frame(message, remaining_length, dst);
    if result.is_err() {
        dst.truncate(start);
    }
    result
}

fn write_frame(message: &Message, remaining_length: usize, dst: &mut BytesMut) -> Result<()> {
    let mut header = message.message_type().ordinal() << 4;
    if message.duplicate {
        header |= 0x08;
    }
    header |= message.qos.value() << 1;
    if message.retain {
        header |= 0x01;
    }
    dst.put_u8(header);
    encode_remaining_length(remaining_length, dst)?;

    match &message.body {
        Body::Connect(connect) => {
            put_string(dst, &connect.protocol_name)?;
            dst.put_u8(connect.protocol_version);
            dst.put_u8(connect.flags());
            dst.put_u16(connect.keep_alive);
            put_string(dst, &connect.client_id)?;
            if let Some(will) = &connect.will {
                put_string(dst, &will.topic)?;
                put_binary(dst, &will.payload)?;
            }
            if let Some(username) = &connect.username {
                put_string(dst, username)?;
            }
            if let Some(password) = &connect.password {
                put_string(dst, password)?;
            }
        }
        Body::ConnAck(ack) => {
            dst.put_u8(u8::from(ack.session_present));
            dst.put_u8(ack.return_code.value());
        }
        Body::Publish(publish) => {
            put_string(dst, &publish.topic)?;
            if message.qos != QoS::AtMostOnce {
                dst.put_u16(publish.message_id);
            }
            dst.put_slice(&publish.payload);
        }
        Body::PubAck(id)
        | Body::PubRec(id)
        | Body::PubRel(id)
        | Body::PubComp(id)
        | Body::UnsubAck(id) => dst.put_u16(*id),
        Body::Subscribe(subscribe) => {
            dst.put_u16(subscribe.message_id);
            for subscription in &subscribe.subscriptions {
                put_string(dst, &subscription.topic)?;
                dst.put_u8(subscription.qos.value());
            }
        }
        Body::SubAck(suback) => {
            dst.put_u16(suback.message_id);
            for granted in &suback.granted_qos {
                dst.put_u8(granted.value());
            }
        }
        Body::Unsubscribe(unsubscribe) => {
            dst.put_u16(unsubscribe.message_id);
            for topic in &unsubscribe.topics {
                put_string(dst, topic)?;
            }
        }
        Body::PingReq | Body::PingResp | Body::Disconnect => {}
    }
    Ok(())
}

/// Streaming MQTT framing for `Framed`, `FramedRead` and `FramedWrite`
#[derive(Debug, Clone, Copy)]
pub struct MqttCodec {
    max_remaining_length: usize,
}

impl MqttCodec {
    pub fn new() -> Self {
        Self {
            max_remaining_length: MAX_REMAINING_LENGTH,
        }
    }

    /// Refuse incoming frames whose body exceeds `max_remaining_length` bytes
    pub fn with_max_remaining_length(max_remaining_length: usize) -> Self {
        Self {
            max_remaining_length: max_remaining_length.min(MAX_REMAINING_LENGTH),
        }
    }

    pub fn max_remaining_length(&self) -> usize {
        self.max_remaining_length
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MqttCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let Some((remaining_length, len_bytes)) = decode_remaining_length(&src[1..])? else {
            return Ok(None);
        };

        if remaining_length > self.max_remaining_length {
            return Err(ProtocolError::OversizedPacket(remaining_length));
        }

        let frame_len = 1 + len_bytes + remaining_length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        let header = frame[0];
        let mut body = frame.freeze();
        body.advance(1 + len_bytes);
        parse_body(header, &body).map(Some)
    }
}

impl Encoder<Message> for MqttCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        encode_into(&message, dst)
    }
}
