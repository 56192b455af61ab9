//! Low-level wire primitives: the variable-length remaining-length field,
//! length-prefixed strings and big-endian identifiers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::message::MAX_REMAINING_LENGTH;
use crate::error::{constants, ProtocolError, Result};

/// Number of bytes the remaining-length field occupies for `len`.
pub fn remaining_length_size(len: usize) -> Result<usize> {
    match len {
        0..=127 => Ok(1),
        128..=16_383 => Ok(2),
        16_384..=2_097_151 => Ok(3),
        2_097_152..=MAX_REMAINING_LENGTH => Ok(4),
        _ => Err(ProtocolError::OversizedPacket(len)),
    }
}

/// Append the minimal encoding of `len` to `dst`, returning the byte count.
pub fn encode_remaining_length(mut len: usize, dst: &mut BytesMut) -> Result<usize> {
    let size = remaining_length_size(len)?;
    for _ in 0..size {
        let mut digit = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            digit |= 0x80;
        }
        dst.put_u8(digit);
    }
    Ok(size)
}

/// Decode a remaining-length field from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the field does, otherwise the
/// value and the number of bytes the field used.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(ProtocolError::malformed(constants::ERR_REMAINING_LENGTH));
        }

        value += ((byte & 0x7F) as usize) * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(ProtocolError::malformed(constants::ERR_REMAINING_LENGTH));
    }

    Ok(None)
}

/// Cursor over one frame's variable header and payload
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| ProtocolError::malformed(constants::ERR_TRUNCATED_FRAME))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::MalformedFrame(format!(
                "Frame truncated: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::malformed(constants::ERR_INVALID_UTF8))
    }

    /// Length-prefixed binary field (will payload)
    pub fn read_binary(&mut self) -> Result<Bytes> {
        let len = self.read_u16()? as usize;
        Ok(Bytes::copy_from_slice(self.read_bytes(len)?))
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fails unless every byte of the frame has been consumed
    pub fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(ProtocolError::malformed(constants::ERR_TRAILING_BYTES))
        }
    }
}

/// Write a 2-byte length prefix followed by the UTF-8 bytes.
pub(crate) fn put_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    put_binary(dst, value.as_bytes())
}

pub(crate) fn put_binary(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::MalformedFrame(format!(
            "Field of {} bytes does not fit a 16-bit length prefix",
            value.len()
        ))
    })?;
    dst.put_u16(len);
    dst.put_slice(value);
    Ok(())
}
