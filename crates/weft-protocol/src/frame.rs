// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binary frame codec for envelopes.
//!
//! Frame layout, little-endian throughout:
//! - 4 bytes: body length (everything after this prefix)
//! - 4 bytes: magic/version tag
//! - 4 bytes: message kind
//! - 8 bytes: request ID
//! - 4 bytes: property count, then per property:
//!   `[u16 key_len][key utf8][u8 value_tag][u32 value_len][value]`
//! - 4 bytes: payload length (0 = no payload), then the payload
//!
//! The length prefix is read first so a streaming reader knows exactly
//! how many bytes to buffer before parsing begins, regardless of how the
//! transport chunks the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::{Envelope, MessageKind, Property, PropertyValue};

/// Magic/version tag carried by every frame.
pub const FRAME_MAGIC: u32 = 0x5746_0001;

/// Maximum accepted frame body size (16 MiB). A declared length above
/// this is a protocol error, not an allocation attempt.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Smallest possible body: magic + kind + request ID + property count +
/// payload length.
const MIN_BODY_SIZE: usize = 4 + 4 + 8 + 4 + 4;

/// Errors produced by the codec and transport layer.
///
/// Every malformed input is reported as a distinguished variant, never a
/// panic or a generic parse error, so callers can decide whether the
/// connection is salvageable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("bad frame magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u32),

    #[error("unknown property value tag: {0}")]
    UnknownValueTag(u8),

    #[error("duplicate property key: {0}")]
    DuplicateProperty(String),

    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    #[error("invalid property value: {0}")]
    InvalidValue(&'static str),

    #[error("property key is not valid UTF-8")]
    InvalidUtf8,

    #[error("JSON property error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Encode an envelope into a complete frame (length prefix included).
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::with_capacity(MIN_BODY_SIZE + 64);
    body.put_u32_le(FRAME_MAGIC);
    body.put_u32_le(envelope.kind as u32);
    body.put_u64_le(envelope.request_id);

    body.put_u32_le(envelope.property_count() as u32);
    for prop in envelope.properties() {
        let key = prop.key.as_bytes();
        body.put_u16_le(key.len() as u16);
        body.put_slice(key);
        body.put_u8(prop.value.tag());
        let value = encode_value(&prop.value)?;
        body.put_u32_le(value.len() as u32);
        body.put_slice(&value);
    }

    match &envelope.payload {
        Some(payload) => {
            body.put_u32_le(payload.len() as u32);
            body.put_slice(payload);
        }
        None => body.put_u32_le(0),
    }

    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32_le(body.len() as u32);
    frame.put(body);
    Ok(frame.freeze())
}

fn encode_value(value: &PropertyValue) -> Result<Vec<u8>, ProtocolError> {
    Ok(match value {
        PropertyValue::Str(s) => s.as_bytes().to_vec(),
        PropertyValue::Bool(b) => vec![u8::from(*b)],
        PropertyValue::Int64(v) => v.to_le_bytes().to_vec(),
        PropertyValue::Bytes(b) => b.to_vec(),
        PropertyValue::Json(v) => serde_json::to_vec(v)?,
    })
}

/// Decode a complete frame (length prefix included). The companion of
/// [`encode`]; transport code uses [`read_frame`] instead.
pub fn decode(mut frame: Bytes) -> Result<Envelope, ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::Truncated("length prefix"));
    }
    let body_len = frame.get_u32_le() as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }
    if frame.len() < body_len {
        return Err(ProtocolError::Truncated("frame body"));
    }
    decode_body(frame.split_to(body_len))
}

/// Decode a frame body (everything after the length prefix).
pub fn decode_body(mut body: Bytes) -> Result<Envelope, ProtocolError> {
    if body.len() < MIN_BODY_SIZE {
        return Err(ProtocolError::Truncated("frame header"));
    }

    let magic = body.get_u32_le();
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let kind = MessageKind::try_from(body.get_u32_le())?;
    let request_id = body.get_u64_le();

    let mut envelope = Envelope::new(kind).with_request_id(request_id);

    let property_count = body.get_u32_le() as usize;
    for _ in 0..property_count {
        if body.remaining() < 2 {
            return Err(ProtocolError::Truncated("property key length"));
        }
        let key_len = body.get_u16_le() as usize;
        if body.remaining() < key_len {
            return Err(ProtocolError::Truncated("property key"));
        }
        let key = std::str::from_utf8(&body[..key_len])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_owned();
        body.advance(key_len);

        if body.remaining() < 1 + 4 {
            return Err(ProtocolError::Truncated("property value header"));
        }
        let tag = body.get_u8();
        let value_len = body.get_u32_le() as usize;
        if body.remaining() < value_len {
            return Err(ProtocolError::Truncated("property value"));
        }
        let raw = body.split_to(value_len);
        let value = decode_value(tag, raw)?;
        envelope.push_unique(Property { key, value })?;
    }

    if body.remaining() < 4 {
        return Err(ProtocolError::Truncated("payload length"));
    }
    let payload_len = body.get_u32_le() as usize;
    if body.remaining() < payload_len {
        return Err(ProtocolError::Truncated("payload"));
    }
    if payload_len > 0 {
        envelope.payload = Some(body.split_to(payload_len));
    }

    Ok(envelope)
}

fn decode_value(tag: u8, raw: Bytes) -> Result<PropertyValue, ProtocolError> {
    match tag {
        PropertyValue::TAG_STR => {
            let s = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(PropertyValue::Str(s.to_owned()))
        }
        PropertyValue::TAG_BOOL => match raw.as_ref() {
            [0] => Ok(PropertyValue::Bool(false)),
            [1] => Ok(PropertyValue::Bool(true)),
            _ => Err(ProtocolError::InvalidValue("bool")),
        },
        PropertyValue::TAG_INT64 => {
            let bytes: [u8; 8] = raw
                .as_ref()
                .try_into()
                .map_err(|_| ProtocolError::InvalidValue("int64"))?;
            Ok(PropertyValue::Int64(i64::from_le_bytes(bytes)))
        }
        PropertyValue::TAG_BYTES => Ok(PropertyValue::Bytes(raw)),
        PropertyValue::TAG_JSON => Ok(PropertyValue::Json(serde_json::from_slice(&raw)?)),
        other => Err(ProtocolError::UnknownValueTag(other)),
    }
}

/// Write a frame to an async writer. Callers serialize access; the codec
/// itself performs a single logical write.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), ProtocolError> {
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from an async reader, tolerating arbitrary chunking.
///
/// A clean EOF at a frame boundary is reported as
/// [`ProtocolError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, ProtocolError> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let body_len = u32::from_le_bytes(prefix) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }
    if body_len < MIN_BODY_SIZE {
        return Err(ProtocolError::Truncated("frame header"));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    decode_body(Bytes::from(body))
}
