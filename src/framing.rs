//! Length-prefixed JSON frame codec
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ length: u32 (BE)     │ payload: `length` bytes JSON │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! The payload is compact UTF-8 JSON and must be a JSON object. No maximum
//! frame length is enforced.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Size of the big-endian length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Outcome of a single decode attempt
#[derive(Debug)]
pub enum Decoded {
    /// Not enough bytes buffered yet; nothing was consumed
    NotReady,
    /// A complete frame holding a JSON object
    Message(Value),
    /// A complete frame whose payload was not a JSON object
    Malformed { reason: String },
}

impl Decoded {
    pub fn is_ready(&self) -> bool {
        !matches!(self, Decoded::NotReady)
    }
}

/// Serialize `message` to compact JSON and prepend its length.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Bytes> {
    let payload = serde_json::to_vec(message)?;
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(&payload);
    Ok(out.freeze())
}

/// Try to decode one frame from the front of `buffer`.
///
/// Returns the outcome together with the number of bytes the frame occupies.
/// `NotReady` always reports zero. A malformed payload still reports the full
/// frame length so the caller stays aligned on the next frame.
pub fn try_decode_one(buffer: &[u8]) -> (Decoded, usize) {
    if buffer.len() < FRAME_HEADER_SIZE {
        return (Decoded::NotReady, 0);
    }

    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    let frame_len = FRAME_HEADER_SIZE.saturating_add(len);
    if buffer.len() < frame_len {
        return (Decoded::NotReady, 0);
    }

    let payload = &buffer[FRAME_HEADER_SIZE..frame_len];
    let decoded = match serde_json::from_slice::<Value>(payload) {
        Ok(value) if value.is_object() => Decoded::Message(value),
        Ok(other) => Decoded::Malformed {
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        },
        Err(e) => Decoded::Malformed {
            reason: e.to_string(),
        },
    };

    (decoded, frame_len)
}

/// Decode one frame from `buffer`, advancing past it if it was complete.
///
/// Call repeatedly until it returns [`Decoded::NotReady`]: one socket read can
/// carry several frames, or only part of one.
pub fn next_frame(buffer: &mut BytesMut) -> Decoded {
    let (decoded, consumed) = try_decode_one(buffer);
    buffer.advance(consumed);
    decoded
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
