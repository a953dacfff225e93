//! Application framing carried inside every envelope payload.
//!
//! ```text
//! 0x00 MESSAGE   payload
//! 0x01 REQUEST   id u64 BE || payload
//! 0x02 RESPONSE  id u64 BE || payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const KIND_MESSAGE: u8 = 0x00;
pub const KIND_REQUEST: u8 = 0x01;
pub const KIND_RESPONSE: u8 = 0x02;

const ID_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("message kind 0x{kind:02x} too short: {len} bytes")]
    Truncated { kind: u8, len: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppMessage {
    Message(Bytes),
    Request { id: u64, payload: Bytes },
    Response { id: u64, payload: Bytes },
}

impl AppMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            AppMessage::Message(payload) => {
                let mut out = BytesMut::with_capacity(1 + payload.len());
                out.put_u8(KIND_MESSAGE);
                out.extend_from_slice(payload);
                out.freeze()
            }
            AppMessage::Request { id, payload } => with_id(KIND_REQUEST, *id, payload),
            AppMessage::Response { id, payload } => with_id(KIND_RESPONSE, *id, payload),
        }
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, MessageError> {
        if raw.is_empty() {
            return Err(MessageError::Empty);
        }
        let kind = raw.get_u8();
        match kind {
            KIND_MESSAGE => Ok(AppMessage::Message(raw)),
            KIND_REQUEST | KIND_RESPONSE => {
                if raw.len() < ID_LEN {
                    return Err(MessageError::Truncated { kind, len: raw.len() });
                }
                let id = raw.get_u64();
                Ok(if kind == KIND_REQUEST {
                    AppMessage::Request { id, payload: raw }
                } else {
                    AppMessage::Response { id, payload: raw }
                })
            }
            other => Err(MessageError::UnknownKind(other)),
        }
    }
}

fn with_id(kind: u8, id: u64, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(1 + ID_LEN + payload.len());
    out.put_u8(kind);
    out.put_u64(id);
    out.extend_from_slice(payload);
    out.freeze()
}
