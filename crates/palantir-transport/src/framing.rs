//! Length-prefixed, channel-tagged framing.
//!
//! Format: `len (u32 BE) || channel (u16 BE) || payload`, where `len` counts
//! the channel field and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::traits::ChannelId;

/// Default maximum frame size (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const LEN_FIELD: usize = 4;
const CHANNEL_FIELD: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("Frame length {0} shorter than channel header")]
    Truncated(usize),
}

/// Frame codec with an upper bound on `len`.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode one frame.
    pub fn encode(&self, channel: ChannelId, payload: &[u8]) -> Result<Bytes, FramingError> {
        let len = CHANNEL_FIELD + payload.len();
        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }
        let mut out = BytesMut::with_capacity(LEN_FIELD + len);
        out.put_u32(len as u32);
        out.put_u16(channel.0);
        out.extend_from_slice(payload);
        Ok(out.freeze())
    }

    /// Streaming decoder for partial reads.
    ///
    /// Returns `Some` when a complete frame is buffered, `None` if more data is
    /// needed. The length is checked as soon as the prefix arrives, before the
    /// body is buffered.
    pub fn decode_stream(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<(ChannelId, Bytes)>, FramingError> {
        if buf.len() < LEN_FIELD {
            return Ok(None);
        }

        let len = {
            let mut len_buf = &buf[..LEN_FIELD];
            len_buf.get_u32() as usize
        };

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }
        if len < CHANNEL_FIELD {
            return Err(FramingError::Truncated(len));
        }
        if buf.len() < LEN_FIELD + len {
            return Ok(None);
        }

        buf.advance(LEN_FIELD);
        let channel = ChannelId(buf.get_u16());
        let payload = buf.split_to(len - CHANNEL_FIELD).freeze();
        Ok(Some((channel, payload)))
    }
}
