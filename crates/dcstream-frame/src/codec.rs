use bytes::{Buf, BytesMut};
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};
use crate::message::Message;

/// Maximum transport message size, as limited in the SDP.
pub const MAX_MESSAGE_SIZE: usize = 16384;

/// Protobuf overhead of a data message: field tags plus the payload length.
pub const PROTO_OVERHEAD: usize = 5;

/// Overhead of the delimiting length prefix.
pub const VARINT_OVERHEAD: usize = 2;

/// Largest payload that fits in one transport message.
pub const DEFAULT_CHUNK_SIZE: usize = MAX_MESSAGE_SIZE - PROTO_OVERHEAD - VARINT_OVERHEAD;

const MAX_VARINT_LEN: usize = 10;

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum size of one transport message, prefix included. Default: 16384.
    pub max_message_size: usize,
}

impl FrameConfig {
    /// Largest payload a single data message can carry under this config.
    ///
    /// Never zero: a limit too small for any payload still yields one-byte
    /// chunks, which the codec then rejects as too large.
    pub fn chunk_size(&self) -> usize {
        self.max_message_size
            .saturating_sub(PROTO_OVERHEAD + VARINT_OVERHEAD)
            .max(1)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Wire size of `msg` once delimited (length prefix + body).
pub fn encoded_len(msg: &Message) -> usize {
    let body = msg.encoded_len();
    prost::length_delimiter_len(body) + body
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬──────────────────────────────────┐
/// │ Length (varint)  │ protobuf Message                 │
/// │ 1-2B in practice │ flag (tag 1), message (tag 2)    │
/// └──────────────────┴──────────────────────────────────┘
/// ```
pub fn encode_message(msg: &Message, dst: &mut BytesMut) -> Result<()> {
    dst.reserve(encoded_len(msg));
    msg.encode_length_delimited(dst)?;
    Ok(())
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer.
pub fn decode_message(src: &mut BytesMut, max_message_size: usize) -> Result<Option<Message>> {
    let Some((body_len, prefix_len)) = peek_varint(src)? else {
        return Ok(None); // Need more data
    };

    let body_len = usize::try_from(body_len).map_err(|_| FrameError::InvalidVarint)?;
    if body_len > max_message_size {
        return Err(FrameError::MessageTooLarge {
            size: body_len,
            max: max_message_size,
        });
    }

    if src.len() < prefix_len + body_len {
        return Ok(None); // Need more data
    }

    src.advance(prefix_len);
    let body = src.split_to(body_len).freeze();
    let msg = Message::decode(body)?;

    if let Some(raw) = msg.flag {
        if msg.close_flag().is_none() {
            return Err(FrameError::UnknownFlag(raw));
        }
    }

    Ok(Some(msg))
}

/// Read a varint from the front of `src` without consuming it.
///
/// Returns the value and the number of bytes it occupies, or `None` when the
/// buffer ends inside the varint.
fn peek_varint(src: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(FrameError::InvalidVarint);
    }
    Ok(None)
}

/// `tokio_util` codec for delimited messages.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    /// Create a codec enforcing `config.max_message_size`.
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
        }
    }

    /// Current maximum message size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Update maximum message size for subsequent encoding and decoding.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(&FrameConfig::default())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        decode_message(src, self.max_message_size)
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        let size = encoded_len(item);
        if size > self.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        encode_message(item, dst)
    }
}
