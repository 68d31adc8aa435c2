//! Delimited message framing for data channels.
//!
//! Every transport message carries exactly one protobuf [`Message`]:
//! - A varint length prefix
//! - An optional close [`Flag`] (FIN, STOP_SENDING, RESET)
//! - An optional opaque payload
//!
//! Payload and flags share one ordered channel, so half-close and reset are
//! negotiated in-band.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_message, encode_message, encoded_len, FrameConfig, MessageCodec, DEFAULT_CHUNK_SIZE,
    MAX_MESSAGE_SIZE, PROTO_OVERHEAD, VARINT_OVERHEAD,
};
pub use error::{FrameError, Result};
pub use message::{Flag, Message};
pub use reader::FrameReader;
pub use writer::FrameWriter;
