use dcstream_transport::TransportError;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The encoded message exceeds the maximum message size.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The length prefix is not a valid varint.
    #[error("invalid length prefix (varint longer than 10 bytes)")]
    InvalidVarint,

    /// The message carries a flag value outside FIN/STOP_SENDING/RESET.
    #[error("unknown flag value {0}")]
    UnknownFlag(i32),

    /// The message body is not a valid protobuf `Message`.
    #[error("malformed message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The message could not be encoded.
    #[error("message encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),

    /// An I/O error surfaced through the codec.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying data channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The data channel was closed before a complete message was received.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Returns true when the channel ended cleanly.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, FrameError::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
