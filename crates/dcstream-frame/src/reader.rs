use std::sync::Arc;

use bytes::BytesMut;
use dcstream_transport::{DataChannelTransport, TransportError};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::{FrameConfig, MessageCodec};
use crate::error::{FrameError, Result};
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Reads complete messages from a data channel.
///
/// A message split across transport messages is reassembled internally;
/// callers always get complete messages.
pub struct FrameReader<C> {
    inner: Arc<C>,
    buf: BytesMut,
    codec: MessageCodec,
}

impl<C: DataChannelTransport> FrameReader<C> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: Arc<C>) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: Arc<C>, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            codec: MessageCodec::new(&config),
        }
    }

    /// Read the next complete message.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when the channel is closed.
    /// Cancel-safe: a partially received message stays buffered.
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.codec.decode(&mut self.buf)? {
                trace!(
                    len = msg.payload_len(),
                    flag = ?msg.close_flag(),
                    "decoded message"
                );
                return Ok(msg);
            }

            match self.inner.recv().await {
                Ok(data) => self.buf.extend_from_slice(&data),
                Err(TransportError::Closed) => return Err(FrameError::ConnectionClosed),
                Err(err) => return Err(FrameError::Transport(err)),
            }
        }
    }

    /// Borrow the underlying channel.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Update maximum message size for subsequent decoding.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.codec.set_max_message_size(max_message_size);
    }

    /// Current maximum message size.
    pub fn max_message_size(&self) -> usize {
        self.codec.max_message_size()
    }
}
