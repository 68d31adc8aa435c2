use std::sync::Arc;

use bytes::BytesMut;
use dcstream_transport::DataChannelTransport;
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::codec::{FrameConfig, MessageCodec};
use crate::error::Result;
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Writes complete messages to a data channel, one message per transport send.
pub struct FrameWriter<C> {
    inner: Arc<C>,
    buf: BytesMut,
    codec: MessageCodec,
}

impl<C: DataChannelTransport> FrameWriter<C> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: Arc<C>) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: Arc<C>, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            codec: MessageCodec::new(&config),
        }
    }

    /// Encode and send one message.
    ///
    /// Returns the number of payload bytes sent.
    pub async fn write_message(&mut self, msg: &Message) -> Result<usize> {
        self.buf.clear();
        self.codec.encode(msg, &mut self.buf)?;
        let frame = self.buf.split().freeze();
        trace!(
            len = frame.len(),
            flag = ?msg.close_flag(),
            "sending message"
        );
        self.inner.send(frame).await?;
        Ok(msg.payload_len())
    }

    /// Borrow the underlying channel.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Update maximum message size for subsequent encoding.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.codec.set_max_message_size(max_message_size);
    }

    /// Current maximum message size.
    pub fn max_message_size(&self) -> usize {
        self.codec.max_message_size()
    }
}
