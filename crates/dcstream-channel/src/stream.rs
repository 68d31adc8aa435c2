use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dcstream_frame::Message;
use dcstream_transport::DataChannelTransport;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::{DataChannel, Pump};
use crate::config::ChannelConfig;
use crate::error::{Result, StreamError};
use crate::state::ChannelState;

/// Stream over a data channel.
///
/// Adds to [`DataChannel`]: flow-controlled chunking of every write, a FIN
/// that goes through the same flow control as data, and a background
/// reader that keeps processing control messages once the local read side
/// is closed, so the peer's FIN / RESET are still seen while we write.
///
/// Clones share one stream. Dropping the last clone without
/// [`close`](Stream::close) stops the background readers, which releases
/// the channel and its transport; the peer is not notified.
pub struct Stream<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    channel: Arc<DataChannel<C>>,
    control_reader_started: AtomicBool,
}

impl<C: DataChannelTransport> Stream<C> {
    /// Open a stream with default configuration.
    pub fn new(transport: C) -> Self {
        Self::from_channel(DataChannel::new(transport))
    }

    /// Open a stream with explicit configuration.
    pub fn with_config(transport: C, config: ChannelConfig) -> Self {
        Self::from_channel(DataChannel::with_config(transport, config))
    }

    /// Wrap an existing channel.
    pub fn from_channel(channel: Arc<DataChannel<C>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                control_reader_started: AtomicBool::new(false),
            }),
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<DataChannel<C>> {
        &self.inner.channel
    }

    /// Read buffered data. `Ok(0)` is end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.channel().read(buf).await
    }

    /// Write `buf`, chunked to the transport's message size.
    ///
    /// Each chunk waits for flow control on its own. A failure after some
    /// chunks were sent returns the short count, and the next call returns
    /// that failure.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let channel = self.channel();
        if let Some(err) = channel.take_write_error() {
            return Err(err);
        }
        let state = channel.state();
        if !state.allows_write() {
            return Err(StreamError::ClosedPipe);
        }
        if state == ChannelState::ReadClosed {
            self.spawn_control_reader();
        }

        let mut written = 0;
        for chunk in buf.chunks(channel.config().chunk_size()) {
            let msg = Message::data(Bytes::copy_from_slice(chunk));
            match channel.write_message(&msg).await {
                Ok(n) => written += n,
                Err(err) => return channel.finish_write(written, err).await,
            }
        }
        Ok(written)
    }

    /// Send FIN once it clears flow control, then close the write side.
    pub async fn close_write(&self) -> Result<()> {
        self.channel().close_write_flushed().await
    }

    /// Send STOP_SENDING and keep control messages flowing.
    pub async fn close_read(&self) -> Result<()> {
        let result = self.channel().close_read().await;
        if self.state() == ChannelState::ReadClosed {
            self.spawn_control_reader();
        }
        result
    }

    /// Send RESET and tear down.
    pub async fn reset(&self) -> Result<()> {
        self.channel().reset().await
    }

    /// Tear down and wait for all background readers to exit.
    pub async fn close(&self) {
        self.channel().close().await;
    }

    /// Set both deadlines. `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.channel().set_deadline(deadline);
    }

    /// Set the read deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.channel().set_read_deadline(deadline);
    }

    /// Set the write deadline.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.channel().set_write_deadline(deadline);
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.channel().state()
    }

    /// Resolves once the stream has been torn down.
    pub async fn closed(&self) {
        self.channel().closed().await;
    }

    /// Start the control-only reader. Later calls are no-ops.
    fn spawn_control_reader(&self) {
        if self.inner.control_reader_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = Arc::clone(self.channel());
        self.channel().spawn_reader(async move {
            debug!("control reader started");
            // Runs until the peer closes the stream; no deadline applies.
            channel.set_read_deadline(None);
            while channel.pump().await == Pump::Continue {}
            debug!("control reader exited");
        });
    }
}

impl<C> Clone for Stream<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        // The control reader holds the channel; stop it so the channel drops.
        self.channel.cancel_background();
    }
}
