use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Callback fired when the buffered amount drops to or below the registered
/// low-watermark threshold.
pub type BufferedAmountLowFn = Box<dyn Fn() + Send + Sync + 'static>;

/// A message-oriented, size-bounded data channel.
///
/// This is the narrow surface dcstream consumes from a peer-to-peer data
/// channel: whole messages in, whole messages out, plus the buffered-amount
/// counter used for backpressure. Connection setup, SDP negotiation and
/// congestion control stay with the implementation.
///
/// Implementations must tolerate one concurrent sender and one concurrent
/// receiver. `recv` must be cancel-safe: dropping the future before it
/// completes must not lose a message.
#[async_trait]
pub trait DataChannelTransport: Send + Sync + 'static {
    /// Send one whole message.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Receive the next whole message.
    ///
    /// Returns [`TransportError::Closed`](crate::TransportError::Closed) once
    /// the channel is closed and every queued message has been delivered.
    async fn recv(&self) -> Result<Bytes>;

    /// Number of bytes queued for transmission but not yet delivered.
    fn buffered_amount(&self) -> usize;

    /// Register `callback` to fire whenever the buffered amount falls from
    /// above `threshold` to `threshold` or below. Replaces any previous
    /// registration.
    fn on_buffered_amount_low(&self, threshold: usize, callback: BufferedAmountLowFn);

    /// Close the channel. Queued messages are still delivered to the peer.
    async fn close(&self) -> Result<()>;
}
