use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{BufferedAmountLowFn, DataChannelTransport};

/// Default maximum message size: the 16 KiB limit browsers negotiate in SDP.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16384;

/// Configuration for an in-memory channel pair.
#[derive(Debug, Clone)]
pub struct MemoryChannelConfig {
    /// Largest message either end accepts. Default: 16384 bytes.
    pub max_message_size: usize,
}

impl Default for MemoryChannelConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// In-process data channel, created in connected pairs.
///
/// Bytes sent by one end count towards its buffered amount until the other
/// end receives them, so a peer that stops reading produces the same
/// backpressure a stalled SCTP association would. Closing an end stops its
/// own receives immediately and lets the peer drain what was already queued
/// before it observes [`TransportError::Closed`].
pub struct MemoryDataChannel {
    config: MemoryChannelConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    send_buffer: Arc<SendBuffer>,
    peer_send_buffer: Arc<SendBuffer>,
    closed: CancellationToken,
    peer_closed: CancellationToken,
}

impl MemoryDataChannel {
    /// Create a connected pair with default configuration.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_config(MemoryChannelConfig::default())
    }

    /// Create a connected pair with explicit configuration.
    pub fn pair_with_config(config: MemoryChannelConfig) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        let left_buffer = Arc::new(SendBuffer::default());
        let right_buffer = Arc::new(SendBuffer::default());
        let left_closed = CancellationToken::new();
        let right_closed = CancellationToken::new();

        let left = Self {
            config: config.clone(),
            outbound: Mutex::new(Some(left_tx)),
            inbound: tokio::sync::Mutex::new(left_rx),
            send_buffer: Arc::clone(&left_buffer),
            peer_send_buffer: Arc::clone(&right_buffer),
            closed: left_closed.clone(),
            peer_closed: right_closed.clone(),
        };
        let right = Self {
            config,
            outbound: Mutex::new(Some(right_tx)),
            inbound: tokio::sync::Mutex::new(right_rx),
            send_buffer: right_buffer,
            peer_send_buffer: left_buffer,
            closed: right_closed,
            peer_closed: left_closed,
        };
        (left, right)
    }

    /// Maximum message size accepted by `send`.
    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    /// Whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Bytes>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DataChannelTransport for MemoryDataChannel {
    async fn send(&self, data: Bytes) -> Result<()> {
        if self.closed.is_cancelled() || self.peer_closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if data.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
        }

        let outbound = self.outbound();
        let Some(tx) = outbound.as_ref() else {
            return Err(TransportError::Closed);
        };
        let len = data.len();
        self.send_buffer.reserve(len);
        if tx.send(data).is_err() {
            drop(outbound);
            self.send_buffer.release(len);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            msg = inbound.recv() => match msg {
                Some(data) => {
                    self.peer_send_buffer.release(data.len());
                    Ok(data)
                }
                None => Err(TransportError::Closed),
            },
        }
    }

    fn buffered_amount(&self) -> usize {
        self.send_buffer.amount()
    }

    fn on_buffered_amount_low(&self, threshold: usize, callback: BufferedAmountLowFn) {
        self.send_buffer.set_low_watermark(threshold, callback);
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            debug!("closing in-memory data channel");
        }
        self.closed.cancel();
        self.outbound().take();
        Ok(())
    }
}

impl fmt::Debug for MemoryDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDataChannel")
            .field("max_message_size", &self.config.max_message_size)
            .field("buffered_amount", &self.send_buffer.amount())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[derive(Default)]
struct SendBuffer {
    state: Mutex<SendBufferState>,
}

#[derive(Default)]
struct SendBufferState {
    buffered: usize,
    low_watermark: Option<(usize, Arc<dyn Fn() + Send + Sync>)>,
}

impl SendBuffer {
    fn lock(&self) -> MutexGuard<'_, SendBufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn amount(&self) -> usize {
        self.lock().buffered
    }

    fn reserve(&self, len: usize) {
        self.lock().buffered += len;
    }

    fn release(&self, len: usize) {
        let callback = {
            let mut state = self.lock();
            let previous = state.buffered;
            state.buffered = previous.saturating_sub(len);
            match &state.low_watermark {
                Some((threshold, callback))
                    if previous > *threshold && state.buffered <= *threshold =>
                {
                    Some(Arc::clone(callback))
                }
                _ => None,
            }
        };
        // Fired outside the lock so the callback may query the buffered amount.
        if let Some(callback) = callback {
            callback();
        }
    }

    fn set_low_watermark(&self, threshold: usize, callback: BufferedAmountLowFn) {
        self.lock().low_watermark = Some((threshold, Arc::from(callback)));
    }
}
