//! Framed data channel: read buffering, flow-controlled writes and the
//! FIN / STOP_SENDING / RESET close protocol.

use std::future::{self, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{Buf, Bytes, BytesMut};
use dcstream_frame::{encoded_len, Flag, FrameError, FrameReader, FrameWriter, Message};
use dcstream_transport::DataChannelTransport;
use tokio::sync::{mpsc, Notify, OnceCell, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::config::ChannelConfig;
use crate::error::{Result, StreamError};
use crate::state::ChannelState;

/// A bidirectional byte stream over one message-oriented data channel.
///
/// Writes are split into transport-sized data messages and held back while
/// the transport's buffered amount is too high. Reads are served from a
/// buffer filled by a background read loop, which reads one message per
/// read request so the channel is only drained while someone is reading.
///
/// The channel must be closed with [`DataChannel::close`] (or torn down by
/// the peer). Dropping the last handle cancels background work and releases
/// the transport without notifying the peer.
pub struct DataChannel<C> {
    transport: Arc<C>,
    config: ChannelConfig,
    shared: Mutex<Shared>,
    reader: tokio::sync::Mutex<FrameReader<C>>,
    writer: tokio::sync::Mutex<FrameWriter<C>>,
    read_requests: mpsc::Sender<()>,
    message_received: Notify,
    write_available: Arc<Notify>,
    deadline_updated: Notify,
    cancel: CancellationToken,
    tasks: TaskTracker,
    torn_down: AtomicBool,
    transport_open: RwLock<bool>,
    close_write_once: OnceCell<Result<()>>,
    close_read_once: OnceCell<Result<()>>,
    reset_once: OnceCell<Result<()>>,
}

/// State guarded by the channel lock. Never held across an `.await`.
struct Shared {
    state: ChannelState,
    read_buf: BytesMut,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    write_error: Option<StreamError>,
}

/// Outcome of pulling one message off the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pump {
    Continue,
    Stopped,
}

impl<C: DataChannelTransport> DataChannel<C> {
    /// Wrap `transport` with default configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(transport: C) -> Arc<Self> {
        Self::with_config(transport, ChannelConfig::default())
    }

    /// Wrap `transport` with explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_config(transport: C, config: ChannelConfig) -> Arc<Self> {
        if config.max_buffered_amount < config.frame.max_message_size {
            warn!(
                max_buffered_amount = config.max_buffered_amount,
                max_message_size = config.frame.max_message_size,
                "buffered limit below one full message; large writes wait for their deadline"
            );
        }
        let transport = Arc::new(transport);
        let (read_requests, requests) = mpsc::channel(config.read_request_capacity.max(1));

        let write_available = Arc::new(Notify::new());
        {
            let write_available = Arc::clone(&write_available);
            transport.on_buffered_amount_low(
                config.buffered_amount_low_threshold,
                Box::new(move || write_available.notify_waiters()),
            );
        }

        let channel = Arc::new(Self {
            reader: tokio::sync::Mutex::new(FrameReader::with_config(
                Arc::clone(&transport),
                config.frame.clone(),
            )),
            writer: tokio::sync::Mutex::new(FrameWriter::with_config(
                Arc::clone(&transport),
                config.frame.clone(),
            )),
            transport,
            config,
            shared: Mutex::new(Shared {
                state: ChannelState::Open,
                read_buf: BytesMut::new(),
                read_deadline: None,
                write_deadline: None,
                write_error: None,
            }),
            read_requests,
            message_received: Notify::new(),
            write_available,
            deadline_updated: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            torn_down: AtomicBool::new(false),
            transport_open: RwLock::new(true),
            close_write_once: OnceCell::new(),
            close_read_once: OnceCell::new(),
            reset_once: OnceCell::new(),
        });

        channel.tasks.spawn(read_loop(
            Arc::downgrade(&channel),
            requests,
            channel.cancel.clone(),
        ));
        channel
    }

    /// Read buffered data into `buf`.
    ///
    /// Waits until data is available, returning the number of bytes copied.
    /// Returns `Ok(0)` at end of stream: the read side is closed and the
    /// buffer is drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // Registered on creation: a notification between the check
            // below and the select is not lost.
            let message_received = self.message_received.notified();
            let deadline_updated = self.deadline_updated.notified();

            let deadline = {
                let mut shared = self.lock();
                if !shared.read_buf.is_empty() {
                    let n = buf.len().min(shared.read_buf.len());
                    buf[..n].copy_from_slice(&shared.read_buf[..n]);
                    shared.read_buf.advance(n);
                    return Ok(n);
                }
                if !shared.state.allows_read() {
                    return Ok(0);
                }
                shared.read_deadline
            };
            // Background work stopped without a teardown; nothing will arrive.
            if self.cancel.is_cancelled() {
                return Err(StreamError::ClosedPipe);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(StreamError::DeadlineExceeded);
            }

            self.request_read();
            tokio::select! {
                _ = message_received => {}
                _ = deadline_updated => {}
                _ = sleep_until(deadline) => return Err(StreamError::DeadlineExceeded),
                // Teardown marks the channel closed; the next pass returns.
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Write `buf` as a sequence of data messages.
    ///
    /// Returns the number of bytes written. If a later chunk fails after
    /// earlier chunks went out, the short count is returned and the error is
    /// kept: the next call returns it before writing anything.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if let Some(err) = self.take_write_error() {
            return Err(err);
        }
        let state = self.state();
        if !state.allows_write() {
            return Err(StreamError::ClosedPipe);
        }
        if state == ChannelState::ReadClosed {
            // Nobody reads data any more; keep control messages flowing.
            self.request_read();
        }

        let mut written = 0;
        for chunk in buf.chunks(self.config.chunk_size()) {
            let result = match self.write_deadline() {
                Some(deadline) if Instant::now() >= deadline => Err(StreamError::DeadlineExceeded),
                _ => {
                    self.write_message(&Message::data(Bytes::copy_from_slice(chunk)))
                        .await
                }
            };
            match result {
                Ok(n) => written += n,
                Err(err) => return self.finish_write(written, err).await,
            }
        }
        Ok(written)
    }

    /// Resolve a write that stopped on `err` after `written` bytes.
    pub(crate) async fn finish_write(&self, written: usize, err: StreamError) -> Result<usize> {
        let err = self.check_write_error(err).await;
        if written == 0 {
            return Err(err);
        }
        debug!(%err, written, "short write");
        self.lock().write_error = Some(err);
        Ok(written)
    }

    /// Error left behind by a short write, returned once.
    pub(crate) fn take_write_error(&self) -> Option<StreamError> {
        self.lock().write_error.take()
    }

    /// Send one message, waiting while the transport has too much buffered.
    ///
    /// Waits for the low-watermark signal, the write deadline or teardown,
    /// re-evaluating after every wake-up (including deadline changes).
    pub(crate) async fn write_message(&self, msg: &Message) -> Result<usize> {
        let size = encoded_len(msg);
        loop {
            let write_available = self.write_available.notified();
            let deadline_updated = self.deadline_updated.notified();

            if !self.state().allows_write() {
                return Err(StreamError::ClosedPipe);
            }
            let deadline = self.write_deadline();

            let projected = self.transport.buffered_amount() + size;
            if projected <= self.config.max_buffered_amount {
                return self.send_message(msg).await;
            }

            trace!(projected, "write blocked on buffered amount");
            tokio::select! {
                _ = sleep_until(deadline) => return Err(StreamError::DeadlineExceeded),
                _ = write_available => {}
                _ = deadline_updated => {}
                _ = self.cancel.cancelled() => return Err(StreamError::ClosedPipe),
            }
        }
    }

    /// Close the write side: send FIN.
    ///
    /// Runs at most once; concurrent and later callers get the result of
    /// that single execution. Tears the channel down if both sides are now
    /// closed.
    pub async fn close_write(&self) -> Result<()> {
        let result = self
            .close_write_once
            .get_or_init(|| self.send_close_flag(Flag::Fin))
            .await
            .clone();
        self.finish_close_op(&result).await;
        result
    }

    /// Close the write side after FIN made it through flow control.
    ///
    /// The write axis only closes once FIN is sent, and writers still
    /// blocked on flow control are woken to fail fast.
    pub(crate) async fn close_write_flushed(&self) -> Result<()> {
        let result = self
            .close_write_once
            .get_or_init(|| async {
                let open = self.transport_open.read().await;
                if !*open || !self.state().allows_write() {
                    return Ok(());
                }
                if let Err(err) = self.write_message(&Message::with_flag(Flag::Fin)).await {
                    debug!(%err, "could not write FIN message");
                    return Err(err);
                }
                debug!(flag = %Flag::Fin, "sent flag");
                self.apply_outgoing(Flag::Fin);
                Ok(())
            })
            .await
            .clone();
        self.finish_close_op(&result).await;
        result
    }

    /// Close the read side: send STOP_SENDING.
    ///
    /// Buffered data can still be read; data arriving afterwards is dropped.
    /// Runs at most once.
    pub async fn close_read(&self) -> Result<()> {
        let result = self
            .close_read_once
            .get_or_init(|| self.send_close_flag(Flag::StopSending))
            .await
            .clone();
        self.finish_close_op(&result).await;
        result
    }

    /// Abort both directions: send RESET and tear down.
    ///
    /// Runs at most once. RESET is still sent when the half-closes already
    /// closed both sides, as long as the transport is open.
    pub async fn reset(&self) -> Result<()> {
        let result = self
            .reset_once
            .get_or_init(|| self.send_close_flag(Flag::Reset))
            .await
            .clone();
        if result.as_ref().is_err_and(is_transport_failure) {
            self.teardown(true).await;
        }
        self.close().await;
        result
    }

    /// Tear the channel down and wait for background readers to exit.
    ///
    /// Sends FIN if the write side was still open, cancels every pending
    /// wait and closes the transport once the readers are gone. Close
    /// operations already in flight get their flag out first. Safe to call
    /// any number of times.
    pub async fn close(&self) {
        self.shutdown(false).await;
        self.tasks.close();
        self.tasks.wait().await;
        self.close_transport().await;
    }

    /// Set both deadlines.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        {
            let mut shared = self.lock();
            shared.read_deadline = deadline;
            shared.write_deadline = deadline;
        }
        self.deadline_updated.notify_waiters();
    }

    /// Set the read deadline. `None` waits indefinitely.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.lock().read_deadline = deadline;
        self.deadline_updated.notify_waiters();
    }

    /// Set the write deadline. `None` waits indefinitely.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.lock().write_deadline = deadline;
        self.deadline_updated.notify_waiters();
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// Whether the channel has been torn down.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Resolves once the channel has been torn down, locally or by the peer.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &C {
        &self.transport
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Run `task` as a background reader that [`close`](Self::close) waits for.
    pub(crate) fn spawn_reader<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        self.tasks.spawn(task);
    }

    /// Read one message off the transport and apply it.
    ///
    /// Tears the channel down when the message closes it, or when the
    /// transport ends or fails.
    pub(crate) async fn pump(&self) -> Pump {
        let result = {
            let mut reader = tokio::select! {
                _ = self.cancel.cancelled() => return Pump::Stopped,
                reader = self.reader.lock() => reader,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Pump::Stopped,
                result = reader.read_message() => result,
            }
        };

        match result {
            Ok(msg) => {
                if self.apply_incoming(msg).is_closed() {
                    self.teardown(false).await;
                    return Pump::Stopped;
                }
                Pump::Continue
            }
            Err(err) => {
                if err.is_connection_closed() {
                    debug!("data channel ended");
                } else {
                    warn!(%err, "could not read message");
                }
                self.teardown(true).await;
                Pump::Stopped
            }
        }
    }

    /// Apply a received message: payload first, then flag.
    fn apply_incoming(&self, msg: Message) -> ChannelState {
        let (payload, flag) = msg.into_parts();
        let (previous, current) = {
            let mut shared = self.lock();
            if let Some(payload) = payload {
                if shared.state.allows_read() {
                    shared.read_buf.extend_from_slice(&payload);
                } else {
                    trace!(len = payload.len(), "dropping data after read side closed");
                }
            }
            let previous = shared.state;
            if let Some(flag) = flag {
                shared.state = previous.handle_incoming_flag(flag);
            }
            (previous, shared.state)
        };

        if let Some(flag) = flag {
            debug!(%flag, %previous, %current, "received flag");
        }
        // Wakes readers even for flag-only messages so they see the new state.
        self.message_received.notify_waiters();
        if previous.allows_write() && !current.allows_write() {
            self.write_available.notify_waiters();
        }
        current
    }

    fn apply_outgoing(&self, flag: Flag) -> (ChannelState, ChannelState) {
        let (previous, current) = {
            let mut shared = self.lock();
            let previous = shared.state;
            shared.state = previous.process_outgoing_flag(flag);
            (previous, shared.state)
        };
        if previous.allows_read() && !current.allows_read() {
            self.message_received.notify_waiters();
        }
        if previous.allows_write() && !current.allows_write() {
            self.write_available.notify_waiters();
        }
        (previous, current)
    }

    /// Apply and send an outgoing close flag unless the transport is gone.
    ///
    /// Holds the transport gate for reading so a concurrent teardown cannot
    /// close the transport while the flag is on its way out.
    async fn send_close_flag(&self, flag: Flag) -> Result<()> {
        let open = self.transport_open.read().await;
        if !*open {
            return Ok(());
        }
        self.apply_outgoing(flag);
        self.send_flag(flag).await
    }

    /// Tear down after a close operation if it failed fatally or left both
    /// sides closed. Must run outside the transport gate.
    async fn finish_close_op(&self, result: &Result<()>) {
        if result.as_ref().is_err_and(is_transport_failure) {
            self.teardown(true).await;
        }
        if self.state().is_closed() {
            self.close().await;
        }
    }

    async fn send_flag(&self, flag: Flag) -> Result<()> {
        match self.send_message(&Message::with_flag(flag)).await {
            Ok(_) => {
                debug!(%flag, "sent flag");
                Ok(())
            }
            Err(err) => {
                debug!(%flag, %err, "could not send flag");
                Err(err)
            }
        }
    }

    async fn send_message(&self, msg: &Message) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        Ok(writer.write_message(msg).await?)
    }

    /// Tear down with RESET if `err` is a transport failure, then hand it back.
    async fn check_write_error(&self, err: StreamError) -> StreamError {
        if is_transport_failure(&err) {
            warn!(%err, "data channel send failed");
            self.teardown(true).await;
        }
        err
    }

    /// Shut down and close the transport without waiting for background
    /// readers, so it is safe to call from one.
    async fn teardown(&self, reset: bool) {
        self.shutdown(reset).await;
        self.close_transport().await;
    }

    /// Mark the channel closed, cancel waiters and send the final flag.
    ///
    /// With `reset`, a best-effort RESET replaces the FIN.
    async fn shutdown(&self, reset: bool) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous = {
            let mut shared = self.lock();
            std::mem::replace(&mut shared.state, ChannelState::Closed)
        };
        debug!(%previous, reset, "tearing down data channel");

        self.cancel.cancel();
        self.message_received.notify_waiters();
        self.write_available.notify_waiters();

        if reset {
            let _ = self
                .reset_once
                .get_or_init(|| self.send_flag(Flag::Reset))
                .await;
        } else if previous.allows_write() {
            let _ = self
                .close_write_once
                .get_or_init(|| self.send_flag(Flag::Fin))
                .await;
        }
    }

    /// Close the transport once every in-flight close flag has been sent.
    async fn close_transport(&self) {
        let mut open = self.transport_open.write().await;
        if !std::mem::replace(&mut *open, false) {
            return;
        }
        if let Err(err) = self.transport.close().await {
            debug!(%err, "closing transport failed");
        }
    }

    fn request_read(&self) {
        // A full queue already guarantees a pending read.
        let _ = self.read_requests.try_send(());
    }

    fn write_deadline(&self) -> Option<Instant> {
        self.lock().write_deadline
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> DataChannel<C> {
    /// Stop background work without notifying the peer.
    pub(crate) fn cancel_background(&self) {
        self.cancel.cancel();
    }
}

impl<C> Drop for DataChannel<C> {
    fn drop(&mut self) {
        self.cancel_background();
    }
}

/// A send or receive failure other than the transport closing cleanly.
fn is_transport_failure(err: &StreamError) -> bool {
    match err {
        StreamError::Frame(frame) => match frame.as_ref() {
            FrameError::Transport(err) => !err.is_closed(),
            _ => false,
        },
        _ => false,
    }
}

/// Background loop: one transport read per read request.
async fn read_loop<C: DataChannelTransport>(
    channel: Weak<DataChannel<C>>,
    mut requests: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    debug!("read loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
            }
        }
        let Some(channel) = channel.upgrade() else {
            break;
        };
        if channel.pump().await == Pump::Stopped {
            break;
        }
    }
    debug!("read loop exited");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dcstream_frame::{FrameWriter, DEFAULT_CHUNK_SIZE as DEFAULT_CHUNK};
    use dcstream_transport::{BufferedAmountLowFn, MemoryDataChannel, TransportError};
    use futures_util::future::join_all;
    use tokio::time::timeout;

    use super::*;
    use crate::config::MAX_BUFFERED_AMOUNT;

    const WAIT: Duration = Duration::from_secs(5);

    struct Peer {
        reader: FrameReader<MemoryDataChannel>,
        writer: FrameWriter<MemoryDataChannel>,
    }

    impl Peer {
        async fn next(&mut self) -> Option<Message> {
            timeout(WAIT, self.reader.read_message()).await.unwrap().ok()
        }

        async fn send(&mut self, msg: Message) {
            self.writer.write_message(&msg).await.unwrap();
        }

        /// Drain until the transport closes, returning every flag seen.
        async fn flags_until_closed(&mut self) -> Vec<Flag> {
            let mut flags = Vec::new();
            while let Some(msg) = self.next().await {
                flags.extend(msg.close_flag());
            }
            flags
        }
    }

    fn setup() -> (Arc<DataChannel<MemoryDataChannel>>, Peer) {
        let (local, remote) = MemoryDataChannel::pair();
        let remote = Arc::new(remote);
        let peer = Peer {
            reader: FrameReader::new(Arc::clone(&remote)),
            writer: FrameWriter::new(remote),
        };
        (DataChannel::new(local), peer)
    }

    #[tokio::test]
    async fn large_write_is_chunked() {
        let (channel, mut peer) = setup();
        let data: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();

        assert_eq!(channel.write(&data).await.unwrap(), 40_000);

        let mut received = Vec::new();
        for _ in 0..3 {
            let msg = peer.next().await.unwrap();
            assert!(msg.payload_len() <= DEFAULT_CHUNK);
            assert_eq!(msg.close_flag(), None);
            received.extend_from_slice(msg.payload().unwrap());
        }
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn close_write_sends_fin_and_blocks_writes() {
        let (channel, mut peer) = setup();

        channel.close_write().await.unwrap();
        assert_eq!(channel.state(), ChannelState::WriteClosed);
        assert_eq!(peer.next().await.unwrap().close_flag(), Some(Flag::Fin));

        let err = channel.write(b"late").await.unwrap_err();
        assert!(err.is_closed_pipe());
    }

    #[tokio::test]
    async fn read_drains_then_eof_after_fin() {
        let (channel, mut peer) = setup();
        peer.send(Message::data(Bytes::from_static(b"hello"))).await;
        peer.send(Message::with_flag(Flag::Fin)).await;

        let mut buf = [0u8; 64];
        let n = timeout(WAIT, channel.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(timeout(WAIT, channel.read(&mut buf)).await.unwrap().unwrap(), 0);
        assert_eq!(channel.state(), ChannelState::ReadClosed);

        // The write side is unaffected by the peer's FIN.
        assert_eq!(channel.write(b"reply").await.unwrap(), 5);
        assert_eq!(peer.next().await.unwrap().payload().unwrap().as_ref(), b"reply");

        timeout(WAIT, channel.close_write()).await.unwrap().unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.is_torn_down());
        assert_eq!(peer.flags_until_closed().await, vec![Flag::Fin]);

        timeout(WAIT, channel.close()).await.unwrap();
    }

    #[tokio::test]
    async fn small_reads_consume_buffer_in_order() {
        let (channel, mut peer) = setup();
        peer.send(Message::data(Bytes::from_static(b"abcdef"))).await;

        let mut buf = [0u8; 4];
        let n = timeout(WAIT, channel.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn payload_is_applied_before_flag() {
        let (channel, _peer) = setup();
        channel.apply_incoming(Message {
            flag: Some(Flag::Fin as i32),
            message: Some(Bytes::from_static(b"tail")),
        });

        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn data_after_close_read_is_dropped() {
        let (channel, mut peer) = setup();

        channel.close_read().await.unwrap();
        assert_eq!(peer.next().await.unwrap().close_flag(), Some(Flag::StopSending));
        assert_eq!(channel.state(), ChannelState::ReadClosed);

        channel.apply_incoming(Message::data(Bytes::from_static(b"ignored")));
        let mut buf = [0u8; 16];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incoming_stop_sending_fails_writes() {
        let (channel, _peer) = setup();
        channel.apply_incoming(Message::with_flag(Flag::StopSending));

        assert_eq!(channel.state(), ChannelState::WriteClosed);
        assert!(channel.write(b"x").await.unwrap_err().is_closed_pipe());
    }

    #[tokio::test]
    async fn incoming_reset_tears_down() {
        let (channel, mut peer) = setup();
        peer.send(Message::with_flag(Flag::Reset)).await;

        let mut buf = [0u8; 16];
        assert_eq!(timeout(WAIT, channel.read(&mut buf)).await.unwrap().unwrap(), 0);
        timeout(WAIT, channel.closed()).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);

        // Nothing is sent in reply to a RESET.
        assert!(peer.flags_until_closed().await.is_empty());
    }

    #[tokio::test]
    async fn write_blocks_until_peer_drains() {
        let (channel, mut peer) = setup();
        let data = vec![7u8; DEFAULT_CHUNK * 4];

        let mut write = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.write(&data).await })
        };

        // Three full messages fit under the buffered limit; the fourth waits.
        assert!(timeout(Duration::from_millis(50), &mut write).await.is_err());
        let buffered = channel.transport().buffered_amount();
        assert!(buffered >= 3 * DEFAULT_CHUNK && buffered <= MAX_BUFFERED_AMOUNT);

        for _ in 0..4 {
            assert_eq!(peer.next().await.unwrap().payload_len(), DEFAULT_CHUNK);
        }
        let written = timeout(WAIT, write).await.unwrap().unwrap().unwrap();
        assert_eq!(written, DEFAULT_CHUNK * 4);
    }

    async fn fill_send_buffer(channel: &DataChannel<MemoryDataChannel>) {
        let data = vec![0u8; DEFAULT_CHUNK * 3];
        assert_eq!(channel.write(&data).await.unwrap(), data.len());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_write_hits_deadline() {
        let (channel, _peer) = setup();
        fill_send_buffer(&channel).await;

        channel.set_write_deadline(Some(Instant::now() + Duration::from_millis(100)));
        let err = channel.write(&[1u8; 1024]).await.unwrap_err();
        assert!(err.is_deadline_exceeded());

        // A missed deadline does not close anything.
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn past_write_deadline_fails_immediately() {
        let (channel, _peer) = setup();
        channel.set_write_deadline(Some(Instant::now()));

        let err = channel.write(b"x").await.unwrap_err();
        assert!(err.is_deadline_exceeded());

        channel.set_write_deadline(None);
        assert_eq!(channel.write(b"x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deadline_update_wakes_blocked_writer() {
        let (channel, _peer) = setup();
        fill_send_buffer(&channel).await;

        let mut write = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.write(&[1u8; 1024]).await })
        };
        assert!(timeout(Duration::from_millis(20), &mut write).await.is_err());

        channel.set_write_deadline(Some(Instant::now()));
        let err = timeout(WAIT, write).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[tokio::test]
    async fn stop_sending_wakes_blocked_writer() {
        let (channel, _peer) = setup();
        fill_send_buffer(&channel).await;

        let mut write = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.write(&[1u8; 1024]).await })
        };
        assert!(timeout(Duration::from_millis(20), &mut write).await.is_err());

        channel.apply_incoming(Message::with_flag(Flag::StopSending));
        let err = timeout(WAIT, write).await.unwrap().unwrap().unwrap_err();
        assert!(err.is_closed_pipe());
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_exceeded_then_retry() {
        let (channel, mut peer) = setup();
        let mut buf = [0u8; 16];

        channel.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let err = channel.read(&mut buf).await.unwrap_err();
        assert!(err.is_deadline_exceeded());

        peer.send(Message::data(Bytes::from_static(b"later"))).await;
        channel.set_read_deadline(None);
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"later");
    }

    #[tokio::test]
    async fn concurrent_close_write_sends_one_fin() {
        let (channel, mut peer) = setup();

        let results = join_all((0..16).map(|_| channel.close_write())).await;
        assert!(results.iter().all(Result::is_ok));

        timeout(WAIT, channel.close()).await.unwrap();
        assert_eq!(peer.flags_until_closed().await, vec![Flag::Fin]);
    }

    #[tokio::test]
    async fn concurrent_mixed_closes_send_each_flag_once() {
        let (channel, mut peer) = setup();

        let (close_write, close_read, reset, (), close_write_again, reset_again) =
            timeout(WAIT, async {
                tokio::join!(
                    channel.close_write(),
                    channel.close_read(),
                    channel.reset(),
                    channel.close(),
                    channel.close_write(),
                    channel.reset(),
                )
            })
            .await
            .unwrap();
        for result in [close_write, close_read, reset, close_write_again, reset_again] {
            result.unwrap();
        }

        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(
            peer.flags_until_closed().await,
            vec![Flag::Fin, Flag::StopSending, Flag::Reset]
        );
    }

    #[tokio::test]
    async fn reset_after_both_half_closes_still_sends_reset() {
        let (channel, mut peer) = setup();

        let (close_read, close_write, reset, ()) = timeout(WAIT, async {
            tokio::join!(
                channel.close_read(),
                channel.close_write(),
                channel.reset(),
                channel.close(),
            )
        })
        .await
        .unwrap();
        close_read.unwrap();
        close_write.unwrap();
        reset.unwrap();

        assert_eq!(
            peer.flags_until_closed().await,
            vec![Flag::StopSending, Flag::Fin, Flag::Reset]
        );
    }

    #[tokio::test]
    async fn close_ops_after_close_send_nothing() {
        let (channel, mut peer) = setup();

        timeout(WAIT, channel.close()).await.unwrap();
        channel.close_read().await.unwrap();
        channel.reset().await.unwrap();
        assert_eq!(peer.flags_until_closed().await, vec![Flag::Fin]);
    }

    #[tokio::test]
    async fn close_sends_fin_and_is_idempotent() {
        let (channel, mut peer) = setup();

        timeout(WAIT, channel.close()).await.unwrap();
        timeout(WAIT, channel.close()).await.unwrap();
        assert!(channel.close_write().await.is_ok());
        assert!(channel.close_read().await.is_ok());
        assert!(channel.reset().await.is_ok());

        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(peer.flags_until_closed().await, vec![Flag::Fin]);
    }

    #[tokio::test]
    async fn reset_suppresses_fin() {
        let (channel, mut peer) = setup();

        timeout(WAIT, channel.reset()).await.unwrap().unwrap();
        timeout(WAIT, channel.close()).await.unwrap();
        assert_eq!(peer.flags_until_closed().await, vec![Flag::Reset]);
    }

    #[tokio::test]
    async fn transport_eof_unblocks_reader() {
        let (local, remote) = MemoryDataChannel::pair();
        let channel = DataChannel::new(local);

        let read = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                channel.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        remote.close().await.unwrap();

        assert_eq!(timeout(WAIT, read).await.unwrap().unwrap().unwrap(), 0);
        assert_eq!(channel.state(), ChannelState::Closed);
        timeout(WAIT, channel.close()).await.unwrap();
        assert!(channel.transport().is_closed());
        assert!(channel.write(b"x").await.unwrap_err().is_closed_pipe());
    }

    #[tokio::test(start_paused = true)]
    async fn short_write_error_is_returned_next() {
        let (channel, mut peer) = setup();

        channel.set_write_deadline(Some(Instant::now() + Duration::from_millis(100)));
        let written = channel.write(&vec![0u8; DEFAULT_CHUNK * 4]).await.unwrap();
        assert_eq!(written, DEFAULT_CHUNK * 3);

        // Clearing the deadline does not hide the failure.
        channel.set_write_deadline(None);
        let err = channel.write(b"x").await.unwrap_err();
        assert!(err.is_deadline_exceeded());

        // Reported once; the channel keeps working.
        for _ in 0..3 {
            peer.next().await.unwrap();
        }
        assert_eq!(channel.write(b"x").await.unwrap(), 1);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    /// Memory channel whose sends fail with an I/O error while `failing`.
    struct FailingSend {
        inner: MemoryDataChannel,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl DataChannelTransport for FailingSend {
        async fn send(&self, data: Bytes) -> dcstream_transport::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Io(std::io::Error::other(
                    "association aborted",
                )));
            }
            self.inner.send(data).await
        }

        async fn recv(&self) -> dcstream_transport::Result<Bytes> {
            self.inner.recv().await
        }

        fn buffered_amount(&self) -> usize {
            self.inner.buffered_amount()
        }

        fn on_buffered_amount_low(&self, threshold: usize, callback: BufferedAmountLowFn) {
            self.inner.on_buffered_amount_low(threshold, callback);
        }

        async fn close(&self) -> dcstream_transport::Result<()> {
            self.inner.close().await
        }
    }

    fn failing_setup(failing: bool) -> (Arc<DataChannel<FailingSend>>, Peer) {
        let (local, remote) = MemoryDataChannel::pair();
        let remote = Arc::new(remote);
        let peer = Peer {
            reader: FrameReader::new(Arc::clone(&remote)),
            writer: FrameWriter::new(remote),
        };
        let transport = FailingSend {
            inner: local,
            failing: AtomicBool::new(failing),
        };
        (DataChannel::new(transport), peer)
    }

    fn is_io_failure(err: &StreamError) -> bool {
        matches!(
            err,
            StreamError::Frame(frame)
                if matches!(frame.as_ref(), FrameError::Transport(TransportError::Io(_)))
        )
    }

    #[tokio::test]
    async fn send_failure_tears_down() {
        let (channel, mut peer) = failing_setup(true);

        let err = channel.write(b"x").await.unwrap_err();
        assert!(is_io_failure(&err), "{err}");
        assert!(channel.is_torn_down());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.transport().inner.is_closed());
        assert!(channel.write(b"x").await.unwrap_err().is_closed_pipe());

        // The peer sees the transport go away.
        assert!(peer.flags_until_closed().await.is_empty());
    }

    #[tokio::test]
    async fn close_write_send_failure_tears_down() {
        let (channel, _peer) = failing_setup(false);
        channel.write(b"first").await.unwrap();

        channel.transport().failing.store(true, Ordering::SeqCst);
        let err = channel.close_write().await.unwrap_err();
        assert!(is_io_failure(&err), "{err}");
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.transport().inner.is_closed());
    }

    #[tokio::test]
    async fn cancelled_background_fails_pending_read() {
        let (channel, _peer) = setup();
        channel.cancel_background();

        let mut buf = [0u8; 8];
        let err = timeout(WAIT, channel.read(&mut buf)).await.unwrap().unwrap_err();
        assert!(err.is_closed_pipe());
    }

    #[tokio::test]
    async fn zero_read_request_capacity_still_reads() {
        let (local, remote) = MemoryDataChannel::pair();
        let config = ChannelConfig {
            read_request_capacity: 0,
            ..ChannelConfig::default()
        };
        let channel = DataChannel::with_config(local, config);
        let mut writer = FrameWriter::new(Arc::new(remote));

        writer
            .write_message(&Message::data(Bytes::from_static(b"hi")))
            .await
            .unwrap();
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, channel.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hi");
        timeout(WAIT, channel.close()).await.unwrap();
    }
}
