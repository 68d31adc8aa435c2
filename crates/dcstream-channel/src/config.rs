use dcstream_frame::{FrameConfig, MAX_MESSAGE_SIZE};

/// Buffered bytes above which writers block: room for 3 full-size messages.
///
/// The limit is per stream while congestion control covers the whole
/// association, so one stream must not be allowed to fill the window.
pub const MAX_BUFFERED_AMOUNT: usize = 3 * MAX_MESSAGE_SIZE;

/// Blocked writers resume once buffered bytes fall to one full-size message.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = MAX_MESSAGE_SIZE;

const DEFAULT_READ_REQUEST_CAPACITY: usize = 5;

/// Configuration for a data channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Message framing limits.
    pub frame: FrameConfig,
    /// Writers block while the projected buffered amount exceeds this.
    ///
    /// Keep it at or above `frame.max_message_size`: a full chunk never fits
    /// under a smaller limit, so such writes wait until their deadline (or
    /// forever without one).
    pub max_buffered_amount: usize,
    /// Low watermark registered with the transport.
    pub buffered_amount_low_threshold: usize,
    /// Pending read requests queued for the background read loop.
    /// Zero is treated as one.
    pub read_request_capacity: usize,
}

impl ChannelConfig {
    /// Largest payload carried by one data message.
    pub fn chunk_size(&self) -> usize {
        self.frame.chunk_size()
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            max_buffered_amount: MAX_BUFFERED_AMOUNT,
            buffered_amount_low_threshold: BUFFERED_AMOUNT_LOW_THRESHOLD,
            read_request_capacity: DEFAULT_READ_REQUEST_CAPACITY,
        }
    }
}
