//! Half-closable byte streams over message-oriented data channels.
//!
//! dcstream turns a data channel that moves whole, size-bounded messages
//! into a reliable byte stream with independent read/write half-close,
//! abortive reset, flow-controlled writes and deadlines.
//!
//! # Crate Structure
//!
//! - [`transport`]: Data channel abstraction and an in-memory pair
//! - [`frame`]: Length-delimited protobuf messages carrying data and close flags
//! - [`channel`]: Close state machine, framed channel and stream wrapper
//! - `logging`: `tracing-subscriber` setup (behind the `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use dcstream_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use dcstream_frame::*;
}

/// Re-export channel and stream types.
pub mod channel {
    pub use dcstream_channel::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use dcstream_channel::{ChannelState, DataChannel, Stream, StreamError};
