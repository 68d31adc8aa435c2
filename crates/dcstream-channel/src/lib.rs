//! Half-closable byte streams over framed data channels.
//!
//! This is the layer applications use. A [`DataChannel`] turns a
//! message-oriented transport into a byte stream with:
//! - Independent read and write half-close (STOP_SENDING / FIN)
//! - Abortive close in both directions (RESET)
//! - Writes held back while the transport's buffered amount is high
//! - Read and write deadlines
//!
//! [`Stream`] wraps a channel for multiplexed use: it also keeps consuming
//! control messages after the application stops reading, so the peer's
//! close signals are never lost.

pub mod channel;
pub mod config;
pub mod error;
pub mod state;
pub mod stream;

pub use channel::DataChannel;
pub use config::{ChannelConfig, BUFFERED_AMOUNT_LOW_THRESHOLD, MAX_BUFFERED_AMOUNT};
pub use error::{Result, StreamError};
pub use state::{ChannelState, Signal};
pub use stream::Stream;
