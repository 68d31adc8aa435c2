//! Data channel transport abstraction.
//!
//! dcstream runs on top of a message-oriented data channel: a primitive
//! that sends and receives whole, size-bounded messages and reports how many
//! bytes it still has queued for transmission. This crate defines that
//! surface as [`DataChannelTransport`] and ships [`MemoryDataChannel`], an
//! in-process pair used by tests and demos.
//!
//! This is the lowest layer of dcstream. Everything else builds on top of
//! the trait provided here.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, TransportError};
pub use memory::{MemoryChannelConfig, MemoryDataChannel, DEFAULT_MAX_MESSAGE_SIZE};
pub use traits::{BufferedAmountLowFn, DataChannelTransport};
