//! Half-close state machine.
//!
//! Read and write are independent axes folded into one enum; closing both
//! yields [`ChannelState::Closed`]. Transitions only ever move towards
//! `Closed`, and repeating a signal is a no-op.
//!
//! ```text
//!            FIN in / STOP_SENDING out
//!   Open ───────────────────────────────> ReadClosed
//!    │                                        │
//!    │ STOP_SENDING in / FIN out              │ STOP_SENDING in / FIN out
//!    v                                        v
//!   WriteClosed ───────────────────────────> Closed <── RESET (either way)
//!            FIN in / STOP_SENDING out
//! ```

use std::fmt;

use dcstream_frame::Flag;

/// Lifecycle state of one data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    /// Both directions open.
    #[default]
    Open,
    /// No more data will be delivered to the local reader.
    ReadClosed,
    /// The local writer may not send more data.
    WriteClosed,
    /// Both directions closed.
    Closed,
}

/// A close signal, either sent by us or received from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// A flag received from the peer.
    Incoming(Flag),
    /// A flag we are sending.
    Outgoing(Flag),
}

impl ChannelState {
    /// Compute the state that follows `signal`.
    pub fn transition(self, signal: Signal) -> Self {
        match signal {
            // The peer stops sending, or we stop reading.
            Signal::Incoming(Flag::Fin) | Signal::Outgoing(Flag::StopSending) => self.close_read(),
            // The peer stops reading, or we stop sending.
            Signal::Incoming(Flag::StopSending) | Signal::Outgoing(Flag::Fin) => {
                self.close_write()
            }
            Signal::Incoming(Flag::Reset) | Signal::Outgoing(Flag::Reset) => ChannelState::Closed,
        }
    }

    /// State after receiving `flag` from the peer.
    pub fn handle_incoming_flag(self, flag: Flag) -> Self {
        self.transition(Signal::Incoming(flag))
    }

    /// State after sending `flag` to the peer.
    pub fn process_outgoing_flag(self, flag: Flag) -> Self {
        self.transition(Signal::Outgoing(flag))
    }

    /// Whether the local reader may still receive data.
    pub fn allows_read(self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::WriteClosed)
    }

    /// Whether the local writer may still send data.
    pub fn allows_write(self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::ReadClosed)
    }

    /// Whether both directions are closed.
    pub fn is_closed(self) -> bool {
        self == ChannelState::Closed
    }

    fn close_read(self) -> Self {
        match self {
            ChannelState::Open => ChannelState::ReadClosed,
            ChannelState::WriteClosed => ChannelState::Closed,
            other => other,
        }
    }

    fn close_write(self) -> Self {
        match self {
            ChannelState::Open => ChannelState::WriteClosed,
            ChannelState::ReadClosed => ChannelState::Closed,
            other => other,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Open => "open",
            ChannelState::ReadClosed => "read-closed",
            ChannelState::WriteClosed => "write-closed",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}
