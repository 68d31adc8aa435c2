/// Errors reported by a data channel transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel has been closed, locally or by the remote side.
    ///
    /// Returned by `recv` once every queued message has been delivered,
    /// which makes it the clean end-of-stream signal.
    #[error("data channel closed")]
    Closed,

    /// The message exceeds the negotiated maximum message size.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// An I/O error occurred on the underlying association.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true for the clean end-of-stream condition.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
