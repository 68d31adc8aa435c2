use std::io;
use std::sync::Arc;

use dcstream_frame::FrameError;
use dcstream_transport::TransportError;

/// Errors surfaced by data channel and stream operations.
///
/// `Clone` so that every concurrent caller of a run-once close operation
/// receives the outcome of the single execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// The direction is closed, or the channel was torn down mid-wait.
    #[error("closed pipe")]
    ClosedPipe,

    /// A read or write deadline elapsed. The stream stays usable.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Encoding, decoding or transport failure.
    #[error("frame error: {0}")]
    Frame(#[source] Arc<FrameError>),
}

impl StreamError {
    /// Returns true for [`StreamError::ClosedPipe`].
    pub fn is_closed_pipe(&self) -> bool {
        matches!(self, StreamError::ClosedPipe)
    }

    /// Returns true for [`StreamError::DeadlineExceeded`].
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, StreamError::DeadlineExceeded)
    }
}

impl From<FrameError> for StreamError {
    fn from(err: FrameError) -> Self {
        StreamError::Frame(Arc::new(err))
    }
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        FrameError::from(err).into()
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::ClosedPipe => io::ErrorKind::BrokenPipe,
            StreamError::DeadlineExceeded => io::ErrorKind::TimedOut,
            StreamError::Frame(frame) if frame.is_connection_closed() => {
                io::ErrorKind::UnexpectedEof
            }
            StreamError::Frame(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
