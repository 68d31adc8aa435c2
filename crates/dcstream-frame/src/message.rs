//! Wire message and close flags.
//!
//! ```text
//! message Message {
//!   enum Flag { FIN = 0; STOP_SENDING = 1; RESET = 2; }
//!   optional Flag  flag    = 1;
//!   optional bytes message = 2;
//! }
//! ```

use std::fmt;

use bytes::Bytes;

/// Out-of-band close signal carried in the same message stream as data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Flag {
    /// The sender will send no more data.
    Fin = 0,
    /// The sender will read no more data.
    StopSending = 1,
    /// The sender abandoned the stream in both directions.
    Reset = 2,
}

impl Flag {
    /// Wire name of the flag.
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::Fin => "FIN",
            Flag::StopSending => "STOP_SENDING",
            Flag::Reset => "RESET",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message: an optional payload and/or an optional flag.
///
/// Messages carry no sequence number; ordering comes from the transport.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(enumeration = "Flag", optional, tag = "1")]
    pub flag: Option<i32>,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub message: Option<Bytes>,
}

impl Message {
    /// A data message.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            flag: None,
            message: Some(payload.into()),
        }
    }

    /// A flag-only message.
    pub fn with_flag(flag: Flag) -> Self {
        Self {
            flag: Some(flag as i32),
            message: None,
        }
    }

    /// The close flag, if present and known.
    pub fn close_flag(&self) -> Option<Flag> {
        self.flag.and_then(|raw| Flag::try_from(raw).ok())
    }

    /// The payload, if present.
    pub fn payload(&self) -> Option<&Bytes> {
        self.message.as_ref()
    }

    /// Payload length in bytes (zero for flag-only messages).
    pub fn payload_len(&self) -> usize {
        self.message.as_ref().map_or(0, Bytes::len)
    }

    /// Split into payload and flag.
    pub fn into_parts(self) -> (Option<Bytes>, Option<Flag>) {
        let flag = self.close_flag();
        (self.message, flag)
    }
}
