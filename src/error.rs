//! Error taxonomy shared by the codec, the worker pool and the server

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed length, header or segment on the wire.
    #[error("framing error: {0}")]
    Framing(String),

    /// The peer closed the stream in the middle of a field or payload.
    #[error("unexpected end of stream")]
    EndOfStream,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unknown command or malformed request fields.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection budget is exhausted.
    #[error("server busy")]
    AdmissionRejected,

    #[error("operation cancelled")]
    Cancelled,

    #[error("message too large: {0} bytes")]
    TooLarge(u64),
}

impl SyncError {
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True when the failure leaves the connection unusable for further requests.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Framing(_) | Self::EndOfStream | Self::Io(_) | Self::Cancelled
        )
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
