use std::{borrow::Cow, fmt, io};

use thiserror::Error;

use crate::sid::StreamId;

/// Coarse classification of connection-level errors this layer can raise.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    Internal,
    FlowControl,
    StreamState,
    FinalSize,
    ProtocolViolation,
    Application,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            ErrorKind::Internal => "the endpoint encountered an internal error and cannot continue",
            ErrorKind::FlowControl => "received more data than permitted in advertised data limits",
            ErrorKind::StreamState => "received a frame for a stream that was not in a state that permitted that frame",
            ErrorKind::FinalSize => "received a STREAM frame or a RST frame containing a different final size to the one already established",
            ErrorKind::ProtocolViolation => "detected an error with protocol compliance that was not covered by more specific error codes",
            ErrorKind::Application => "the application caused the stream to be torn down",
        })
    }
}

/// A connection-level error: the session translates these into connection
/// teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}, reason: {reason}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub reason: Cow<'static, str>,
}

impl TransportError {
    pub fn new<T: Into<Cow<'static, str>>>(kind: ErrorKind, reason: T) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// The cause carried by a local or remote stream reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream {stream_id} was reset with error code {error_code}")]
pub struct ResetStreamError {
    pub stream_id: StreamId,
    pub error_code: u64,
}

impl ResetStreamError {
    pub fn new(stream_id: StreamId, error_code: u64) -> Self {
        Self {
            stream_id,
            error_code,
        }
    }
}

/// What a blocked or subsequent `read`/`write` surfaces to the application.
///
/// End-of-stream is not an error: once the FIN has been delivered, `read`
/// returns `Ok(0)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error(transparent)]
    Connection(#[from] TransportError),
    #[error(transparent)]
    Reset(#[from] ResetStreamError),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("write on closed stream {0}")]
    Closed(StreamId),
}

impl StreamError {
    /// Whether the error came from an expired read or write deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::DeadlineExceeded)
    }

    /// Deadline errors are temporary: the call may be retried after the
    /// deadline is extended or cleared.
    pub fn is_temporary(&self) -> bool {
        matches!(self, StreamError::DeadlineExceeded)
    }
}

impl From<StreamError> for io::Error {
    fn from(value: StreamError) -> Self {
        match value {
            error @ StreamError::DeadlineExceeded => io::Error::new(io::ErrorKind::TimedOut, error),
            error @ (StreamError::Connection(..) | StreamError::Reset(..)) => {
                io::Error::new(io::ErrorKind::BrokenPipe, error)
            }
            error @ StreamError::Closed(..) => io::Error::new(io::ErrorKind::NotConnected, error),
        }
    }
}
