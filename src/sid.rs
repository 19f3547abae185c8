use std::fmt;

/// Streams are identified within a connection by a numeric value, assigned
/// by the session when the stream is created.
///
/// This layer treats the id as opaque; the only id with special meaning is
/// the one [`Version::crypto_stream_id`] designates.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Transport version tag.
///
/// The only property this layer consumes is which stream id carries the
/// handshake: that stream bypasses stream-level flow control and may have
/// its read cursor reseated while the handshake is single-threaded.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Version(u32);

impl Version {
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    /// The reserved id of the stream that carries the handshake.
    pub fn crypto_stream_id(&self) -> StreamId {
        StreamId::new(1)
    }
}
