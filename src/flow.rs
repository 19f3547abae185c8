//! Stream-level flow control contract.
//!
//! The stream does not account credit itself; it consumes an external
//! accountant through this trait. Implementations synchronize internally:
//! the stream invokes some of these methods while holding its own lock and
//! some without it.

use crate::error::TransportError;

/// Credit accountant bounding in-flight bytes in each direction of one
/// stream.
pub trait FlowController: Send + Sync {
    /// Record the highest received offset, fixing the final size when
    /// `is_fin` is set.
    ///
    /// Errors when the offset contradicts earlier state: shrinking or
    /// moving an established final size, or exceeding the advertised
    /// receive limit.
    fn update_highest_received(&self, offset: u64, is_fin: bool) -> Result<(), TransportError>;

    /// Credit bytes the application has consumed, opening receive window.
    fn add_bytes_read(&self, n: u64);

    /// Debit bytes handed to the packetizer.
    fn add_bytes_sent(&self, n: u64);

    /// Remaining send credit.
    fn send_window_size(&self) -> u64;

    /// Raise the send limit from a peer window update.
    fn update_send_window(&self, n: u64);

    /// Whether sending is currently blocked on the peer's window.
    fn is_blocked(&self) -> bool;

    /// The new receive limit to advertise, if an update is due.
    fn window_update(&self) -> Option<u64>;
}
