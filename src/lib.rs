//! Per-stream endpoint of a multiplexed, QUIC-like transport.
//!
//! A [`Stream`] layers an in-order, bidirectional byte stream over an
//! unordered, offset-addressed frame channel. The application gets a
//! blocking [`read`](Stream::read)/[`write`](Stream::write) pair with
//! deadlines and a cancellation handle; the session feeds inbound frames
//! through [`add_stream_frame`](Stream::add_stream_frame) and pulls
//! outbound bytes on demand through the packetizer surface
//! ([`has_data_for_writing`](Stream::has_data_for_writing),
//! [`get_data_for_writing`](Stream::get_data_for_writing)).
//!
//! Out-of-order, duplicated and overlapping frames are reconciled by the
//! [`FrameSorter`]; credit accounting is delegated to an external
//! [`FlowController`]; the session hears back through the narrow
//! [`StreamEvents`] interface. Everything above this layer (the stream
//! map, the wire codec, loss recovery) lives in the session.

pub mod error;
pub mod flow;
pub mod frame;
pub mod sid;
mod signal;
pub mod sorter;
pub mod stream;

pub use crate::{
    error::{ErrorKind, ResetStreamError, StreamError, TransportError},
    flow::FlowController,
    frame::StreamFrame,
    sid::{StreamId, Version},
    signal::CancelToken,
    sorter::{FrameSorter, PushOutcome},
    stream::{Stream, StreamEvents},
};
