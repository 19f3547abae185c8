//! The per-stream endpoint: blocking reader/writer for the application,
//! pull-based packetizer surface for the session.

use std::{
    fmt, io,
    sync::{Arc, Mutex},
    time::Instant,
};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    error::{ResetStreamError, StreamError, TransportError},
    flow::FlowController,
    frame::StreamFrame,
    sid::{StreamId, Version},
    signal::{CancelToken, Signal},
    sorter::{FrameSorter, PushOutcome},
};

/// Narrow interface the session implements to hear from its streams.
///
/// Callbacks run without the stream lock held, so they may take session
/// locks freely. The one exception is [`on_reset`]: it runs under the
/// stream lock so the RST and its final write offset are captured
/// atomically (see [`Stream::reset`]).
///
/// [`on_reset`]: StreamEvents::on_reset
pub trait StreamEvents: Send + Sync {
    /// The stream has bytes or control state worth polling for: data was
    /// staged or read, the write side closed, or a window update may be
    /// due.
    fn on_data(&self);

    /// Send a RST for this stream carrying the final write offset.
    /// Invoked at most once per stream.
    fn on_reset(&self, stream_id: StreamId, final_offset: u64);
}

/// The once-only booleans of the stream lifecycle. Each transitions
/// false→true exactly once; all access happens under the stream lock.
#[derive(Debug, Default)]
struct Latches {
    cancelled: bool,
    finished_reading: bool,
    finished_writing: bool,
    reset_locally: bool,
    reset_remotely: bool,
    fin_sent: bool,
    rst_sent: bool,
}

impl Latches {
    fn finished_write_and_sent_fin(&self) -> bool {
        self.finished_writing && self.fin_sent
    }

    /// A stream that already finished its write side cleanly has no RST
    /// to send.
    fn should_send_reset(&self) -> bool {
        !self.rst_sent
            && (self.reset_locally || self.reset_remotely)
            && !self.finished_write_and_sent_fin()
    }

    /// No further obligations in either direction.
    fn finished(&self) -> bool {
        self.cancelled
            || (self.finished_reading && self.finished_write_and_sent_fin())
            || (self.reset_remotely && self.rst_sent)
            || (self.finished_reading && self.rst_sent)
            || (self.finished_write_and_sent_fin() && self.reset_remotely)
    }
}

#[derive(Debug, Default)]
struct StreamInner {
    frame_queue: FrameSorter,
    /// Total bytes delivered to the application.
    read_offset: u64,
    /// Cursor inside the current head frame.
    read_pos_in_frame: usize,
    /// Total bytes handed to the packetizer.
    write_offset: u64,
    /// At most one application buffer pending packetization.
    staging: Option<Bytes>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    /// First terminal error observed; never rewritten once set.
    err: Option<StreamError>,
    latches: Latches,
}

impl StreamInner {
    /// Returns whether this call installed the error.
    fn set_err_once(&mut self, err: StreamError) -> bool {
        if self.err.is_none() {
            self.err = Some(err);
            true
        } else {
            false
        }
    }
}

/// A bidirectional stream multiplexed on a connection.
///
/// Shared by `Arc` between the application and the session: every method
/// takes `&self`. `read` and `write` block and must each be driven by a
/// single task; everything else never blocks on user I/O.
pub struct Stream {
    stream_id: StreamId,
    version: Version,
    events: Arc<dyn StreamEvents>,
    flow: Arc<dyn FlowController>,
    ctx: CancelToken,
    read_signal: Signal,
    write_signal: Signal,
    inner: Mutex<StreamInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub fn new(
        stream_id: StreamId,
        events: Arc<dyn StreamEvents>,
        flow: Arc<dyn FlowController>,
        version: Version,
    ) -> Self {
        Self {
            stream_id,
            version,
            events,
            flow,
            ctx: CancelToken::new(),
            read_signal: Signal::new(),
            write_signal: Signal::new(),
            inner: Mutex::new(StreamInner::default()),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Cancellation handle; observes close, reset and session abort.
    pub fn context(&self) -> CancelToken {
        self.ctx.clone()
    }

    /// Blocking read of reassembled stream bytes.
    ///
    /// Returns once at least one byte was copied and no further byte is
    /// available without blocking. `Ok(0)` is end-of-stream (or an empty
    /// `buf`). An error is only returned when nothing was copied; a short
    /// read followed by the next call surfaces any latched error.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.latches.cancelled || inner.latches.reset_locally {
                return short_read(0, inner.err.clone());
            }
            if inner.latches.finished_reading {
                return Ok(0);
            }
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() {
            let mut inner = self.inner.lock().unwrap();
            if inner.frame_queue.head().is_none() && bytes_read > 0 {
                // deliver eagerly instead of blocking mid-read
                return Ok(bytes_read);
            }

            // wait for a frame at the cursor, a terminal latch, or the deadline
            loop {
                if inner.latches.reset_locally || inner.latches.cancelled {
                    return short_read(bytes_read, inner.err.clone());
                }
                if inner.latches.reset_remotely && inner.frame_queue.head().is_none() {
                    // queued bytes were drained; the remote reset now terminates reads
                    return short_read(bytes_read, inner.err.clone());
                }
                let deadline = inner.read_deadline;
                if deadline.is_some_and(|at| Instant::now() >= at) {
                    return short_read(bytes_read, Some(StreamError::DeadlineExceeded));
                }
                if inner.frame_queue.head().is_some() {
                    break;
                }
                drop(inner);
                match deadline {
                    Some(at) => {
                        let _ = self.read_signal.wait_until(at);
                    }
                    None => self.read_signal.wait(),
                }
                inner = self.inner.lock().unwrap();
            }

            let (pos, copied, frame_len, is_fin) = {
                let Some(head) = inner.frame_queue.head() else {
                    continue;
                };
                let pos = (inner.read_offset - head.offset) as usize;
                debug_assert!(pos <= head.len());
                let copied = (buf.len() - bytes_read).min(head.len() - pos);
                buf[bytes_read..bytes_read + copied]
                    .copy_from_slice(&head.data[pos..pos + copied]);
                (pos, copied, head.len(), head.fin)
            };
            inner.read_pos_in_frame = pos + copied;
            inner.read_offset += copied as u64;
            bytes_read += copied;

            let reset_remotely = inner.latches.reset_remotely;
            let mut end_of_stream = false;
            if inner.read_pos_in_frame >= frame_len {
                inner.frame_queue.pop();
                if is_fin {
                    inner.latches.finished_reading = true;
                    end_of_stream = true;
                }
            }
            drop(inner);

            // after a remote reset the peer already reported the final
            // offset, so consumed bytes no longer open the window
            if copied > 0 && !reset_remotely {
                self.flow.add_bytes_read(copied as u64);
            }
            self.events.on_data(); // a window update may be due

            if end_of_stream {
                return Ok(bytes_read);
            }
        }
        Ok(bytes_read)
    }

    /// Blocking write: stages a copy of `buf` and waits until the
    /// packetizer drains it.
    ///
    /// On a terminal error mid-drain the number of bytes already handed
    /// over is returned; the next call surfaces the error. An expired
    /// write deadline reports [`StreamError::DeadlineExceeded`] without a
    /// byte count, even when part of the buffer already drained.
    pub fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.latches.reset_locally || inner.err.is_some() {
                return match inner.err.clone() {
                    Some(err) => Err(err),
                    None => Ok(0),
                };
            }
            if inner.latches.finished_writing {
                return Err(StreamError::Closed(self.stream_id));
            }
            if buf.is_empty() {
                return Ok(0);
            }
            inner.staging = Some(Bytes::copy_from_slice(buf));
        }
        self.events.on_data();

        let mut inner = self.inner.lock().unwrap();
        loop {
            let deadline = inner.write_deadline;
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Err(StreamError::DeadlineExceeded);
            }
            if inner.staging.is_none() || inner.err.is_some() {
                break;
            }
            drop(inner);
            match deadline {
                Some(at) => {
                    let _ = self.write_signal.wait_until(at);
                }
                None => self.write_signal.wait(),
            }
            inner = self.inner.lock().unwrap();
        }

        let pending = inner.staging.as_ref().map_or(0, Bytes::len);
        match inner.err.clone() {
            Some(err) if buf.len() == pending => Err(err),
            Some(_) => Ok(buf.len() - pending),
            None => Ok(buf.len()),
        }
    }

    /// Half-close the write side. The packetizer drains any staged bytes
    /// and then emits FIN. Never errors; calling again re-signals
    /// harmlessly.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.latches.finished_writing = true;
        }
        trace!(stream_id = %self.stream_id, "write side closed");
        self.ctx.cancel();
        self.events.on_data();
    }

    /// Session-initiated abort. Both reader and writer return `err`.
    pub fn cancel(&self, err: TransportError) {
        let mut inner = self.inner.lock().unwrap();
        inner.latches.cancelled = true;
        self.ctx.cancel();
        debug!(stream_id = %self.stream_id, %err, "stream cancelled by session");
        if inner.set_err_once(StreamError::Connection(err)) {
            self.read_signal.notify();
            self.write_signal.notify();
        }
    }

    /// Local abort: latch the reset, unblock reader and writer, and ask
    /// the session to put a RST on the wire. Idempotent.
    pub fn reset(&self, error_code: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.latches.reset_locally {
            return;
        }
        inner.latches.reset_locally = true;
        self.ctx.cancel();
        debug!(stream_id = %self.stream_id, error_code, "stream reset locally");
        let cause = ResetStreamError::new(self.stream_id, error_code);
        if inner.set_err_once(StreamError::Reset(cause)) {
            self.read_signal.notify();
            self.write_signal.notify();
        }
        if inner.latches.should_send_reset() {
            // on_reset runs under the stream lock: the final write offset
            // must not advance between the decision and the callback
            self.events.on_reset(self.stream_id, inner.write_offset);
            inner.latches.rst_sent = true;
        }
    }

    /// The peer sent a RST with `final_offset` as the size of its write
    /// side. Queued bytes stay readable until the queue drains; the
    /// writer unblocks with the cause. Idempotent.
    ///
    /// Errors when `final_offset` contradicts flow-control state.
    pub fn register_remote_error(
        &self,
        error_code: u64,
        final_offset: u64,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.latches.reset_remotely {
            return Ok(());
        }
        inner.latches.reset_remotely = true;
        self.ctx.cancel();
        debug!(stream_id = %self.stream_id, error_code, final_offset, "stream reset by peer");
        let cause = ResetStreamError::new(self.stream_id, error_code);
        if inner.set_err_once(StreamError::Reset(cause)) {
            self.write_signal.notify();
            // the reader re-checks: it terminates once the queue drains
            self.read_signal.notify();
        }
        self.flow.update_highest_received(final_offset, true)?;
        if inner.latches.should_send_reset() {
            self.events.on_reset(self.stream_id, inner.write_offset);
            inner.latches.rst_sent = true;
        }
        Ok(())
    }

    /// True once the stream has no further obligations and the session
    /// may drop it.
    pub fn finished(&self) -> bool {
        self.inner.lock().unwrap().latches.finished()
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let wake = {
            let mut inner = self.inner.lock().unwrap();
            let wake = deadline_moved_up(inner.read_deadline, deadline);
            inner.read_deadline = deadline;
            wake
        };
        if wake {
            self.read_signal.notify();
        }
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        let wake = {
            let mut inner = self.inner.lock().unwrap();
            let wake = deadline_moved_up(inner.write_deadline, deadline);
            inner.write_deadline = deadline;
            wake
        };
        if wake {
            self.write_signal.notify();
        }
    }

    /// Set both deadlines at once. `None` disables.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

/// Session-facing inbound path and packetizer contract.
impl Stream {
    /// Route an inbound frame into the reassembly queue and wake the
    /// reader. Duplicates are absorbed; conflicting or limit-violating
    /// frames are connection errors.
    pub fn add_stream_frame(&self, frame: StreamFrame) -> Result<(), TransportError> {
        // the high-water mark moves before the duplicate check; a duplicate
        // re-reports an offset the accountant already recorded
        self.flow.update_highest_received(frame.end(), frame.fin)?;
        {
            let mut inner = self.inner.lock().unwrap();
            if let PushOutcome::Duplicate = inner.frame_queue.push(frame)? {
                trace!(stream_id = %self.stream_id, "duplicate stream data absorbed");
            }
        }
        self.read_signal.notify();
        Ok(())
    }

    /// The session learned end-of-stream at `offset` without a real frame:
    /// synthesise the FIN.
    pub fn close_remote(&self, offset: u64) {
        if let Err(err) = self.add_stream_frame(StreamFrame::fin_only(offset)) {
            debug!(stream_id = %self.stream_id, %err, "synthesised FIN rejected");
            let mut inner = self.inner.lock().unwrap();
            if inner.set_err_once(StreamError::Connection(err)) {
                self.read_signal.notify();
                self.write_signal.notify();
            }
        }
    }

    /// Whether a packetizer pull would yield bytes or a FIN.
    pub fn has_data_for_writing(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.err.is_none()
            && (inner.staging.is_some()
                || (inner.latches.finished_writing && !inner.latches.fin_sent))
    }

    /// Pull up to `max_bytes` staged bytes. The second value reports
    /// whether a FIN should ride on this frame; observing it latches the
    /// FIN as sent.
    pub fn get_data_for_writing(&self, max_bytes: usize) -> (Option<Bytes>, bool) {
        let (data, send_fin) = self.get_data_for_writing_impl(max_bytes);
        if send_fin {
            self.inner.lock().unwrap().latches.fin_sent = true;
            trace!(stream_id = %self.stream_id, "FIN handed to packetizer");
        }
        (data, send_fin)
    }

    fn get_data_for_writing_impl(&self, mut max_bytes: usize) -> (Option<Bytes>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.err.is_some() || inner.staging.is_none() {
            return (
                None,
                inner.latches.finished_writing && !inner.latches.fin_sent,
            );
        }

        // the handshake stream polices itself; every other stream is
        // clamped by the peer's window
        if self.stream_id != self.version.crypto_stream_id() {
            max_bytes = max_bytes.min(self.flow.send_window_size() as usize);
        }
        if max_bytes == 0 {
            return (None, false);
        }

        let Some(mut staging) = inner.staging.take() else {
            return (None, false);
        };
        let data = if staging.len() > max_bytes {
            let head = staging.split_to(max_bytes);
            inner.staging = Some(staging);
            head
        } else {
            self.write_signal.notify();
            staging
        };
        inner.write_offset += data.len() as u64;
        self.flow.add_bytes_sent(data.len() as u64);
        let send_fin = inner.latches.finished_writing
            && inner.staging.is_none()
            && !inner.latches.fin_sent;
        (Some(data), send_fin)
    }

    /// Total bytes handed to the packetizer so far; the offset the next
    /// outbound frame carries.
    pub fn write_offset(&self) -> u64 {
        self.inner.lock().unwrap().write_offset
    }

    pub fn update_send_window(&self, n: u64) {
        self.flow.update_send_window(n);
    }

    pub fn is_flow_control_blocked(&self) -> bool {
        self.flow.is_blocked()
    }

    /// The new receive limit to advertise, if an update is due.
    pub fn window_update(&self) -> Option<u64> {
        self.flow.window_update()
    }

    /// Reseat the read cursor during the handshake rewind. Crypto stream
    /// only; must not run concurrently with `read` or `add_stream_frame`.
    pub fn set_read_offset(&self, offset: u64) {
        debug_assert_eq!(self.stream_id, self.version.crypto_stream_id());
        let mut inner = self.inner.lock().unwrap();
        inner.read_offset = offset;
        inner.read_pos_in_frame = 0;
        inner.frame_queue.set_read_position(offset);
    }
}

impl io::Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(*self, buf).map_err(Into::into)
    }
}

impl io::Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(*self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Short reads win over latched errors: the error surfaces on the next
/// call instead.
fn short_read(bytes_read: usize, err: Option<StreamError>) -> Result<usize, StreamError> {
    match err {
        Some(err) if bytes_read == 0 => Err(err),
        _ => Ok(bytes_read),
    }
}

/// Whether the waiter must re-evaluate: the new deadline may fire before
/// the one it is parked on. No deadline counts as infinitely late.
fn deadline_moved_up(old: Option<Instant>, new: Option<Instant>) -> bool {
    match (new, old) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(new), Some(old)) => new < old,
    }
}
