//! End-to-end scenarios: real reader/writer threads against a fake
//! session and packetizer.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use qstream::{
    ErrorKind, FlowController, ResetStreamError, Stream, StreamError, StreamEvents, StreamFrame,
    StreamId, TransportError, Version,
};

/// Session double: forwards `on_data` pokes to the test's packetizer loop
/// and records RSTs.
struct Session {
    data: Sender<()>,
    resets: Mutex<Vec<(StreamId, u64)>>,
}

impl Session {
    fn new() -> (Arc<Self>, Receiver<()>) {
        let (data, polls) = mpsc::channel();
        let session = Arc::new(Self {
            data,
            resets: Mutex::new(Vec::new()),
        });
        (session, polls)
    }
}

impl StreamEvents for Session {
    fn on_data(&self) {
        let _ = self.data.send(());
    }

    fn on_reset(&self, stream_id: StreamId, final_offset: u64) {
        self.resets.lock().unwrap().push((stream_id, final_offset));
    }
}

#[derive(Default)]
struct FlowState {
    highest: u64,
    final_size: Option<u64>,
    bytes_read: u64,
    bytes_sent: u64,
    max_send: u64,
}

struct Accountant(Mutex<FlowState>);

impl Accountant {
    fn with_send_window(max_send: u64) -> Arc<Self> {
        Arc::new(Self(Mutex::new(FlowState {
            max_send,
            ..FlowState::default()
        })))
    }

    fn bytes_sent(&self) -> u64 {
        self.0.lock().unwrap().bytes_sent
    }
}

impl FlowController for Accountant {
    fn update_highest_received(&self, offset: u64, is_fin: bool) -> Result<(), TransportError> {
        let mut state = self.0.lock().unwrap();
        if let Some(final_size) = state.final_size {
            if offset > final_size || (is_fin && offset != final_size) {
                return Err(TransportError::new(
                    ErrorKind::FinalSize,
                    "final size contradiction",
                ));
            }
        }
        if is_fin {
            if offset < state.highest {
                return Err(TransportError::new(
                    ErrorKind::FinalSize,
                    "final size below received data",
                ));
            }
            state.final_size = Some(offset);
        }
        state.highest = state.highest.max(offset);
        Ok(())
    }

    fn add_bytes_read(&self, n: u64) {
        self.0.lock().unwrap().bytes_read += n;
    }

    fn add_bytes_sent(&self, n: u64) {
        self.0.lock().unwrap().bytes_sent += n;
    }

    fn send_window_size(&self) -> u64 {
        let state = self.0.lock().unwrap();
        state.max_send.saturating_sub(state.bytes_sent)
    }

    fn update_send_window(&self, n: u64) {
        let mut state = self.0.lock().unwrap();
        state.max_send = state.max_send.max(n);
    }

    fn is_blocked(&self) -> bool {
        self.send_window_size() == 0
    }

    fn window_update(&self) -> Option<u64> {
        None
    }
}

fn new_stream() -> (Arc<Stream>, Arc<Session>, Receiver<()>, Arc<Accountant>) {
    let (session, polls) = Session::new();
    let flow = Accountant::with_send_window(1 << 20);
    let stream = Arc::new(Stream::new(
        StreamId::new(4),
        session.clone(),
        flow.clone(),
        Version::new(1),
    ));
    (stream, session, polls, flow)
}

fn frame(offset: u64, data: &'static str, fin: bool) -> StreamFrame {
    StreamFrame::new(offset, Bytes::from(data), fin)
}

fn wait_for_poll(polls: &Receiver<()>) {
    polls
        .recv_timeout(Duration::from_secs(1))
        .expect("expected an on_data poke");
}

#[test]
fn out_of_order_delivery_with_gap() {
    let (stream, _, _, _) = new_stream();

    let reader = {
        let stream = stream.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).unwrap();
            (n, buf)
        })
    };

    // the reader blocks on the gap at 0 until the first frame arrives
    stream.add_stream_frame(frame(5, " world", true)).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(!reader.is_finished());
    stream.add_stream_frame(frame(0, "hello", false)).unwrap();

    let (n, buf) = reader.join().unwrap();
    assert_eq!(n, 11);
    assert_eq!(&buf[..n], b"hello world");

    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).unwrap(), 0, "end of stream");
}

#[test]
fn arming_a_deadline_wakes_a_parked_reader() {
    let (stream, _, _, _) = new_stream();
    stream.add_stream_frame(frame(5, "world", false)).unwrap();

    let reader = {
        let stream = stream.clone();
        thread::spawn(move || stream.read(&mut [0u8; 16]))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!reader.is_finished());

    let start = Instant::now();
    stream.set_read_deadline(Some(start + Duration::from_millis(30)));
    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err, StreamError::DeadlineExceeded);
    assert!(err.is_timeout() && err.is_temporary());
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn write_drains_through_packetizer() {
    let (stream, _, polls, flow) = new_stream();

    let writer = {
        let stream = stream.clone();
        thread::spawn(move || stream.write(b"abcdef"))
    };

    wait_for_poll(&polls);
    let (data, send_fin) = stream.get_data_for_writing(3);
    assert_eq!(data.unwrap().as_ref(), b"abc");
    assert!(!send_fin);
    assert_eq!(stream.write_offset(), 3);

    let (data, send_fin) = stream.get_data_for_writing(10);
    assert_eq!(data.unwrap().as_ref(), b"def");
    assert!(!send_fin);

    assert_eq!(writer.join().unwrap().unwrap(), 6);
    assert_eq!(stream.write_offset(), 6);
    assert_eq!(flow.bytes_sent(), 6);
    assert!(!stream.has_data_for_writing());
}

#[test]
fn sequential_writes_stay_in_order() {
    let (stream, _, polls, _) = new_stream();

    let writer = {
        let stream = stream.clone();
        thread::spawn(move || {
            for chunk in [&b"the quick "[..], b"brown fox ", b"jumps"] {
                assert_eq!(stream.write(chunk).unwrap(), chunk.len());
            }
            stream.close();
        })
    };

    let mut sent = Vec::new();
    let mut fin = false;
    while !fin {
        match polls.recv_timeout(Duration::from_secs(1)) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => panic!("packetizer starved"),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while stream.has_data_for_writing() {
            let (data, send_fin) = stream.get_data_for_writing(4);
            if let Some(data) = data {
                sent.extend_from_slice(&data);
            }
            if send_fin {
                fin = true;
            }
        }
    }

    writer.join().unwrap();
    assert_eq!(sent, b"the quick brown fox jumps");
    assert_eq!(stream.write_offset(), sent.len() as u64);
}

#[test]
fn fin_rides_the_last_frame_after_close() {
    let (stream, _, polls, _) = new_stream();

    let writer = {
        let stream = stream.clone();
        thread::spawn(move || {
            assert_eq!(stream.write(b"x").unwrap(), 1);
            stream.close();
        })
    };

    wait_for_poll(&polls);
    let (data, send_fin) = stream.get_data_for_writing(10);
    assert_eq!(data.unwrap().as_ref(), b"x");
    writer.join().unwrap();

    let fin = if send_fin {
        // close already latched when the pull happened
        true
    } else {
        wait_for_poll(&polls);
        let (data, send_fin) = stream.get_data_for_writing(10);
        assert!(data.is_none());
        send_fin
    };
    assert!(fin);
    assert!(!stream.has_data_for_writing());

    // the read side reaches end-of-stream and the stream is done
    stream.close_remote(0);
    assert_eq!(stream.read(&mut [0u8; 4]).unwrap(), 0);
    assert!(stream.finished());
}

#[test]
fn local_reset_unblocks_writer_and_reader() {
    let (stream, session, polls, _) = new_stream();

    let writer = {
        let stream = stream.clone();
        thread::spawn(move || stream.write(b"longpayload"))
    };
    wait_for_poll(&polls);
    thread::sleep(Duration::from_millis(20));
    assert!(!writer.is_finished());

    stream.reset(5);
    let cause = StreamError::Reset(ResetStreamError::new(StreamId::new(4), 5));
    assert_eq!(writer.join().unwrap().unwrap_err(), cause);
    assert_eq!(stream.read(&mut [0u8; 4]).unwrap_err(), cause);
    assert_eq!(
        session.resets.lock().unwrap().as_slice(),
        &[(StreamId::new(4), 0)]
    );
    assert!(stream.context().is_cancelled());
}

#[test]
fn remote_reset_unblocks_writer_queue_stays_readable() {
    let (stream, session, polls, _) = new_stream();
    stream.add_stream_frame(frame(0, "ab", false)).unwrap();

    let writer = {
        let stream = stream.clone();
        thread::spawn(move || stream.write(b"pending"))
    };
    wait_for_poll(&polls);
    thread::sleep(Duration::from_millis(20));

    stream.register_remote_error(9, 2).unwrap();
    let cause = StreamError::Reset(ResetStreamError::new(StreamId::new(4), 9));
    assert_eq!(writer.join().unwrap().unwrap_err(), cause);
    assert_eq!(session.resets.lock().unwrap().len(), 1);

    // bytes queued ahead of the reset stay readable, then the cause lands
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"ab");
    assert_eq!(stream.read(&mut buf).unwrap_err(), cause);
    assert!(stream.finished());
}

#[test]
fn remote_reset_terminates_a_parked_reader() {
    let (stream, _, _, _) = new_stream();

    let reader = {
        let stream = stream.clone();
        thread::spawn(move || stream.read(&mut [0u8; 8]))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!reader.is_finished());

    stream.register_remote_error(3, 0).unwrap();
    assert_eq!(
        reader.join().unwrap().unwrap_err(),
        StreamError::Reset(ResetStreamError::new(StreamId::new(4), 3))
    );
}

#[test]
fn cancel_unblocks_a_parked_reader() {
    let (stream, _, _, _) = new_stream();

    let reader = {
        let stream = stream.clone();
        thread::spawn(move || stream.read(&mut [0u8; 8]))
    };
    thread::sleep(Duration::from_millis(20));

    let cause = TransportError::new(ErrorKind::Internal, "connection lost");
    stream.cancel(cause.clone());
    assert_eq!(
        reader.join().unwrap().unwrap_err(),
        StreamError::Connection(cause)
    );
    assert!(stream.finished());
}

#[test]
fn context_observes_termination_out_of_band() {
    let (stream, _, _, _) = new_stream();
    let ctx = stream.context();

    let observer = thread::spawn(move || ctx.wait());
    thread::sleep(Duration::from_millis(10));
    stream.close();
    observer.join().unwrap();
}

#[test]
fn io_traits_roundtrip() {
    use std::io::{Read, Write};

    let (stream, _, polls, _) = new_stream();
    stream.add_stream_frame(frame(0, "ping", true)).unwrap();

    let mut handle: &Stream = &stream;
    let mut buf = [0u8; 8];
    let n = Read::read(&mut handle, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(Read::read(&mut handle, &mut buf).unwrap(), 0, "EOF");

    let writer = {
        let stream = stream.clone();
        thread::spawn(move || {
            let mut handle: &Stream = &stream;
            Write::write(&mut handle, b"pong").unwrap()
        })
    };
    wait_for_poll(&polls);
    let (data, _) = stream.get_data_for_writing(16);
    assert_eq!(data.unwrap().as_ref(), b"pong");
    assert_eq!(writer.join().unwrap(), 4);
}

#[test]
fn flow_window_throttles_then_reopens() {
    let (session, polls) = Session::new();
    let flow = Accountant::with_send_window(4);
    let stream = Arc::new(Stream::new(
        StreamId::new(8),
        session,
        flow.clone(),
        Version::new(1),
    ));

    let writer = {
        let stream = stream.clone();
        thread::spawn(move || stream.write(b"abcdef"))
    };
    wait_for_poll(&polls);

    let (data, _) = stream.get_data_for_writing(16);
    assert_eq!(data.unwrap().as_ref(), b"abcd");
    assert!(stream.is_flow_control_blocked());
    assert_eq!(stream.get_data_for_writing(16), (None, false));

    stream.update_send_window(16);
    let (data, _) = stream.get_data_for_writing(16);
    assert_eq!(data.unwrap().as_ref(), b"ef");
    assert_eq!(writer.join().unwrap().unwrap(), 6);
    assert_eq!(flow.bytes_sent(), 6);
}

#[test]
fn reads_credit_the_flow_controller() {
    let polls = Arc::new(AtomicUsize::new(0));

    struct CountingSession(Arc<AtomicUsize>);
    impl StreamEvents for CountingSession {
        fn on_data(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_reset(&self, _: StreamId, _: u64) {}
    }

    let flow = Accountant::with_send_window(0);
    let stream = Stream::new(
        StreamId::new(4),
        Arc::new(CountingSession(polls.clone())),
        flow.clone(),
        Version::new(1),
    );

    stream.add_stream_frame(frame(0, "hello", false)).unwrap();
    assert_eq!(stream.read(&mut [0u8; 5]).unwrap(), 5);
    assert_eq!(flow.0.lock().unwrap().bytes_read, 5);
    // each delivery pokes the session so a window update can go out
    assert!(polls.load(Ordering::SeqCst) >= 1);
}
