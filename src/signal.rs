//! Wakeup primitives for the suspended reader and writer.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};

/// Single-slot coalescing wakeup.
///
/// `notify` never blocks; notifying an already-signalled `Signal` is a
/// no-op, so any number of state changes collapse into one pending wakeup.
/// `wait`/`wait_until` consume the pending wakeup. Every state change that
/// happens before a `notify` is observable to the waiter it wakes.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Non-blocking wakeup; coalesces with one already pending.
    pub(crate) fn notify(&self) {
        let mut raised = self.raised.lock().unwrap();
        *raised = true;
        self.cond.notify_one();
    }

    /// Block until notified, consuming the wakeup.
    pub(crate) fn wait(&self) {
        let mut raised = self.raised.lock().unwrap();
        while !*raised {
            raised = self.cond.wait(raised).unwrap();
        }
        *raised = false;
    }

    /// Block until notified or `deadline` passes. Returns `true` if the
    /// wakeup was consumed, `false` on timeout.
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut raised = self.raised.lock().unwrap();
        loop {
            if *raised {
                *raised = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            (raised, _) = self.cond.wait_timeout(raised, deadline - now).unwrap();
        }
    }
}

/// Cancellation handle for a stream, returned by [`Stream::context`].
///
/// Level-triggered: once cancelled it stays cancelled, and every clone
/// observes the same state. Cancelled by close, reset (local or remote)
/// and session abort; deadlines never cancel it.
///
/// [`Stream::context`]: crate::stream::Stream::context
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        let mut cancelled = self.0.cancelled.lock().unwrap();
        *cancelled = true;
        self.0.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.cancelled.lock().unwrap()
    }

    /// Block until the stream terminates.
    pub fn wait(&self) {
        let mut cancelled = self.0.cancelled.lock().unwrap();
        while !*cancelled {
            cancelled = self.0.cond.wait(cancelled).unwrap();
        }
    }
}
