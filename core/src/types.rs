use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A manual-reset event: waiters block until it is set, and it stays
/// set until explicitly reset.
#[derive(Debug, Default)]
pub struct SignalEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl SignalEvent {
    /// Sets the event and wakes all waiters.
    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    /// Clears the event; subsequent waits block again.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    /// Waits up to `timeout` for the event. Returns true if it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        if *state {
            return true;
        }
        let (state, _) = self.cond.wait_timeout(state, timeout).unwrap();
        *state
    }
}

/// Cancellation flag shared between the host thread and an in-flight
/// read stream; polled between runs on the streaming hot path.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
