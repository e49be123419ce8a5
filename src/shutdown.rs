use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Shared stop signal for the engine workers.
///
/// Workers sleep on it between cycles so that `stop()` interrupts the
/// transmitter's cadence sleep and the sweeper's timer immediately instead
/// of waiting out the remainder of an interval.
#[derive(Debug, Default)]
pub struct Shutdown {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signalled = self.signalled.lock().expect("shutdown lock poisoned");
        *signalled = true;
        self.condvar.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock().expect("shutdown lock poisoned")
    }

    /// Sleep for `duration` or until the signal fires, whichever comes
    /// first. Returns true if shutdown was signalled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let guard = self.signalled.lock().expect("shutdown lock poisoned");
        if *guard {
            return true;
        }
        let (guard, _timeout) = self
            .condvar
            .wait_timeout_while(guard, duration, |signalled| !*signalled)
            .expect("shutdown lock poisoned");
        *guard
    }
}
