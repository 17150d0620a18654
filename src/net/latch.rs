use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

/// One-shot signal. Once fired it stays fired; firing again is a no-op.
#[derive(Debug, Default)]
pub struct Latch {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the latch, waking every waiter. Returns `true` only for the call
    /// that actually fired it.
    pub fn fire(&self) -> bool {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        if *fired {
            return false;
        }
        *fired = true;
        self.cond.notify_all();
        true
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait(&self) {
        let fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        let _fired = self
            .cond
            .wait_while(fired, |fired| !*fired)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Waits up to `timeout`; returns whether the latch fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        let (fired, _) = self
            .cond
            .wait_timeout_while(fired, timeout, |fired| !*fired)
            .unwrap_or_else(PoisonError::into_inner);
        *fired
    }

    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        self.wait_timeout(deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn fires_once() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_fired());
    }

    #[test]
    fn wait_times_out_when_not_fired() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn wakes_waiters() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        latch.fire();
        assert!(waiter.join().unwrap());
    }
}
