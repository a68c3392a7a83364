//! Suspicion timer management.
//!
//! One timer per in-flight request, keyed by the request digest. A timer
//! is started when the request is accepted, canceled when the request
//! executes, and fires a suspicion signal into the control channel when
//! the primary sits on the request for too long.

use palisade_types::Digest;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Signals from timers to the view manager.
#[derive(Debug, Clone)]
pub enum Control {
    /// A request sat unexecuted past the suspicion timeout.
    Suspect { request: Digest },
}

/// Manages suspicion timers.
///
/// Each timer is a tokio task that sleeps for the timeout and then sends
/// [`Control::Suspect`]. Setting a timer for a digest that already has
/// one replaces it.
pub struct TimerManager {
    timers: HashMap<Digest, JoinHandle<()>>,
    control_tx: mpsc::Sender<Control>,
}

impl TimerManager {
    pub fn new(control_tx: mpsc::Sender<Control>) -> Self {
        Self {
            timers: HashMap::new(),
            control_tx,
        }
    }

    /// Start (or restart) the suspicion timer for a request.
    pub fn set(&mut self, request: Digest, timeout: Duration) {
        self.cancel(&request);

        let control_tx = self.control_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace!(%request, "Suspicion timer fired");
            let _ = control_tx.send(Control::Suspect { request }).await;
        });

        self.timers.insert(request, handle);
        trace!(%request, ?timeout, "Suspicion timer set");
    }

    /// Cancel the timer for a request. No-op if none is pending.
    pub fn cancel(&mut self, request: &Digest) {
        if let Some(handle) = self.timers.remove(request) {
            handle.abort();
            trace!(%request, "Suspicion timer canceled");
        }
    }

    /// Cancel every pending timer. Called on view adoption and shutdown.
    pub fn cancel_all(&mut self) {
        let count = self.timers.len();
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        if count > 0 {
            debug!(count = count, "All suspicion timers canceled");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[tokio::test]
    async fn test_timer_fires_with_request_digest() {
        let (control_tx, mut control_rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(control_tx);

        let digest = Digest::of(b"req");
        timers.set(digest, Duration::from_millis(10));

        let signal = tokio::time::timeout(Duration::from_millis(200), control_rx.recv())
            .await
            .expect("timer should fire")
            .expect("channel open");
        let Control::Suspect { request } = signal;
        assert_eq!(request, digest);
        assert_eq!(timers.active_count(), 1); // fired task handle remains until canceled
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let (control_tx, mut control_rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(control_tx);

        let digest = Digest::of(b"req");
        timers.set(digest, Duration::from_millis(20));
        timers.cancel(&digest);
        assert_eq!(timers.active_count(), 0);

        let raced = tokio::time::timeout(Duration::from_millis(80), control_rx.recv()).await;
        assert!(raced.is_err(), "canceled timer must not fire");
    }
}
