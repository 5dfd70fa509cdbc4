//! Read gate: the single-permit backpressure point of the read loop.
//!
//! The engine pauses reading by returning `Ok(true)` from `feed_bytes` and
//! resumes it through `send_data(_, true)`. The read loop arms the gate
//! before each feed and disarms it when the engine does not ask to pause,
//! so a resume issued while the chunk is still being fed (from another
//! thread, or from inside `feed_bytes` itself) is never lost. The gate
//! holds at most one pending release: resuming a reader that is not armed
//! is a no-op, so the engine may pass `resume_read` as often as it likes.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Binary pause/resume gate between the read loop and the engine.
#[derive(Debug, Default)]
pub struct ReadGate {
    paused: AtomicBool,
    notify: Notify,
}

impl ReadGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate ahead of a feed. The next [`wait`](Self::wait) blocks
    /// until resumed unless [`disarm`](Self::disarm) runs first.
    pub fn arm(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Reopen an armed gate without waking anyone. Used when the engine
    /// declined to pause.
    pub fn disarm(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Reopen the gate.
    ///
    /// Returns `true` if the gate was paused. Redundant calls return `false`
    /// and change nothing.
    pub fn resume(&self) -> bool {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.notify.notify_one();
            true
        } else {
            false
        }
    }

    /// Whether the gate is currently closed.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wait until the gate is open. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking so a resume between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}
