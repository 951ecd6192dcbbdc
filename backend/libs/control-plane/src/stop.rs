use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Shared cooperative-cancellation flag.
///
/// Engines poll [`should_continue`](StopFlag::should_continue) at batch
/// boundaries and before network calls, and use
/// [`sleep`](StopFlag::sleep) for every long pause so stop requests cut
/// cool-downs short.
#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake every pending sleep.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn should_continue(&self) -> bool {
        !self.is_stopped()
    }

    /// Sleep for `duration` unless a stop arrives first.
    ///
    /// Returns true when the sleep was interrupted (or the flag was
    /// already set).
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = notified => true,
        }
    }
}
